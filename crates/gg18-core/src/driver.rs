//! Drives one party through its round schedule

use crate::context::{Artifact, PartyContext, RoundOutput};
use crate::engine::{ContextParams, MpcEngine, SessionKind};
use crate::error::{EngineError, SessionError, Stage, SyncError};
use crate::sync::{Checkpoint, CustodyIdentity, ExternalSync, SyncEvent, SyncWarning};
use crate::types::{KeyMaterial, MessageDigest, PartyId, SessionId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What a driver is asked to produce
#[derive(Debug, Clone)]
pub enum DriverPlan {
    Keygen,
    Sign {
        key: KeyMaterial,
        digest: MessageDigest,
        /// Full, sorted signer subset
        signers: Vec<PartyId>,
    },
}

impl DriverPlan {
    pub fn kind(&self) -> SessionKind {
        match self {
            DriverPlan::Keygen => SessionKind::Keygen,
            DriverPlan::Sign { .. } => SessionKind::Sign,
        }
    }
}

/// Timing and identity a driver runs with
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub round_timeout: Duration,
    pub sync_timeout: Duration,
    /// Delay before context creation
    pub jitter: Duration,
    pub identity: CustodyIdentity,
}

/// How a single round ended for one party
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Continued,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundEvent {
    pub session_id: SessionId,
    pub party_id: PartyId,
    pub kind: SessionKind,
    pub round: u32,
    pub outcome: RoundOutcome,
}

/// Everything a party produced on success
#[derive(Debug)]
pub struct DriverReport {
    pub party_id: PartyId,
    pub artifact: Artifact,
    pub warnings: Vec<SyncWarning>,
    pub events: Vec<RoundEvent>,
}

/// Runs one party's rounds in strict order against the engine
pub struct RoundDriver {
    engine: Arc<dyn MpcEngine>,
    sync: Arc<dyn ExternalSync>,
    params: ContextParams,
    plan: DriverPlan,
    settings: DriverSettings,
}

impl RoundDriver {
    pub fn new(
        engine: Arc<dyn MpcEngine>,
        sync: Arc<dyn ExternalSync>,
        params: ContextParams,
        plan: DriverPlan,
        settings: DriverSettings,
    ) -> Self {
        Self {
            engine,
            sync,
            params,
            plan,
            settings,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.plan.kind()
    }

    pub fn party_id(&self) -> PartyId {
        self.params.party_id
    }

    /// Run every round. Cancelling the token drops the context and returns
    /// [`SessionError::Cancelled`].
    #[instrument(skip_all, fields(
        session_id = %self.params.session_id,
        party_id = self.params.party_id,
        kind = %self.kind(),
    ))]
    pub async fn run(self, cancel: CancellationToken) -> Result<DriverReport, SessionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Party cancelled");
                Err(SessionError::Cancelled)
            }
            result = self.drive() => result,
        }
    }

    async fn drive(&self) -> Result<DriverReport, SessionError> {
        let kind = self.kind();
        let terminal = kind.terminal_round();
        let mut warnings = Vec::new();
        let mut events = Vec::new();

        if !self.settings.jitter.is_zero() {
            tokio::time::sleep(self.settings.jitter).await;
        }

        info!("Party starting");
        self.notify(Checkpoint::SessionStart, &mut warnings).await;
        let mut context = self
            .create_context()
            .await
            .map_err(|source| self.fail(Stage::Setup, source))?;

        for round in kind.rounds() {
            self.notify(Checkpoint::Round(round), &mut warnings).await;

            let output = match self.advance(context, round).await {
                Ok(output) => output,
                Err(source) => {
                    events.push(self.event(round, RoundOutcome::Failed(source.to_string())));
                    return Err(self.fail(Stage::Round(round), source));
                }
            };

            match output {
                RoundOutput::Continue(next) if round < terminal => {
                    events.push(self.event(round, RoundOutcome::Continued));
                    context = next;
                }
                RoundOutput::Done(artifact) if round == terminal => {
                    self.check_artifact(&artifact)
                        .map_err(|source| self.fail(Stage::Round(round), source))?;
                    events.push(self.event(round, RoundOutcome::Completed));
                    self.notify(Checkpoint::SessionEnd, &mut warnings).await;
                    info!(warnings = warnings.len(), "Party completed");
                    return Ok(DriverReport {
                        party_id: self.party_id(),
                        artifact,
                        warnings,
                        events,
                    });
                }
                RoundOutput::Continue(_) => {
                    return Err(self.fail(Stage::Round(round), EngineError::MissingArtifact));
                }
                RoundOutput::Done(_) => {
                    return Err(self.fail(Stage::Round(round), EngineError::PrematureArtifact));
                }
            }
        }

        Err(self.fail(Stage::Round(terminal), EngineError::MissingArtifact))
    }

    /// Run one engine round on a context owned by this party
    pub async fn advance(
        &self,
        context: PartyContext,
        round: u32,
    ) -> Result<RoundOutput, EngineError> {
        if context.session_id() != self.params.session_id
            || context.party_id() != self.params.party_id
            || context.kind() != self.kind()
        {
            return Err(EngineError::ForeignContext);
        }

        let call = self.engine.round(self.kind(), context, round);
        match timeout(self.settings.round_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.settings.round_timeout)),
        }
    }

    async fn create_context(&self) -> Result<PartyContext, EngineError> {
        let call = async {
            match &self.plan {
                DriverPlan::Keygen => self.engine.keygen_context(&self.params).await,
                DriverPlan::Sign {
                    key,
                    digest,
                    signers,
                } => {
                    self.engine
                        .sign_context(&self.params, key, digest, signers)
                        .await
                }
            }
        };
        let context = match timeout(self.settings.round_timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::Timeout(self.settings.round_timeout)),
        };

        if context.session_id() != self.params.session_id
            || context.party_id() != self.params.party_id
        {
            return Err(EngineError::ForeignContext);
        }
        Ok(context)
    }

    fn check_artifact(&self, artifact: &Artifact) -> Result<(), EngineError> {
        match (&self.plan, artifact) {
            (DriverPlan::Keygen, Artifact::Key(key)) if key.party_id == self.party_id() => Ok(()),
            (DriverPlan::Keygen, Artifact::Key(_)) => Err(EngineError::ForeignContext),
            (DriverPlan::Sign { .. }, Artifact::Signature(_)) => Ok(()),
            _ => Err(EngineError::WrongArtifact),
        }
    }

    /// Best-effort notification; failures only become warnings
    async fn notify(&self, checkpoint: Checkpoint, warnings: &mut Vec<SyncWarning>) {
        let event = self.sync_event(checkpoint);
        let result = match timeout(self.settings.sync_timeout, self.sync.notify(&event)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.settings.sync_timeout)),
        };

        if let Err(e) = result {
            warn!(%checkpoint, error = %e, "Custody notification failed");
            warnings.push(SyncWarning {
                party_id: self.party_id(),
                checkpoint,
                message: e.to_string(),
            });
        }
    }

    fn sync_event(&self, checkpoint: Checkpoint) -> SyncEvent {
        let (digest, user_address) = match &self.plan {
            DriverPlan::Keygen => (None, None),
            DriverPlan::Sign { key, digest, .. } => (Some(*digest), Some(key.address)),
        };
        SyncEvent {
            kind: self.kind(),
            session_id: self.params.session_id,
            party_id: self.party_id(),
            checkpoint,
            config: self.params.config,
            identity: self.settings.identity.clone(),
            digest,
            user_address,
        }
    }

    fn event(&self, round: u32, outcome: RoundOutcome) -> RoundEvent {
        debug!(round, ?outcome, "Round finished");
        RoundEvent {
            session_id: self.params.session_id,
            party_id: self.party_id(),
            kind: self.kind(),
            round,
            outcome,
        }
    }

    fn fail(&self, stage: Stage, source: EngineError) -> SessionError {
        error!(%stage, error = %source, "Party failed");
        SessionError::Engine {
            party: self.party_id(),
            stage,
            source,
        }
    }
}
