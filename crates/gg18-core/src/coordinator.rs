//! Multi-party keygen and signing sessions
//!
//! The coordinator spawns one [`RoundDriver`] per party into a `JoinSet` and
//! waits for all of them. The first failure, or the caller's cancellation
//! token, aborts every remaining party.

use crate::context::Artifact;
use crate::driver::{DriverPlan, DriverReport, DriverSettings, RoundDriver, RoundEvent};
use crate::engine::{ContextParams, MpcEngine};
use crate::error::{ConfigError, SessionError};
use crate::selector::{check_subset, ThresholdSelector};
use crate::sync::{CustodyIdentity, ExternalSync, NoopSync, SyncWarning};
use crate::types::{EthAddress, KeyMaterial, MessageDigest, PartyId, SessionId, Signature, ThresholdConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Session-scoped settings supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Shared relay address handed to every context
    pub relay_addr: String,
    pub round_timeout_ms: u64,
    /// Upper bound for one custody notification
    pub sync_timeout_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub identity: CustodyIdentity,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            relay_addr: "http://127.0.0.1:8000".to_string(),
            round_timeout_ms: 120_000,
            sync_timeout_ms: 10_000,
            jitter_min_ms: 100,
            jitter_max_ms: 500,
            identity: CustodyIdentity::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            ..Default::default()
        }
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Random start delay in `[jitter_min, jitter_max]`
    pub fn jitter(&self) -> Duration {
        if self.jitter_max_ms <= self.jitter_min_ms {
            return Duration::from_millis(self.jitter_min_ms);
        }
        let ms = rand::thread_rng().gen_range(self.jitter_min_ms..=self.jitter_max_ms);
        Duration::from_millis(ms)
    }

    fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            round_timeout: self.round_timeout(),
            sync_timeout: self.sync_timeout(),
            jitter: self.jitter(),
            identity: self.identity.clone(),
        }
    }
}

/// Result of a successful keygen
#[derive(Debug)]
pub struct KeygenOutcome {
    pub session_id: SessionId,
    pub key_materials: BTreeMap<PartyId, KeyMaterial>,
    pub warnings: Vec<SyncWarning>,
    pub events: Vec<RoundEvent>,
}

impl KeygenOutcome {
    /// Address shared by every party's key material
    pub fn address(&self) -> Option<EthAddress> {
        self.key_materials.values().next().map(|key| key.address)
    }
}

/// Result of a successful signing session
#[derive(Debug)]
pub struct SignOutcome {
    pub session_id: SessionId,
    pub signature: Signature,
    pub signers: Vec<PartyId>,
    pub warnings: Vec<SyncWarning>,
    pub events: Vec<RoundEvent>,
}

/// Runs keygen and signing sessions across all local parties
pub struct SessionCoordinator {
    config: CoordinatorConfig,
    engine: Arc<dyn MpcEngine>,
    sync: Arc<dyn ExternalSync>,
}

impl SessionCoordinator {
    pub fn new(config: CoordinatorConfig, engine: Arc<dyn MpcEngine>) -> Self {
        Self {
            config,
            engine,
            sync: Arc::new(NoopSync),
        }
    }

    /// Replace the default no-op custody notifier
    pub fn with_sync(mut self, sync: Arc<dyn ExternalSync>) -> Self {
        self.sync = sync;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn run_keygen(&self, threshold: ThresholdConfig) -> Result<KeygenOutcome, SessionError> {
        self.run_keygen_cancellable(threshold, &CancellationToken::new())
            .await
    }

    /// Full-n keygen: every party 0..n runs here. The relay's copy of the
    /// session is released afterwards.
    #[instrument(skip_all, fields(threshold = %threshold))]
    pub async fn run_keygen_cancellable(
        &self,
        threshold: ThresholdConfig,
        cancel: &CancellationToken,
    ) -> Result<KeygenOutcome, SessionError> {
        let session_id = SessionId::new_v4();
        let local: Vec<PartyId> = (0..threshold.parties()).collect();

        let result = self.keygen_session(session_id, threshold, &local, cancel).await;
        self.engine.release_session(&session_id).await;
        result
    }

    /// Drive only the `local` parties of a keygen session whose id was
    /// agreed out of band. The other parties run in other processes against
    /// the same relay.
    #[instrument(skip_all, fields(threshold = %threshold, session_id = %session_id))]
    pub async fn join_keygen(
        &self,
        session_id: SessionId,
        threshold: ThresholdConfig,
        local: &[PartyId],
        cancel: &CancellationToken,
    ) -> Result<KeygenOutcome, SessionError> {
        let members: Vec<PartyId> = (0..threshold.parties()).collect();
        let local = check_local(&members, local)?;
        self.keygen_session(session_id, threshold, &local, cancel).await
    }

    async fn keygen_session(
        &self,
        session_id: SessionId,
        threshold: ThresholdConfig,
        local: &[PartyId],
        cancel: &CancellationToken,
    ) -> Result<KeygenOutcome, SessionError> {
        info!(%session_id, ?local, "Starting keygen session");

        let plans = local
            .iter()
            .map(|party_id| (*party_id, DriverPlan::Keygen))
            .collect();
        let reports = self.run_parties(session_id, threshold, plans, cancel).await?;

        let (warnings, events) = merge_logs(&reports);
        let mut key_materials = BTreeMap::new();
        for (party_id, report) in reports {
            match report.artifact {
                Artifact::Key(key) => {
                    key_materials.insert(party_id, key);
                }
                Artifact::Signature(_) => {
                    return Err(SessionError::InconsistentResults(format!(
                        "party {} returned a signature from keygen",
                        party_id
                    )))
                }
            }
        }
        check_keygen_results(session_id, &key_materials)?;

        info!(
            %session_id,
            address = %key_materials.values().next().map(|k| k.address.to_string()).unwrap_or_default(),
            warnings = warnings.len(),
            "Keygen session completed"
        );
        Ok(KeygenOutcome {
            session_id,
            key_materials,
            warnings,
            events,
        })
    }

    pub async fn run_sign(
        &self,
        threshold: ThresholdConfig,
        digest: MessageDigest,
        subset: &[PartyId],
        key_materials: &BTreeMap<PartyId, KeyMaterial>,
    ) -> Result<SignOutcome, SessionError> {
        self.run_sign_cancellable(threshold, digest, subset, key_materials, &CancellationToken::new())
            .await
    }

    /// Sign `digest` with exactly the parties in `subset`, all of them local
    #[instrument(skip_all, fields(threshold = %threshold, digest = %digest))]
    pub async fn run_sign_cancellable(
        &self,
        threshold: ThresholdConfig,
        digest: MessageDigest,
        subset: &[PartyId],
        key_materials: &BTreeMap<PartyId, KeyMaterial>,
        cancel: &CancellationToken,
    ) -> Result<SignOutcome, SessionError> {
        let (signers, local) = validate_sign_request(threshold, subset, subset, key_materials)?;
        let session_id = SessionId::new_v4();

        let result = self
            .sign_session(session_id, threshold, digest, signers, &local, key_materials, cancel)
            .await;
        self.engine.release_session(&session_id).await;
        result
    }

    /// Drive the `local` members of a signing session shared with other
    /// processes. Only the local parties need key material.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(threshold = %threshold, digest = %digest, session_id = %session_id))]
    pub async fn join_sign(
        &self,
        session_id: SessionId,
        threshold: ThresholdConfig,
        digest: MessageDigest,
        signers: &[PartyId],
        local: &[PartyId],
        key_materials: &BTreeMap<PartyId, KeyMaterial>,
        cancel: &CancellationToken,
    ) -> Result<SignOutcome, SessionError> {
        let (signers, local) = validate_sign_request(threshold, signers, local, key_materials)?;
        self.sign_session(session_id, threshold, digest, signers, &local, key_materials, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn sign_session(
        &self,
        session_id: SessionId,
        threshold: ThresholdConfig,
        digest: MessageDigest,
        signers: Vec<PartyId>,
        local: &[PartyId],
        key_materials: &BTreeMap<PartyId, KeyMaterial>,
        cancel: &CancellationToken,
    ) -> Result<SignOutcome, SessionError> {
        let address = local
            .first()
            .and_then(|party_id| key_materials.get(party_id))
            .map(|key| key.address)
            .ok_or(ConfigError::NoLocalParties)?;
        info!(%session_id, ?signers, ?local, "Starting signing session");

        let plans = local
            .iter()
            .map(|party_id| {
                let plan = DriverPlan::Sign {
                    key: key_materials[party_id].clone(),
                    digest,
                    signers: signers.clone(),
                };
                (*party_id, plan)
            })
            .collect();
        let reports = self.run_parties(session_id, threshold, plans, cancel).await?;

        let (warnings, events) = merge_logs(&reports);
        let mut produced = Vec::with_capacity(reports.len());
        for (party_id, report) in &reports {
            match &report.artifact {
                Artifact::Signature(sig) => produced.push((*party_id, *sig)),
                Artifact::Key(_) => {
                    return Err(SessionError::InconsistentResults(format!(
                        "party {} returned key material from signing",
                        party_id
                    )))
                }
            }
        }
        let (_, signature) = *produced.first().ok_or_else(|| {
            SessionError::InconsistentResults("no party produced a signature".into())
        })?;
        if let Some((party_id, _)) = produced.iter().find(|(_, sig)| *sig != signature) {
            return Err(SessionError::InconsistentResults(format!(
                "party {} produced a different signature",
                party_id
            )));
        }

        match signature.recover_address(&digest) {
            Ok(recovered) if recovered == address => {}
            Ok(recovered) => {
                return Err(SessionError::InconsistentResults(format!(
                    "signature recovers to {} instead of {}",
                    recovered, address
                )))
            }
            Err(e) => {
                return Err(SessionError::InconsistentResults(format!(
                    "signature does not recover: {}",
                    e
                )))
            }
        }

        info!(%session_id, %address, "Signing session completed");
        Ok(SignOutcome {
            session_id,
            signature,
            signers,
            warnings,
            events,
        })
    }

    /// Pick the signers with [`ThresholdSelector`], then sign
    pub async fn sign_with_selector(
        &self,
        threshold: ThresholdConfig,
        digest: MessageDigest,
        explicit: Option<&[PartyId]>,
        key_materials: &BTreeMap<PartyId, KeyMaterial>,
    ) -> Result<SignOutcome, SessionError> {
        let eligible: Vec<PartyId> = key_materials.keys().copied().collect();
        let signers = ThresholdSelector::new(threshold).select(&eligible, explicit)?;
        self.run_sign(threshold, digest, signers.as_slice(), key_materials)
            .await
    }

    async fn run_parties(
        &self,
        session_id: SessionId,
        threshold: ThresholdConfig,
        plans: Vec<(PartyId, DriverPlan)>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<PartyId, DriverReport>, SessionError> {
        let session_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (party_id, plan) in plans {
            let params = ContextParams {
                relay_addr: self.config.relay_addr.clone(),
                session_id,
                party_id,
                config: threshold,
            };
            let driver = RoundDriver::new(
                self.engine.clone(),
                self.sync.clone(),
                params,
                plan,
                self.config.driver_settings(),
            );
            let token = session_cancel.clone();
            tasks.spawn(async move { (party_id, driver.run(token).await) });
        }

        let mut reports = BTreeMap::new();
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(%session_id, "Session cancelled");
                    session_cancel.cancel();
                    tasks.abort_all();
                    return Err(SessionError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((party_id, Ok(report))) => {
                    reports.insert(party_id, report);
                }
                Ok((party_id, Err(err))) => {
                    error!(%session_id, party_id, error = %err, "Aborting session");
                    session_cancel.cancel();
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    session_cancel.cancel();
                    tasks.abort_all();
                    return Err(SessionError::Task(join_err.to_string()));
                }
            }
        }

        Ok(reports)
    }
}

/// Local parties must be a non-empty, duplicate-free part of `members`.
/// Returns them sorted.
fn check_local(members: &[PartyId], local: &[PartyId]) -> Result<Vec<PartyId>, SessionError> {
    if local.is_empty() {
        return Err(ConfigError::NoLocalParties.into());
    }
    let mut unique = BTreeSet::new();
    for party_id in local {
        if !unique.insert(*party_id) {
            return Err(ConfigError::DuplicateParty(*party_id).into());
        }
        if !members.contains(party_id) {
            return Err(ConfigError::NotInSession(*party_id).into());
        }
    }
    Ok(unique.into_iter().collect())
}

/// Checks run before any engine call. Returns the sorted signer list and
/// the sorted local parties.
fn validate_sign_request(
    threshold: ThresholdConfig,
    subset: &[PartyId],
    local: &[PartyId],
    key_materials: &BTreeMap<PartyId, KeyMaterial>,
) -> Result<(Vec<PartyId>, Vec<PartyId>), SessionError> {
    let signers = check_subset(threshold, subset, |p| p < threshold.parties())?;
    let local = check_local(&signers, local)?;

    let mut reference: Option<&KeyMaterial> = None;
    for party_id in &local {
        let key = key_materials
            .get(party_id)
            .ok_or(ConfigError::MissingKeyMaterial(*party_id))?;

        if key.party_id != *party_id {
            return Err(ConfigError::KeyMaterialMismatch(format!(
                "material stored for party {} belongs to party {}",
                party_id, key.party_id
            ))
            .into());
        }
        if key.config != threshold {
            return Err(ConfigError::KeyMaterialMismatch(format!(
                "party {} holds material for {}, session asks for {}",
                party_id, key.config, threshold
            ))
            .into());
        }
        match reference {
            None => reference = Some(key),
            Some(first) => {
                if first.keygen_session != key.keygen_session || first.public_key != key.public_key {
                    return Err(ConfigError::KeyMaterialMismatch(format!(
                        "parties {} and {} come from different keygen sessions",
                        first.party_id, party_id
                    ))
                    .into());
                }
            }
        }
    }

    Ok((signers, local))
}

/// Every local party's material must describe one key
fn check_keygen_results(
    session_id: SessionId,
    key_materials: &BTreeMap<PartyId, KeyMaterial>,
) -> Result<(), SessionError> {
    let mut keys = key_materials.values();
    let Some(first) = keys.next() else {
        return Err(SessionError::InconsistentResults("no key material produced".into()));
    };

    for key in key_materials.values() {
        if key.keygen_session != session_id {
            return Err(SessionError::InconsistentResults(format!(
                "party {} returned material for another session",
                key.party_id
            )));
        }
    }
    for key in keys {
        if key.public_key != first.public_key || key.address != first.address {
            return Err(SessionError::InconsistentResults(format!(
                "parties {} and {} derived different public keys",
                first.party_id, key.party_id
            )));
        }
    }
    Ok(())
}

fn merge_logs(reports: &BTreeMap<PartyId, DriverReport>) -> (Vec<SyncWarning>, Vec<RoundEvent>) {
    let warnings = reports
        .values()
        .flat_map(|report| report.warnings.iter().cloned())
        .collect();
    let events = reports
        .values()
        .flat_map(|report| report.events.iter().cloned())
        .collect();
    (warnings, events)
}
