//! End-to-end keygen and signing sessions over the in-memory relay

use gg18_core::engine::async_trait;
use gg18_core::mpc::memory::MEMORY_ENDPOINT;
use gg18_core::{
    ConfigError, ContextParams, CoordinatorConfig, EngineError, ExternalSync, KeyMaterial,
    LocalEngine, MemoryRelay, MessageDigest, MpcEngine, PartyContext, PartyId, RoundOutput,
    SessionCoordinator, SessionError, SessionId, SessionKind, Stage, SyncError, SyncEvent,
    ThresholdConfig,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("gg18_core=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        relay_addr: MEMORY_ENDPOINT.to_string(),
        jitter_min_ms: 0,
        jitter_max_ms: 0,
        ..Default::default()
    }
}

fn local_engine() -> Arc<LocalEngine<MemoryRelay>> {
    Arc::new(LocalEngine::new(Arc::new(MemoryRelay::new())))
}

/// Keygen on a clean engine, handing back material for a (1, 3) key
async fn key_materials() -> BTreeMap<PartyId, KeyMaterial> {
    let coordinator = SessionCoordinator::new(config(), local_engine());
    coordinator
        .run_keygen(ThresholdConfig::new(1, 3).unwrap())
        .await
        .unwrap()
        .key_materials
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    KeygenContext(PartyId),
    SignContext(PartyId),
    Round(PartyId, SessionKind, u32),
}

/// Forwards to an inner engine, recording every call and optionally failing
/// or stalling one of them
struct TestEngine {
    inner: Arc<dyn MpcEngine>,
    calls: Mutex<Vec<Call>>,
    fail_at: Option<(PartyId, SessionKind, u32)>,
    stall_at: Option<(PartyId, SessionKind, u32)>,
}

impl TestEngine {
    fn new(inner: Arc<dyn MpcEngine>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_at: None,
            stall_at: None,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn rounds_of(&self, party_id: PartyId) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Round(p, _, round) if p == party_id => Some(round),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MpcEngine for TestEngine {
    async fn keygen_context(&self, params: &ContextParams) -> Result<PartyContext, EngineError> {
        self.calls.lock().unwrap().push(Call::KeygenContext(params.party_id));
        self.inner.keygen_context(params).await
    }

    async fn sign_context(
        &self,
        params: &ContextParams,
        key: &KeyMaterial,
        digest: &MessageDigest,
        signers: &[PartyId],
    ) -> Result<PartyContext, EngineError> {
        self.calls.lock().unwrap().push(Call::SignContext(params.party_id));
        self.inner.sign_context(params, key, digest, signers).await
    }

    async fn round(
        &self,
        kind: SessionKind,
        context: PartyContext,
        round: u32,
    ) -> Result<RoundOutput, EngineError> {
        let party_id = context.party_id();
        self.calls.lock().unwrap().push(Call::Round(party_id, kind, round));

        if self.fail_at == Some((party_id, kind, round)) {
            return Err(EngineError::Rejected("injected failure".into()));
        }
        if self.stall_at == Some((party_id, kind, round)) {
            std::future::pending::<()>().await;
        }
        self.inner.round(kind, context, round).await
    }

    async fn release_session(&self, session_id: &SessionId) {
        self.inner.release_session(session_id).await;
    }
}

struct FailingSync {
    calls: Mutex<usize>,
}

#[async_trait]
impl ExternalSync for FailingSync {
    async fn notify(&self, _event: &SyncEvent) -> Result<(), SyncError> {
        *self.calls.lock().unwrap() += 1;
        Err(SyncError::Transport("custody service unreachable".into()))
    }
}

#[tokio::test]
async fn test_keygen_produces_one_address() {
    init_tracing();
    for (t, n) in [(0, 1), (1, 2), (1, 3), (2, 4)] {
        let coordinator = SessionCoordinator::new(config(), local_engine());
        let threshold = ThresholdConfig::new(t, n).unwrap();
        let outcome = coordinator.run_keygen(threshold).await.unwrap();

        assert_eq!(outcome.key_materials.len(), n);
        let address = outcome.address().unwrap();
        for (party_id, key) in &outcome.key_materials {
            assert_eq!(key.party_id, *party_id);
            assert_eq!(key.address, address);
            assert_eq!(key.config, threshold);
            assert_eq!(key.keygen_session, outcome.session_id);
            assert_eq!(key.public_shares.len(), n);
        }
        assert!(outcome.warnings.is_empty());
    }
}

#[tokio::test]
async fn test_hello_eigen_scenario() {
    init_tracing();
    let engine = Arc::new(TestEngine::new(local_engine()));
    let coordinator = SessionCoordinator::new(config(), engine.clone());
    let threshold = ThresholdConfig::new(1, 3).unwrap();

    let keygen = coordinator.run_keygen(threshold).await.unwrap();
    let address = keygen.address().unwrap();

    let digest = MessageDigest::keccak256(b"Hello Eigen");
    let signed = coordinator
        .run_sign(threshold, digest, &[0, 1], &keygen.key_materials)
        .await
        .unwrap();
    assert_eq!(signed.signers, vec![0, 1]);
    assert_eq!(signed.signature.recover_address(&digest).unwrap(), address);
    assert!(signed.signature.v <= 1);

    let before = engine.calls().len();
    let err = coordinator
        .run_sign(threshold, digest, &[0], &keygen.key_materials)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::InsufficientParticipants {
            required: 2,
            available: 1
        }
    ));
    assert_eq!(engine.calls().len(), before);
}

#[tokio::test]
async fn test_every_large_enough_subset_signs() {
    let coordinator = SessionCoordinator::new(config(), local_engine());
    let threshold = ThresholdConfig::new(1, 3).unwrap();
    let keygen = coordinator.run_keygen(threshold).await.unwrap();
    let address = keygen.address().unwrap();
    let digest = MessageDigest::keccak256(b"subset");

    let subsets: [&[PartyId]; 4] = [&[0, 1], &[0, 2], &[2, 1], &[0, 1, 2]];
    for subset in subsets {
        let signed = coordinator
            .run_sign(threshold, digest, subset, &keygen.key_materials)
            .await
            .unwrap();
        assert_eq!(signed.signature.recover_address(&digest).unwrap(), address);
    }
}

#[tokio::test]
async fn test_rounds_run_in_order() {
    let engine = Arc::new(TestEngine::new(local_engine()));
    let coordinator = SessionCoordinator::new(config(), engine.clone());
    let threshold = ThresholdConfig::new(1, 3).unwrap();

    let keygen = coordinator.run_keygen(threshold).await.unwrap();
    for party_id in 0..3 {
        assert_eq!(engine.rounds_of(party_id), vec![1, 2, 3, 4, 5]);
    }
    let keygen_rounds: Vec<u32> = keygen
        .events
        .iter()
        .filter(|e| e.party_id == 0)
        .map(|e| e.round)
        .collect();
    assert_eq!(keygen_rounds, vec![1, 2, 3, 4, 5]);

    let calls_before = engine.calls().len();
    coordinator
        .run_sign(threshold, MessageDigest::keccak256(b"order"), &[1, 2], &keygen.key_materials)
        .await
        .unwrap();

    let sign_calls = &engine.calls()[calls_before..];
    assert!(sign_calls.contains(&Call::SignContext(1)));
    assert!(sign_calls.contains(&Call::SignContext(2)));
    assert!(!sign_calls.contains(&Call::SignContext(0)));
    for party_id in [1, 2] {
        let rounds: Vec<u32> = sign_calls
            .iter()
            .filter_map(|call| match call {
                Call::Round(p, SessionKind::Sign, round) if *p == party_id => Some(*round),
                _ => None,
            })
            .collect();
        assert_eq!(rounds, (0..=9).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_single_engine_failure_fails_keygen() {
    init_tracing();
    let mut engine = TestEngine::new(local_engine());
    engine.fail_at = Some((1, SessionKind::Keygen, 3));
    let coordinator = SessionCoordinator::new(config(), Arc::new(engine));

    let err = coordinator
        .run_keygen(ThresholdConfig::new(1, 3).unwrap())
        .await
        .unwrap_err();
    match err {
        SessionError::Engine { party, stage, source } => {
            assert_eq!(party, 1);
            assert_eq!(stage, Stage::Round(3));
            assert!(matches!(source, EngineError::Rejected(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_sync_failures_only_warn() {
    let sync = Arc::new(FailingSync {
        calls: Mutex::new(0),
    });
    let engine = Arc::new(TestEngine::new(local_engine()));
    let coordinator = SessionCoordinator::new(config(), engine.clone()).with_sync(sync.clone());
    let threshold = ThresholdConfig::new(1, 3).unwrap();

    let keygen = coordinator.run_keygen(threshold).await.unwrap();
    // start + five rounds + end, per party
    assert_eq!(keygen.warnings.len(), 3 * 7);
    assert_eq!(*sync.calls.lock().unwrap(), 3 * 7);
    assert_eq!(engine.rounds_of(2), vec![1, 2, 3, 4, 5]);

    let digest = MessageDigest::keccak256(b"Hello Eigen");
    let signed = coordinator
        .run_sign(threshold, digest, &[0, 2], &keygen.key_materials)
        .await
        .unwrap();
    assert_eq!(signed.warnings.len(), 2 * 12);
    assert_eq!(
        signed.signature.recover_address(&digest).unwrap(),
        keygen.address().unwrap()
    );
}

#[tokio::test]
async fn test_cancellation_aborts_session() {
    let mut engine = TestEngine::new(local_engine());
    engine.stall_at = Some((0, SessionKind::Keygen, 2));
    let coordinator = Arc::new(SessionCoordinator::new(config(), Arc::new(engine)));
    let cancel = CancellationToken::new();

    let task = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .run_keygen_cancellable(ThresholdConfig::new(1, 3).unwrap(), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Cancelled));
}

#[tokio::test]
async fn test_round_timeout_is_engine_error() {
    let mut engine = TestEngine::new(local_engine());
    engine.stall_at = Some((2, SessionKind::Keygen, 4));
    let config = CoordinatorConfig {
        round_timeout_ms: 500,
        ..config()
    };
    let coordinator = SessionCoordinator::new(config, Arc::new(engine));

    let err = coordinator
        .run_keygen(ThresholdConfig::new(1, 3).unwrap())
        .await
        .unwrap_err();
    assert!(err.is_engine_error());
    assert!(matches!(
        err,
        SessionError::Engine {
            source: EngineError::Timeout(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_mixed_key_material_rejected_before_rounds() {
    let engine = Arc::new(TestEngine::new(local_engine()));
    let coordinator = SessionCoordinator::new(config(), engine.clone());
    let threshold = ThresholdConfig::new(1, 3).unwrap();

    let first = coordinator.run_keygen(threshold).await.unwrap();
    let second = coordinator.run_keygen(threshold).await.unwrap();

    let mut mixed: BTreeMap<PartyId, KeyMaterial> = BTreeMap::new();
    mixed.insert(0, first.key_materials[&0].clone());
    mixed.insert(1, second.key_materials[&1].clone());

    let before = engine.calls().len();
    let err = coordinator
        .run_sign(threshold, MessageDigest::keccak256(b"mixed"), &[0, 1], &mixed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Config(ConfigError::KeyMaterialMismatch(_))
    ));
    assert_eq!(engine.calls().len(), before);
}

#[tokio::test]
async fn test_sign_with_selector_defaults_to_lowest_ids() {
    let coordinator = SessionCoordinator::new(config(), local_engine());
    let threshold = ThresholdConfig::new(2, 4).unwrap();
    let keygen = coordinator.run_keygen(threshold).await.unwrap();
    let digest = MessageDigest::keccak256(b"selector");

    let signed = coordinator
        .sign_with_selector(threshold, digest, None, &keygen.key_materials)
        .await
        .unwrap();
    assert_eq!(signed.signers, vec![0, 1, 2]);
    assert_eq!(
        signed.signature.recover_address(&digest).unwrap(),
        keygen.address().unwrap()
    );

    let err = coordinator
        .sign_with_selector(threshold, digest, Some(&[1, 3]), &keygen.key_materials)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InsufficientParticipants { .. }));
}

#[tokio::test]
async fn test_foreign_relay_fails_at_setup() {
    let config = CoordinatorConfig {
        relay_addr: "http://127.0.0.1:1".to_string(),
        ..config()
    };
    let coordinator = SessionCoordinator::new(config, local_engine());

    let err = coordinator
        .run_keygen(ThresholdConfig::new(1, 2).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Engine {
            stage: Stage::Setup,
            source: EngineError::Rejected(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_single_engine_failure_fails_signing() {
    init_tracing();
    let keys = key_materials().await;
    let relay = Arc::new(MemoryRelay::new());
    let mut engine = TestEngine::new(Arc::new(LocalEngine::new(relay.clone())));
    engine.fail_at = Some((1, SessionKind::Sign, 6));
    let engine = Arc::new(engine);
    let coordinator = SessionCoordinator::new(config(), engine.clone());

    let result = coordinator
        .run_sign(
            ThresholdConfig::new(1, 3).unwrap(),
            MessageDigest::keccak256(b"Hello Eigen"),
            &[0, 1],
            &keys,
        )
        .await;
    match result {
        Err(SessionError::Engine { party, stage, source }) => {
            assert_eq!(party, 1);
            assert_eq!(stage, Stage::Round(6));
            assert!(matches!(source, EngineError::Rejected(_)));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(outcome) => panic!("signature returned despite failure: {:?}", outcome.signature),
    }
    assert!(!engine.rounds_of(1).contains(&7));
    assert!(relay.is_empty());
}

#[tokio::test]
async fn test_cancellation_aborts_signing() {
    let keys = key_materials().await;
    let mut engine = TestEngine::new(local_engine());
    engine.stall_at = Some((0, SessionKind::Sign, 3));
    let engine = Arc::new(engine);
    let coordinator = Arc::new(SessionCoordinator::new(config(), engine.clone()));
    let cancel = CancellationToken::new();

    let task = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .run_sign_cancellable(
                    ThresholdConfig::new(1, 3).unwrap(),
                    MessageDigest::keccak256(b"cancelled"),
                    &[0, 2],
                    &keys,
                    &cancel,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Cancelled));
    assert!(!engine.rounds_of(0).contains(&4));
}

#[tokio::test]
async fn test_sign_round_timeout_is_engine_error() {
    let keys = key_materials().await;
    let mut engine = TestEngine::new(local_engine());
    engine.stall_at = Some((2, SessionKind::Sign, 8));
    let config = CoordinatorConfig {
        round_timeout_ms: 500,
        ..config()
    };
    let coordinator = SessionCoordinator::new(config, Arc::new(engine));

    let err = coordinator
        .run_sign(
            ThresholdConfig::new(1, 3).unwrap(),
            MessageDigest::keccak256(b"timeout"),
            &[1, 2],
            &keys,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Engine {
            stage: Stage::Round(_),
            source: EngineError::Timeout(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_finished_sessions_leave_relay_empty() {
    let relay = Arc::new(MemoryRelay::new());
    let coordinator = SessionCoordinator::new(config(), Arc::new(LocalEngine::new(relay.clone())));
    let threshold = ThresholdConfig::new(1, 3).unwrap();

    let keygen = coordinator.run_keygen(threshold).await.unwrap();
    assert!(relay.is_empty());

    coordinator
        .run_sign(threshold, MessageDigest::keccak256(b"cleanup"), &[0, 2], &keygen.key_materials)
        .await
        .unwrap();
    assert!(relay.is_empty());
}

#[tokio::test]
async fn test_parties_split_across_coordinators() {
    init_tracing();
    let relay = Arc::new(MemoryRelay::new());
    let first = SessionCoordinator::new(config(), Arc::new(LocalEngine::new(relay.clone())));
    let second = SessionCoordinator::new(config(), Arc::new(LocalEngine::new(relay.clone())));
    let threshold = ThresholdConfig::new(1, 3).unwrap();
    let cancel = CancellationToken::new();

    let session_id = SessionId::new_v4();
    let (left, right) = tokio::join!(
        first.join_keygen(session_id, threshold, &[0], &cancel),
        second.join_keygen(session_id, threshold, &[2, 1], &cancel),
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_eq!(left.key_materials.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(right.key_materials.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    let address = left.address().unwrap();
    assert_eq!(right.address().unwrap(), address);
    assert!(right.key_materials.values().all(|key| key.keygen_session == session_id));

    // Joined sessions leave the relay to whoever owns it
    assert!(relay.clear_session(&session_id) > 0);

    let digest = MessageDigest::keccak256(b"Hello Eigen");
    let sign_session = SessionId::new_v4();
    let signers = [0, 2];
    let (left, right) = tokio::join!(
        first.join_sign(sign_session, threshold, digest, &signers, &[0], &left.key_materials, &cancel),
        second.join_sign(sign_session, threshold, digest, &signers, &[2], &right.key_materials, &cancel),
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_eq!(left.session_id, sign_session);
    assert_eq!(left.signers, vec![0, 2]);
    assert_eq!(left.signature, right.signature);
    assert_eq!(left.signature.recover_address(&digest).unwrap(), address);
}

#[tokio::test]
async fn test_join_rejects_bad_local_parties() {
    let keys = key_materials().await;
    let engine = Arc::new(TestEngine::new(local_engine()));
    let coordinator = SessionCoordinator::new(config(), engine.clone());
    let threshold = ThresholdConfig::new(1, 3).unwrap();
    let cancel = CancellationToken::new();
    let digest = MessageDigest::keccak256(b"outsider");

    let err = coordinator
        .join_sign(SessionId::new_v4(), threshold, digest, &[0, 2], &[1], &keys, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Config(ConfigError::NotInSession(1))));

    let err = coordinator
        .join_keygen(SessionId::new_v4(), threshold, &[3], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Config(ConfigError::NotInSession(3))));

    let err = coordinator
        .join_keygen(SessionId::new_v4(), threshold, &[], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Config(ConfigError::NoLocalParties)));
    assert!(engine.calls().is_empty());
}
