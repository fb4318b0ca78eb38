//! GG18 Party CLI
//!
//! Runs GG18 sessions from the command line:
//! - Distributed key generation
//! - Threshold signing
//!
//! By default every party of a session runs in this process. With
//! `--party-id` and `--session-id` only the listed parties run here, and the
//! rest are expected to join the same session from other processes through a
//! shared `sm-relay-svc` instance.
//!
//! With `--relay memory` rounds are exchanged in-process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gg18_client::{HttpCustodySync, RelayClient};
use gg18_core::{
    mpc::MEMORY_ENDPOINT, CoordinatorConfig, CustodyIdentity, KeyMaterial, LocalEngine,
    MemoryRelay, MessageDigest, MpcEngine, PartyId, SessionCoordinator, SessionId,
    ThresholdConfig, ThresholdSelector,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// GG18 Party - threshold ECDSA sessions
#[derive(Parser)]
#[command(name = "gg18-party")]
#[command(about = "GG18 threshold ECDSA keygen and signing")]
#[command(version)]
struct Cli {
    /// Relay service URL, or `memory` for an in-process relay
    #[arg(short, long, env = "RELAY_URL", default_value = "http://127.0.0.1:8000")]
    relay: String,

    /// Directory holding key material
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Custody service base URL (repeatable)
    #[arg(long = "custody-url", env = "CUSTODY_URL", value_delimiter = ',')]
    custody_urls: Vec<String>,

    /// User id reported to the custody service
    #[arg(long, env = "USER_ID")]
    user_id: Option<String>,

    /// Key name reported to the custody service
    #[arg(long, env = "KEY_NAME")]
    key_name: Option<String>,

    /// Per-round timeout
    #[arg(long, env = "ROUND_TIMEOUT_SECS", default_value = "120")]
    round_timeout_secs: u64,

    /// Run only these parties (comma-separated); the others join from elsewhere
    #[arg(long = "party-id", env = "PARTY_ID", value_delimiter = ',', requires = "session_id")]
    party_ids: Vec<PartyId>,

    /// Session id agreed by every process taking part
    #[arg(long, env = "SESSION_ID", requires = "party_ids")]
    session_id: Option<SessionId>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run distributed key generation
    Keygen {
        /// Threshold: any t+1 parties can sign
        #[arg(short, long)]
        t: usize,

        /// Number of parties
        #[arg(short, long)]
        n: usize,
    },

    /// Sign a digest with stored key material
    Sign {
        /// 32-byte digest, hex encoded
        #[arg(long, conflicts_with = "message", required_unless_present = "message")]
        digest: Option<String>,

        /// Message text, hashed with keccak256
        #[arg(short, long)]
        message: Option<String>,

        /// Signing party IDs (comma-separated); the first t+1 when omitted
        #[arg(short, long, value_delimiter = ',')]
        signers: Option<Vec<PartyId>>,
    },

    /// Show stored key material
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting session");
                cancel.cancel();
            }
        });
    }

    match &cli.command {
        Commands::Keygen { t, n } => run_keygen(&cli, *t, *n, &cancel).await,
        Commands::Sign {
            digest,
            message,
            signers,
        } => {
            let digest = match (digest, message) {
                (Some(hex), _) => MessageDigest::from_hex(hex)?,
                (None, Some(text)) => MessageDigest::keccak256(text.as_bytes()),
                (None, None) => anyhow::bail!("either --digest or --message is required"),
            };
            run_sign(&cli, digest, signers.as_deref(), &cancel).await
        }
        Commands::Info => show_info(&cli),
    }
}

fn coordinator(cli: &Cli) -> SessionCoordinator {
    let (engine, relay_addr): (Arc<dyn MpcEngine>, String) = if cli.relay == "memory" {
        (
            Arc::new(LocalEngine::new(Arc::new(MemoryRelay::new()))),
            MEMORY_ENDPOINT.to_string(),
        )
    } else {
        (
            Arc::new(LocalEngine::new(Arc::new(RelayClient::new(&cli.relay)))),
            cli.relay.clone(),
        )
    };

    let config = CoordinatorConfig {
        round_timeout_ms: cli.round_timeout_secs.saturating_mul(1000),
        identity: CustodyIdentity {
            user_id: cli.user_id.clone(),
            key_name: cli.key_name.clone(),
        },
        ..CoordinatorConfig::new(relay_addr)
    };

    let coordinator = SessionCoordinator::new(config, engine);
    if cli.custody_urls.is_empty() {
        coordinator
    } else {
        coordinator.with_sync(Arc::new(HttpCustodySync::new(&cli.custody_urls)))
    }
}

async fn run_keygen(cli: &Cli, t: usize, n: usize, cancel: &CancellationToken) -> Result<()> {
    let threshold = ThresholdConfig::new(t, n)?;
    info!(%threshold, relay = %cli.relay, parties = ?cli.party_ids, "Starting keygen");

    let coordinator = coordinator(cli);
    let outcome = match cli.session_id {
        Some(session_id) => {
            coordinator
                .join_keygen(session_id, threshold, &cli.party_ids, cancel)
                .await?
        }
        None => coordinator.run_keygen_cancellable(threshold, cancel).await?,
    };
    for warning in &outcome.warnings {
        warn!(party_id = warning.party_id, checkpoint = %warning.checkpoint, "{}", warning.message);
    }

    std::fs::create_dir_all(&cli.dest)?;
    for (party_id, key) in &outcome.key_materials {
        let path = key_material_path(&cli.dest, *party_id);
        std::fs::write(&path, serde_json::to_string_pretty(key)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(party_id, path = ?path, "Key material saved");
    }

    let address = outcome
        .address()
        .context("keygen produced no key material")?;
    println!("Session: {}", outcome.session_id);
    println!("Address: {}", address);

    Ok(())
}

async fn run_sign(
    cli: &Cli,
    digest: MessageDigest,
    signers: Option<&[PartyId]>,
    cancel: &CancellationToken,
) -> Result<()> {
    let key_materials = load_key_materials(&cli.dest)?;
    let threshold = key_materials
        .values()
        .next()
        .map(|key| key.config)
        .context("no key material found")?;

    info!(%threshold, %digest, ?signers, "Starting signing");

    let coordinator = coordinator(cli);
    let outcome = match cli.session_id {
        Some(session_id) => {
            // Every process must arrive at the same subset without seeing
            // the others' key material
            let everyone: Vec<PartyId> = (0..threshold.parties()).collect();
            let chosen = ThresholdSelector::new(threshold).select(&everyone, signers)?;
            coordinator
                .join_sign(
                    session_id,
                    threshold,
                    digest,
                    chosen.as_slice(),
                    &cli.party_ids,
                    &key_materials,
                    cancel,
                )
                .await?
        }
        None => {
            let eligible: Vec<PartyId> = key_materials.keys().copied().collect();
            let chosen = ThresholdSelector::new(threshold).select(&eligible, signers)?;
            coordinator
                .run_sign_cancellable(threshold, digest, chosen.as_slice(), &key_materials, cancel)
                .await?
        }
    };
    for warning in &outcome.warnings {
        warn!(party_id = warning.party_id, checkpoint = %warning.checkpoint, "{}", warning.message);
    }

    let signature = outcome.signature;
    println!("Signers: {:?}", outcome.signers);
    println!("Signature:");
    println!("  r: 0x{}", hex::encode(signature.r));
    println!("  s: 0x{}", hex::encode(signature.s));
    println!("  v: {}", signature.v);
    println!("Recovered: {}", signature.recover_address(&digest)?);

    Ok(())
}

fn show_info(cli: &Cli) -> Result<()> {
    let key_materials = load_key_materials(&cli.dest)?;
    let first = key_materials
        .values()
        .next()
        .context("no key material found")?;

    println!("Key Material:");
    println!("  Keygen session: {}", first.keygen_session);
    println!("  Threshold: {}", first.config);
    println!("  Address: {}", first.address);
    println!("  Public Key: {}", hex::encode(&first.public_key));
    println!("  Parties: {:?}", key_materials.keys().collect::<Vec<_>>());

    Ok(())
}

fn key_material_path(dest: &Path, party_id: PartyId) -> PathBuf {
    dest.join(format!("keymaterial.{}.json", party_id))
}

/// Load every `keymaterial.{i}.json` under `dest`
fn load_key_materials(dest: &Path) -> Result<BTreeMap<PartyId, KeyMaterial>> {
    let mut key_materials = BTreeMap::new();

    for entry in std::fs::read_dir(dest).with_context(|| format!("reading {}", dest.display()))? {
        let path = entry?.path();
        let is_key_material = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("keymaterial.") && name.ends_with(".json"));
        if !is_key_material {
            continue;
        }

        let json = std::fs::read_to_string(&path)?;
        let key: KeyMaterial = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", path.display()))?;
        key_materials.insert(key.party_id, key);
    }

    Ok(key_materials)
}
