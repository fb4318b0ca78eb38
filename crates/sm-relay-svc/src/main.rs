//! State-Machine Relay Service
//!
//! HTTP service through which GG18 parties exchange round messages.

use anyhow::Result;
use clap::Parser;
use sm_relay::MessageStore;
use sm_relay_svc::{router, spawn_cleanup, AppState};
use std::time::Duration;
use tracing::{info, Level};

/// State-machine relay CLI arguments
#[derive(Parser, Debug)]
#[command(name = "sm-relay-svc")]
#[command(about = "State-machine relay for GG18 keygen and signing sessions")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "LISTEN", default_value = "0.0.0.0:8000")]
    listen: String,

    /// Message TTL in seconds
    #[arg(long, env = "MESSAGE_TTL", default_value = "3600")]
    ttl: i64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value = "60")]
    cleanup_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.ttl > 0, "message TTL must be positive");
    let store = MessageStore::new(args.ttl)?;

    info!(
        listen = %args.listen,
        ttl = args.ttl,
        "Starting state-machine relay"
    );

    spawn_cleanup(store.clone(), Duration::from_secs(args.cleanup_interval.max(1)));
    let app = router(AppState::new(store));

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}
