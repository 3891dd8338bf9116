use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use sightings::replication::ReplicationClient;
use sightings::retention::RetentionManager;
use sightings::{Clock, Config, SightingsEngine, SystemClock};

#[derive(Debug, Parser)]
#[command(name = "sightingsd")]
#[command(about = "Privacy-preserving sighting-report server", long_about = None)]
struct Args {
    /// TOML configuration file; defaults apply for any omitted field.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sightings=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let port = config.port;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(SightingsEngine::open(config, Arc::clone(&clock))?);
    info!(
        server_name = engine.server_name(),
        directory = %engine.config().directory.display(),
        "engine loaded"
    );

    tokio::spawn(RetentionManager::new(Arc::clone(&engine), Arc::clone(&clock)).run());
    if !engine.config().servers.is_empty() {
        let replication = ReplicationClient::new(Arc::clone(&engine), Arc::clone(&clock))?;
        tokio::spawn(replication.run());
    }
    if engine.config().testing {
        spawn_reset_handler(Arc::clone(&engine))?;
    }

    let app = sightings::server::router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind port {port}"))?;
    info!(port, "listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("serve")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

/// SIGUSR1 reloads all state from disk; only wired up under the testing flag.
fn spawn_reset_handler(engine: Arc<SightingsEngine>) -> anyhow::Result<()> {
    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        .context("install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if let Err(err) = engine.reset() {
                warn!(%err, "reset failed");
            }
        }
    });
    Ok(())
}
