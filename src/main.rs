use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datagate::config::GatewayConfig;
use datagate::gateway::{spawn_retention_sweep, AppState, FsDataStore, GatewayServer, GatewayState};
use datagate::ratelimit::InMemoryUsageLog;

/// Tiered data access gateway.
#[derive(Debug, Parser)]
#[command(name = "datagate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Dataset directory, overrides `data.root`
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Datagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(root) = args.data_root {
        config.data.root = root;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        data_root = %config.data.root.display(),
        endpoints = config.rate_limiting.endpoints.len(),
        tokens = config.security.tokens.len(),
        "Configuration loaded"
    );

    let usage_log = Arc::new(InMemoryUsageLog::new());
    let store = Arc::new(FsDataStore::new(config.data.root.clone()));
    let state: AppState = Arc::new(GatewayState::from_config(&config, usage_log, store)?);

    let sweeper = spawn_retention_sweep(state.rate_limiter().clone(), config.sweep_interval());

    #[cfg(unix)]
    if let Some(path) = args.config.clone() {
        tokio::spawn(reload_on_hangup(state.clone(), path));
    }

    GatewayServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Datagate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "datagate=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(true))
            .init();
    }
}

/// Reload endpoint rules from the configuration file on SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(state: AppState, path: PathBuf) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match GatewayConfig::load(Some(&path)).and_then(|c| c.endpoint_registry()) {
            Ok(registry) => state.reload_endpoints(registry),
            Err(e) => warn!(error = %e, "Keeping previous endpoint rules"),
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
