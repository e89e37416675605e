mod error;
mod routes;
mod state;
mod ws;

use crate::state::AppState;
use blockdump::jobs::JobSettings;
use blockdump::scheduler::DumpScheduler;
use blockdump::utils::logger;
use blockdump::{Config, DumpStore, HttpClient, JobManager, RetryPolicy, RetryingClient};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "blockdump-server", version, about = "Dump and migrate remote block trees")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides configuration)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    logger::init(&config.log.level)?;
    tracing::info!("Starting blockdump server on port {}", config.server.port);

    if config.remote.token.is_empty() {
        tracing::warn!("No remote token configured, remote calls will be rejected");
    }

    let store = DumpStore::new(&config.storage.dump_root);
    store.ensure_root().await?;

    let client = RetryingClient::new(
        HttpClient::new(&config.remote)?,
        RetryPolicy::from_config(&config.remote),
    );
    let manager = JobManager::new(Arc::new(client), store, JobSettings::from_config(&config));

    // Initialize cron scheduler
    let scheduler = match DumpScheduler::new(manager.clone(), &config.schedule).await {
        Ok(s) => {
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let port = config.server.port;
    let state = Arc::new(AppState::new(config, manager.clone()));
    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }
    manager.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
