//! `clusterrunner-manager` binary entry point (spec §6 CLI surface:
//! `manager --port P --eventlog-file F --config-file C`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clusterrunner_core::SystemClock;
use clusterrunner_manager::routes::build_router;
use clusterrunner_manager::{AppState, ManagerConfig};
use clusterrunner_store::BuildStore;

#[derive(Debug, Parser)]
#[command(name = "clusterrunner-manager")]
struct Args {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    eventlog_file: Option<PathBuf>,
    #[arg(long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let mut config = ManagerConfig::load(args.config_file.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(eventlog_file) = args.eventlog_file {
        config.eventlog_file = Some(eventlog_file);
    }
    std::fs::create_dir_all(&config.results_dir)?;

    let store = BuildStore::<SystemClock>::connect(&config.database_url).await?;
    let state = Arc::new(AppState::new(config, SystemClock::default(), store)?);

    let allocator = Arc::clone(&state.allocator);
    tokio::spawn(allocator.run());

    let port = state.config.port;
    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "clusterrunner-manager listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, marking in-flight builds failed");
            if let Err(e) = shutdown_state.store.clean_up().await {
                tracing::error!(error = %e, "failed to persist build store during shutdown");
            }
        })
        .await?;
    Ok(())
}
