//! `clusterrunner-agent` binary (spec §4.M, §6 CLI surface: `worker
//! --manager-url H:P --port P --num-executors N ...`). A minimal
//! worker-side HTTP service, not a full subprocess execution engine.

use std::path::PathBuf;

use clap::Parser;
use clusterrunner_agent::build_router;
use clusterrunner_agent::state::AgentState;

#[derive(Debug, Parser)]
#[command(name = "clusterrunner-worker")]
struct Args {
    #[arg(long)]
    manager_url: Option<String>,
    #[arg(long, default_value_t = 43001)]
    port: u16,
    #[arg(long, default_value_t = 1)]
    num_executors: u32,
    #[arg(long)]
    results_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let session_id = nanoid::nanoid!();
    let results_root = args.results_dir.unwrap_or_else(|| std::env::temp_dir().join("clusterrunner-agent-results"));
    std::fs::create_dir_all(&results_root)?;

    let state = AgentState::new(session_id.clone(), results_root, args.manager_url.clone());

    if let Some(manager_url) = &args.manager_url {
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}", args.port);
        match client
            .post(format!("{manager_url}/worker"))
            .json(&serde_json::json!({
                "worker": url,
                "num_executors": args.num_executors,
                "session_id": session_id,
            }))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::info!("registered with manager at {manager_url}");
            }
            Ok(response) => {
                tracing::error!(status = %response.status(), "manager rejected worker registration");
                std::process::exit(1);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to reach manager for registration");
                std::process::exit(1);
            }
        }
    }

    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    tracing::info!(port = args.port, session_id, "clusterrunner-agent listening");

    let shutdown = state.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.shutdown.cancelled().await })
        .await?;
    Ok(())
}
