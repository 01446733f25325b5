//! `clusterrunner` CLI (spec §6): `manager`/`worker` re-exec the
//! sibling `clusterrunner-manager`/`clusterrunner-agent` binaries built
//! alongside this one; `stop`/`deploy` talk to a running manager over
//! its HTTP API via `clusterrunner_manager::Client`.

use std::path::PathBuf;
use std::process::Command;

use clap::{Parser, Subcommand};
use clusterrunner_manager::Client;

#[derive(Debug, Parser)]
#[command(name = "clusterrunner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the manager process.
    Manager {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        eventlog_file: Option<PathBuf>,
        #[arg(long)]
        config_file: Option<PathBuf>,
    },
    /// Run a worker (agent) process.
    Worker {
        #[arg(long)]
        manager_url: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        num_executors: Option<u32>,
        #[arg(long)]
        eventlog_file: Option<PathBuf>,
        #[arg(long)]
        config_file: Option<PathBuf>,
    },
    /// Gracefully shut down every worker registered with a manager.
    Stop {
        #[arg(long)]
        manager_url: String,
        #[arg(long, default_value = "")]
        secret: String,
    },
    /// Provision and start a worker on a remote host.
    Deploy {
        #[arg(long)]
        host: String,
    },
}

fn reexec_sibling(name: &str, forwarded_args: Vec<String>) -> anyhow::Result<i32> {
    let current = std::env::current_exe()?;
    let sibling = current.with_file_name(name);
    let status = Command::new(sibling).args(forwarded_args).status()?;
    Ok(status.code().unwrap_or(1))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Manager { port, eventlog_file, config_file } => {
            let mut args = Vec::new();
            if let Some(port) = port {
                args.extend(["--port".to_string(), port.to_string()]);
            }
            if let Some(f) = eventlog_file {
                args.extend(["--eventlog-file".to_string(), f.display().to_string()]);
            }
            if let Some(f) = config_file {
                args.extend(["--config-file".to_string(), f.display().to_string()]);
            }
            reexec_sibling("clusterrunner-manager", args)?
        }
        Commands::Worker { manager_url, port, num_executors, eventlog_file, config_file } => {
            let mut args = Vec::new();
            if let Some(url) = manager_url {
                args.extend(["--manager-url".to_string(), url]);
            }
            if let Some(port) = port {
                args.extend(["--port".to_string(), port.to_string()]);
            }
            if let Some(n) = num_executors {
                args.extend(["--num-executors".to_string(), n.to_string()]);
            }
            if let Some(f) = eventlog_file {
                args.extend(["--eventlog-file".to_string(), f.display().to_string()]);
            }
            if let Some(f) = config_file {
                args.extend(["--config-file".to_string(), f.display().to_string()]);
            }
            reexec_sibling("clusterrunner-agent", args)?
        }
        Commands::Stop { manager_url, secret } => {
            let client = Client::new(manager_url, secret);
            match client.graceful_shutdown_all_workers().await {
                Ok(_) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "stop failed");
                    1
                }
            }
        }
        Commands::Deploy { host } => {
            // No SSH/provisioning automation here; this documents the
            // expected entry point rather than performing a rollout.
            println!("deploy: provisioning {host} is not automated by this CLI; start clusterrunner-agent there manually and point it at your manager with --manager-url");
            0
        }
    };

    std::process::exit(exit_code);
}
