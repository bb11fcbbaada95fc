//! ChainGov CLI: validate a deployment descriptor, boot its data products
//! from history, and keep them live.
//!
//! # Commands
//! ```text
//! chaingov check --config deployment.yaml
//! chaingov boot  --config deployment.yaml [--archive-dir ./archive] [--rpc-url https://…]
//! chaingov run   --config deployment.yaml [--archive-dir ./archive] [--rpc-url https://…]
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use chaingov_core::config::{ArchiveConfig, RpcConfig};
use chaingov_core::DeploymentConfig;
use chaingov_feed::{build, Deployment, Governance};

mod logging;

#[derive(Parser)]
#[command(
    name = "chaingov",
    about = "Live governance state (balances, delegations, proposals, votes) from chain events",
    version
)]
struct Cli {
    /// Override the descriptor's log level, e.g. "debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a deployment descriptor and print the streams it plans
    Check {
        /// Path to the deployment YAML
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Load history from the archive-tier sources, then print product summaries
    Boot(SourceArgs),

    /// Boot, then follow the live sources until Ctrl-C
    Run(SourceArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// Path to the deployment YAML
    #[arg(short, long)]
    config: PathBuf,
    /// Archive directory (overrides `feed.archive.dir`)
    #[arg(long)]
    archive_dir: Option<PathBuf>,
    /// JSON-RPC endpoint (overrides `feed.rpc.url`)
    #[arg(long)]
    rpc_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => cmd_check(&config),
        Commands::Boot(args) => {
            let config = load(&args, cli.log_level.as_deref())?;
            cmd_boot(&config).await
        }
        Commands::Run(args) => {
            let config = load(&args, cli.log_level.as_deref())?;
            cmd_run(&config).await
        }
    }
}

/// Read the descriptor, apply flag overrides and start logging.
fn load(args: &SourceArgs, log_level: Option<&str>) -> Result<DeploymentConfig> {
    let mut config = DeploymentConfig::load(&args.config)
        .with_context(|| format!("load deployment '{}'", args.config.display()))?;

    if let Some(dir) = &args.archive_dir {
        config.feed.archive = Some(ArchiveConfig { dir: dir.clone() });
    }
    if let Some(url) = &args.rpc_url {
        match &mut config.feed.rpc {
            Some(rpc) => rpc.url = url.clone(),
            None => config.feed.rpc = Some(RpcConfig::new(url.clone())),
        }
    }
    if let Some(level) = log_level {
        config.log.level = level.to_string();
    }

    logging::init_tracing(&config.log);
    Ok(config)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn summaries(deployment: &Deployment) -> Vec<serde_json::Value> {
    deployment.chains.iter().map(|g| g.summary()).collect()
}

// ─── Command implementations ─────────────────────────────────────────────────

fn cmd_check(path: &Path) -> Result<()> {
    let config = DeploymentConfig::load(path)
        .with_context(|| format!("load deployment '{}'", path.display()))?;

    let chains: Vec<_> = config
        .chains
        .iter()
        .map(|chain| {
            let streams: Vec<String> = Governance::for_chain(chain)
                .streams()
                .iter()
                .map(ToString::to_string)
                .collect();
            json!({ "chain_id": chain.chain_id, "streams": streams })
        })
        .collect();

    let sources: Vec<&str> = [
        config.feed.archive.as_ref().map(|_| "archive"),
        config.feed.rpc.as_ref().map(|_| "rpc"),
        config.feed.database.as_ref().map(|_| "database"),
        config.feed.ws.as_ref().map(|_| "ws"),
    ]
    .into_iter()
    .flatten()
    .collect();

    print_json(&json!({ "valid": true, "sources": sources, "chains": chains }))
}

async fn cmd_boot(config: &DeploymentConfig) -> Result<()> {
    let mut deployment = build(config)?;
    let status = deployment.feed.boot().await?;

    for (stream, reason) in status.failed_streams() {
        warn!(%stream, %reason, "stream failed during boot");
    }
    print_json(&json!({ "status": status, "chains": summaries(&deployment) }))
}

async fn cmd_run(config: &DeploymentConfig) -> Result<()> {
    let mut deployment = build(config)?;

    let shutdown = deployment.feed.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping after the current item");
            shutdown.trigger();
        }
    });

    let status = deployment.feed.run().await?;
    print_json(&json!({ "status": status, "chains": summaries(&deployment) }))
}
