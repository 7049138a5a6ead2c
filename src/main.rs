//! Cloaker server
//!
//! Routes visitors to a target or a safe page based on a bot score.

use anyhow::{Context, Result};
use clap::Parser;
use cloaker::{server, Cloaker, CloakerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cloaker-server")]
#[command(author, version, about = "Visitor classification and routing server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Include X-Cloaker-Score/X-Cloaker-Decision headers in responses
    #[arg(long)]
    debug_headers: bool,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

fn load_config(path: &Path) -> Result<CloakerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => CloakerConfig::default(),
    };
    if args.debug_headers {
        config.debug_headers = true;
    }

    if config.challenge.token_secret == CloakerConfig::default().challenge.token_secret {
        tracing::warn!("Using the default challenge token secret; set challenge.token_secret");
    }
    if config.targets.allow_url.is_none() || config.targets.block_url.is_none() {
        tracing::warn!(
            safe_default = %config.targets.safe_default_url,
            "Redirect targets incomplete; missing ones fall back to the safe default"
        );
    }

    let cloaker = Cloaker::new(config).context("invalid configuration")?;

    info!(
        listen = %args.listen,
        block_max = cloaker.config().thresholds.block_max,
        challenge_max = cloaker.config().thresholds.challenge_max,
        "Starting cloaker"
    );

    server::run_server(args.listen, Arc::new(cloaker)).await
}
