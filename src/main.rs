//! `scanq` server binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use scanq::logging::init_logging;
use scanq::ScanqConfig;

/// Runs the job API and a worker pool in one process.
#[derive(Debug, Parser)]
#[command(name = "scanq", version, about)]
struct Cli {
    /// TOML config file (defaults to ./scanq.toml when present)
    #[arg(short, long, env = "SCANQ_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config
    #[arg(long)]
    bind: Option<String>,

    /// Worker loops in this process, overriding the config (0 = API only)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ScanqConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate().context("validating configuration")?;

    init_logging(config.log_format);
    scanq::app::run(config).await
}
