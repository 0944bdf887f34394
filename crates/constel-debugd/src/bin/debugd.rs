use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use constel_core::config::DaemonConfig;
use constel_core::observability::logging::{self, LogFormat};

#[derive(Parser)]
#[command(name = "debugd", about = "Constellation debug daemon")]
struct Cli {
    /// Daemon config (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Json);

    let config = DaemonConfig::load(cli.config.as_deref())?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(constel_debugd::run(&config.debugd))
}
