use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use constel_atls::{Validator, create_attestation_client_config};
use constel_core::config::DaemonConfig;
use constel_core::constants::{
    DEBUGD_PORT, IDENTITY_FILENAME, MASTER_SECRET_FILENAME, STATE_FILENAME,
};
use constel_core::crypto::{self, MASTER_SECRET_LENGTH_DEFAULT, MasterSecret};
use constel_core::fs::HostFs;
use constel_core::identity::IdFile;
use constel_core::observability::logging::{self, LogFormat};
use constel_debugd::cdbg::{self, DeployOptions};

use crate::ui;

#[derive(Parser)]
#[command(
    name = "constellation",
    version,
    about = "Node activation and debugd peer-bootstrap for Constellation clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // ---- Node daemons ----
    /// Run the debug daemon (peer bootstrapper sharing, info map, uploads)
    Debugd {
        /// Daemon config (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Node activation service
    Activation {
        #[command(subcommand)]
        action: ServeCmd,
    },
    /// State-disk key recovery service
    Recovery {
        #[command(subcommand)]
        action: ServeCmd,
    },

    // ---- Operator tooling ----
    /// Push the state-disk key to a node waiting in recovery
    Recover {
        /// Node address, `host` or `host:port`
        #[arg(long)]
        endpoint: String,
        /// UUID of the node's encrypted state disk
        #[arg(long)]
        disk_uuid: String,
        /// Base64 master secret file
        #[arg(long, default_value = MASTER_SECRET_FILENAME)]
        master_secret: PathBuf,
        /// Cluster state file naming the cloud provider
        #[arg(long, default_value = STATE_FILENAME)]
        state: PathBuf,
        /// Expected measurements of the node (JSON)
        #[arg(long)]
        measurements: PathBuf,
    },
    /// Debug cluster tooling
    Cdbg {
        #[command(subcommand)]
        action: CdbgCmd,
    },
    /// Master secret management
    Masterkey {
        #[command(subcommand)]
        action: MasterkeyCmd,
    },
    /// Cluster identity file management
    Identity {
        #[command(subcommand)]
        action: IdentityCmd,
    },
}

#[derive(Subcommand)]
enum ServeCmd {
    /// Run the service until interrupted
    Serve {
        /// Daemon config (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CdbgCmd {
    /// Upload a bootstrapper and info entries to debugd instances
    Deploy {
        /// Comma-separated debugd addresses
        #[arg(long, value_delimiter = ',', required = true)]
        ips: Vec<String>,
        /// Local bootstrapper binary
        #[arg(long)]
        bootstrapper: PathBuf,
        /// Info entry as key=value (repeatable)
        #[arg(long = "info")]
        info: Vec<String>,
        /// debugd port on every address
        #[arg(long, default_value_t = DEBUGD_PORT)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum MasterkeyCmd {
    /// Generate a fresh master secret file
    Generate {
        #[arg(long, default_value = MASTER_SECRET_FILENAME)]
        out: PathBuf,
        /// Secret length in bytes
        #[arg(long, default_value_t = MASTER_SECRET_LENGTH_DEFAULT)]
        length: usize,
    },
}

#[derive(Subcommand)]
enum IdentityCmd {
    /// Create the cluster identity file from a master secret
    Init {
        #[arg(long, default_value = MASTER_SECRET_FILENAME)]
        master_secret: PathBuf,
        #[arg(long, default_value = IDENTITY_FILENAME)]
        out: PathBuf,
    },
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // JSON for node daemons, human-readable for operator commands
    let log_format = match &cli.command {
        Commands::Debugd { .. } | Commands::Activation { .. } | Commands::Recovery { .. } => {
            LogFormat::Json
        }
        _ => LogFormat::Human,
    };
    logging::init(log_format);

    match cli.command {
        Commands::Debugd { config } => {
            let config = DaemonConfig::load(config.as_deref())?;
            block_on(constel_debugd::run(&config.debugd))
        }
        Commands::Activation {
            action: ServeCmd::Serve { config },
        } => {
            let config = DaemonConfig::load(config.as_deref())?;
            block_on(constel_activation::run(&config.activation, &config.attestation))
        }
        Commands::Recovery {
            action: ServeCmd::Serve { config },
        } => {
            let config = DaemonConfig::load(config.as_deref())?;
            block_on(constel_recovery::run(&config.recovery, &config.attestation))
        }
        Commands::Recover {
            endpoint,
            disk_uuid,
            master_secret,
            state,
            measurements,
        } => block_on(cmd_recover(
            &endpoint,
            &disk_uuid,
            &master_secret,
            &state,
            &measurements,
        )),
        Commands::Cdbg {
            action:
                CdbgCmd::Deploy {
                    ips,
                    bootstrapper,
                    info,
                    port,
                },
        } => cmd_cdbg_deploy(ips, bootstrapper, &info, port),
        Commands::Masterkey {
            action: MasterkeyCmd::Generate { out, length },
        } => block_on(cmd_masterkey_generate(&HostFs::host(), &out, length)),
        Commands::Identity {
            action: IdentityCmd::Init { master_secret, out },
        } => block_on(cmd_identity_init(&HostFs::host(), &master_secret, &out)),
    }
}

fn block_on<F: Future<Output = Result<()>>>(fut: F) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to start async runtime")?;
    rt.block_on(fut)
}

// ============================================================================
// Handlers
// ============================================================================

async fn cmd_recover(
    endpoint: &str,
    disk_uuid: &str,
    master_secret: &Path,
    state: &Path,
    measurements: &Path,
) -> Result<()> {
    let fs = HostFs::host();
    let secret = crypto::read_master_secret(&fs, master_secret).await?;
    let validator = constel_atls::measured::validator_for_state(&fs, state, measurements).await?;
    let tls = create_attestation_client_config(None, vec![validator as Arc<dyn Validator>]);

    ui::info(&format!("Pushing state disk key to {}...", endpoint));
    constel_recovery::client::recover(endpoint, &secret, disk_uuid, &tls).await?;
    ui::success("Pushed state disk key.");
    Ok(())
}

fn cmd_cdbg_deploy(
    ips: Vec<String>,
    bootstrapper: PathBuf,
    info: &[String],
    port: u16,
) -> Result<()> {
    let info = cdbg::parse_info_pairs(info)?;
    if info.is_empty() {
        ui::warn("No info entries given; log collection stays off.");
    }
    let mut opts = DeployOptions::new(ips, bootstrapper, info);
    opts.port = port;
    block_on(async move { cdbg::deploy(&opts).await })?;
    ui::success("Deployment complete.");
    Ok(())
}

async fn cmd_masterkey_generate(fs: &HostFs, out: &Path, length: usize) -> Result<()> {
    let secret = MasterSecret::generate(length)?;
    crypto::write_master_secret(fs, out, &secret).await?;
    ui::success(&format!("Master secret written to {}", out.display()));
    Ok(())
}

async fn cmd_identity_init(fs: &HostFs, master_secret: &Path, out: &Path) -> Result<()> {
    let secret = crypto::read_master_secret(fs, master_secret).await?;
    let id = IdFile::generate(&secret)?;
    id.store(fs, out).await?;
    ui::success(&format!("Identity written to {}", out.display()));
    Ok(())
}
