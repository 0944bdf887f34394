use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::constants;

/// Node daemon configuration loaded from TOML.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working configuration for a standard node image.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub debugd: DebugdSection,
    #[serde(default)]
    pub activation: ActivationSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub attestation: AttestationSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebugdSection {
    #[serde(default = "default_debugd_listen")]
    pub listen: SocketAddr,
    /// Port dialled on discovered peers.
    #[serde(default = "default_debugd_port")]
    pub peer_port: u16,
    #[serde(default = "default_bootstrapper_path")]
    pub bootstrapper_path: PathBuf,
    #[serde(default = "default_bootstrapper_unit")]
    pub bootstrapper_unit: String,
    #[serde(default = "default_discover_interval")]
    pub discover_interval_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationSection {
    #[serde(default = "default_activation_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,
    #[serde(default = "default_admin_conf_path")]
    pub admin_conf_path: PathBuf,
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: PathBuf,
    #[serde(default = "default_master_secret_path")]
    pub master_secret_path: PathBuf,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_recovery_listen")]
    pub listen: SocketAddr,
    /// Encrypted block device holding the state partition.
    #[serde(default = "default_state_device")]
    pub state_device: PathBuf,
    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationSection {
    /// Expected measurements as JSON (`{"<pcr>": "<hex>"}`).
    #[serde(default = "default_measurements_path")]
    pub measurements_path: PathBuf,
    /// Overrides `CONSTEL_CSP` for attestation variant selection.
    #[serde(default)]
    pub provider: Option<String>,
}

fn default_debugd_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], constants::DEBUGD_PORT))
}
fn default_debugd_port() -> u16 {
    constants::DEBUGD_PORT
}
fn default_bootstrapper_path() -> PathBuf {
    PathBuf::from(constants::BOOTSTRAPPER_DEPLOY_PATH)
}
fn default_bootstrapper_unit() -> String {
    constants::BOOTSTRAPPER_UNIT.to_string()
}
fn default_discover_interval() -> u64 {
    constants::DISCOVER_DEBUGD_INTERVAL.as_secs()
}
fn default_retry_backoff() -> u64 {
    constants::BOOTSTRAPPER_DOWNLOAD_RETRY_BACKOFF.as_secs()
}
fn default_chunk_size() -> usize {
    constants::CHUNK_SIZE
}
fn default_activation_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], constants::ACTIVATION_PORT))
}
fn default_identity_path() -> PathBuf {
    PathBuf::from(constants::ACTIVATION_ID_FILENAME)
}
fn default_admin_conf_path() -> PathBuf {
    PathBuf::from(constants::ADMIN_CONF_FILENAME)
}
fn default_ca_cert_path() -> PathBuf {
    PathBuf::from(constants::KUBERNETES_CA_CERT_FILENAME)
}
fn default_ca_key_path() -> PathBuf {
    PathBuf::from(constants::KUBERNETES_CA_KEY_FILENAME)
}
fn default_master_secret_path() -> PathBuf {
    PathBuf::from(constants::NODE_MASTER_SECRET_FILENAME)
}
fn default_token_ttl() -> u64 {
    constants::JOIN_TOKEN_TTL.as_secs()
}
fn default_request_deadline() -> u64 {
    constants::ACTIVATION_REQUEST_DEADLINE.as_secs()
}
fn default_recovery_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], constants::RECOVERY_PORT))
}
fn default_state_device() -> PathBuf {
    PathBuf::from("/dev/disk/by-partlabel/state")
}
fn default_mapper_name() -> String {
    constants::STATE_DISK_MAPPER_NAME.to_string()
}
fn default_measurements_path() -> PathBuf {
    PathBuf::from("/etc/constellation/measurements.json")
}

impl Default for DebugdSection {
    fn default() -> Self {
        Self {
            listen: default_debugd_listen(),
            peer_port: default_debugd_port(),
            bootstrapper_path: default_bootstrapper_path(),
            bootstrapper_unit: default_bootstrapper_unit(),
            discover_interval_secs: default_discover_interval(),
            retry_backoff_secs: default_retry_backoff(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for ActivationSection {
    fn default() -> Self {
        Self {
            listen: default_activation_listen(),
            identity_path: default_identity_path(),
            admin_conf_path: default_admin_conf_path(),
            ca_cert_path: default_ca_cert_path(),
            ca_key_path: default_ca_key_path(),
            master_secret_path: default_master_secret_path(),
            token_ttl_secs: default_token_ttl(),
            request_deadline_secs: default_request_deadline(),
        }
    }
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            listen: default_recovery_listen(),
            state_device: default_state_device(),
            mapper_name: default_mapper_name(),
        }
    }
}

impl Default for AttestationSection {
    fn default() -> Self {
        Self {
            measurements_path: default_measurements_path(),
            provider: None,
        }
    }
}

/// Longest join token lifetime accepted in config.
const MAX_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

impl DaemonConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read daemon config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse daemon config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.debugd.chunk_size == 0 {
            anyhow::bail!("debugd.chunk_size must be greater than zero");
        }
        if self.debugd.discover_interval_secs == 0 {
            anyhow::bail!("debugd.discover_interval_secs must be greater than zero");
        }
        if self.activation.token_ttl_secs == 0
            || Duration::from_secs(self.activation.token_ttl_secs) > MAX_TOKEN_TTL
        {
            anyhow::bail!(
                "activation.token_ttl_secs must be between 1 and {}",
                MAX_TOKEN_TTL.as_secs()
            );
        }
        if self.activation.request_deadline_secs == 0 {
            anyhow::bail!("activation.request_deadline_secs must be greater than zero");
        }
        crate::naming::validate_unit_name(&self.debugd.bootstrapper_unit)?;
        Ok(())
    }
}

impl DebugdSection {
    pub fn discover_interval(&self) -> Duration {
        Duration::from_secs(self.discover_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl ActivationSection {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}
