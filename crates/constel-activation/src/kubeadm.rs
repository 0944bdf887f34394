use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use constel_core::fs::HostFs;

/// Alphabet of bootstrap token characters.
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LENGTH: usize = 6;
const TOKEN_SECRET_LENGTH: usize = 16;

/// Everything `kubeadm join` needs for token discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTokenBundle {
    /// `host:port` of the API server.
    pub api_server_endpoint: String,
    pub token: String,
    /// `sha256:<hex>` pins of the cluster CA; never empty.
    pub ca_cert_hashes: Vec<String>,
}

/// Issues short-lived Kubernetes bootstrap tokens.
#[async_trait]
pub trait JoinTokenGetter: Send + Sync {
    async fn get_join_token(&self, ttl: Duration) -> Result<JoinTokenBundle>;
}

/// Registers a bootstrap token with the control plane.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn create_token(&self, token: &str, ttl: Duration, kubeconfig: &Path) -> Result<()>;
}

/// [`TokenMinter`] running `kubeadm token create`.
pub struct KubeadmCli {
    binary: PathBuf,
}

impl Default for KubeadmCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubeadm"),
        }
    }
}

impl KubeadmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl TokenMinter for KubeadmCli {
    async fn create_token(&self, token: &str, ttl: Duration, kubeconfig: &Path) -> Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("token")
            .arg("create")
            .arg(token)
            .arg("--ttl")
            .arg(format!("{}s", ttl.as_secs()))
            .arg("--kubeconfig")
            .arg(kubeconfig)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "kubeadm token create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

// ============================================================================
// admin.conf
// ============================================================================

#[derive(Debug, Deserialize)]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: ClusterInfo,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: Option<String>,
}

/// The parts of the admin kubeconfig used for token discovery.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub server: String,
    /// PEM of the cluster CA certificate.
    pub ca_pem: Vec<u8>,
}

/// Parse the first cluster of an admin kubeconfig.
pub fn parse_admin_conf(yaml: &str) -> Result<AdminConfig> {
    let config: KubeConfig =
        serde_yaml::from_str(yaml).with_context(|| "Failed to parse admin kubeconfig")?;
    let cluster = config
        .clusters
        .into_iter()
        .next()
        .map(|c| c.cluster)
        .with_context(|| "Admin kubeconfig lists no clusters")?;
    let ca_data = cluster
        .certificate_authority_data
        .filter(|d| !d.is_empty())
        .with_context(|| "Admin kubeconfig has no certificate-authority-data")?;
    let ca_pem = STANDARD
        .decode(ca_data.trim())
        .with_context(|| "certificate-authority-data is not valid base64")?;
    Ok(AdminConfig {
        server: cluster.server,
        ca_pem,
    })
}

/// `https://host:port/` → `host:port`.
pub fn api_server_endpoint(server: &str) -> String {
    let rest = server
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server);
    rest.trim_end_matches('/').to_string()
}

/// kubeadm discovery pin: `sha256:<hex of SHA-256 over the CA's SPKI>`.
pub fn ca_cert_hash(ca_pem: &[u8]) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(ca_pem)
        .map_err(|e| anyhow::anyhow!("Invalid CA PEM: {}", e))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow::anyhow!("Invalid CA certificate: {}", e))?;
    let digest = Sha256::digest(cert.public_key().raw);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("sha256:{}", hex))
}

/// Fresh bootstrap token `[a-z0-9]{6}.[a-z0-9]{16}`.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = |n: usize| -> String {
        (0..n)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    };
    let id = pick(TOKEN_ID_LENGTH);
    let secret = pick(TOKEN_SECRET_LENGTH);
    format!("{}.{}", id, secret)
}

// ============================================================================
// Getter
// ============================================================================

/// [`JoinTokenGetter`] backed by the control plane's admin kubeconfig.
///
/// The kubeconfig is read on every call, so a file written after the
/// service started is picked up.
pub struct Kubeadm {
    fs: HostFs,
    admin_conf_path: PathBuf,
    minter: Arc<dyn TokenMinter>,
}

impl Kubeadm {
    pub fn new(fs: HostFs, admin_conf_path: impl Into<PathBuf>, minter: Arc<dyn TokenMinter>) -> Self {
        Self {
            fs,
            admin_conf_path: admin_conf_path.into(),
            minter,
        }
    }
}

#[async_trait]
impl JoinTokenGetter for Kubeadm {
    async fn get_join_token(&self, ttl: Duration) -> Result<JoinTokenBundle> {
        let yaml = self.fs.read_to_string(&self.admin_conf_path).await?;
        let admin = parse_admin_conf(&yaml)
            .with_context(|| format!("Reading {}", self.admin_conf_path.display()))?;
        let hash = ca_cert_hash(&admin.ca_pem)?;
        debug!(ca_hash = %hash, "Computed CA pin");

        let token = generate_token();
        self.minter
            .create_token(&token, ttl, &self.fs.resolve(&self.admin_conf_path))
            .await
            .with_context(|| "Minting bootstrap token")?;
        info!(ttl_secs = ttl.as_secs(), "Bootstrap token created");

        Ok(JoinTokenBundle {
            api_server_endpoint: api_server_endpoint(&admin.server),
            token,
            ca_cert_hashes: vec![hash],
        })
    }
}
