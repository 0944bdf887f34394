use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, MasterSecret};
use crate::fs::HostFs;
use crate::protocol::base64_bytes;

/// Cluster identity persisted on every control-plane node.
///
/// Written once at cluster creation; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdFile {
    #[serde(rename = "cluster", with = "base64_bytes")]
    pub cluster_id: Vec<u8>,
    #[serde(rename = "owner", with = "base64_bytes")]
    pub owner_id: Vec<u8>,
}

impl IdFile {
    /// Fresh identity: random cluster ID, owner ID derived from the secret.
    pub fn generate(secret: &MasterSecret) -> Result<Self> {
        Ok(Self {
            cluster_id: crypto::generate_random_bytes(crypto::RNG_LENGTH_DEFAULT),
            owner_id: secret.derive_owner_id()?,
        })
    }

    pub fn parse(s: &[u8]) -> Result<Self> {
        serde_json::from_slice(s).with_context(|| "Failed to parse identity file")
    }

    pub async fn load(fs: &HostFs, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs.read(path).await?;
        Self::parse(&data).with_context(|| format!("Invalid identity file {}", path.display()))
    }

    /// Write the identity file (mode 0644), refusing to overwrite.
    pub async fn store(&self, fs: &HostFs, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if fs.exists(path).await {
            anyhow::bail!("Identity file {} already exists", path.display());
        }
        let data = serde_json::to_vec_pretty(self).with_context(|| "Failed to serialize identity")?;
        fs.write(path, &data, 0o644).await
    }
}
