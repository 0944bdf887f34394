use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs::HostFs;

/// Environment variable selecting the cloud provider on a node.
pub const CSP_ENV: &str = "CONSTEL_CSP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Azure,
    Gcp,
    Aws,
    Qemu,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::Gcp => "gcp",
            Self::Aws => "aws",
            Self::Qemu => "qemu",
        }
    }

    /// Provider named by `CONSTEL_CSP`, if set and recognized.
    pub fn from_env() -> Option<Self> {
        std::env::var(CSP_ENV).ok()?.parse().ok()
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            "aws" => Ok(Self::Aws),
            "qemu" => Ok(Self::Qemu),
            other => anyhow::bail!("Unknown cloud provider: {:?}", other),
        }
    }
}

/// Persisted CLI state. Only `cloudProvider` is interpreted here; all other
/// fields are kept opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstellationState {
    #[serde(rename = "cloudProvider")]
    pub cloud_provider: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConstellationState {
    pub async fn load(fs: &HostFs, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs.read(path).await?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse state file {}", path.display()))
    }

    pub fn provider(&self) -> Result<CloudProvider> {
        self.cloud_provider.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_case_insensitive() {
        assert_eq!("GCP".parse::<CloudProvider>().unwrap(), CloudProvider::Gcp);
        assert_eq!("Azure".parse::<CloudProvider>().unwrap(), CloudProvider::Azure);
        assert_eq!(" qemu ".parse::<CloudProvider>().unwrap(), CloudProvider::Qemu);
        assert!("invalid".parse::<CloudProvider>().is_err());
    }

    #[test]
    fn test_state_keeps_unknown_fields() {
        let state: ConstellationState =
            serde_json::from_str(r#"{"cloudProvider":"AWS","name":"c1"}"#).unwrap();
        assert_eq!(state.provider().unwrap(), CloudProvider::Aws);
        assert_eq!(state.extra["name"], "c1");
    }

    #[test]
    fn test_state_invalid_provider() {
        let state: ConstellationState =
            serde_json::from_str(r#"{"cloudProvider":"invalid"}"#).unwrap();
        assert!(state.provider().is_err());
    }
}
