use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use constel_core::config::AttestationSection;
use constel_core::fs::HostFs;
use constel_core::protocol::base64_bytes;
use constel_core::state::{CSP_ENV, CloudProvider, ConstellationState};

use crate::attestation::{Issuer, Oid, Validator};
use crate::watcher::Updater;

/// Measured-boot register index → hex digest.
pub type Measurements = BTreeMap<u32, String>;

/// Attestation variant OID for documents produced on `provider`.
pub fn provider_oid(provider: CloudProvider) -> Oid {
    match provider {
        CloudProvider::Gcp => &[1, 3, 9900, 1, 1],
        CloudProvider::Aws => &[1, 3, 9900, 2, 1],
        CloudProvider::Qemu => &[1, 3, 9900, 3, 1],
        CloudProvider::Azure => &[1, 3, 9900, 4, 1],
    }
}

/// Read a measurements JSON file (`{"4": "<hex>", ...}`).
pub fn load_measurements(fs: &HostFs, path: &Path) -> Result<Measurements> {
    let data = std::fs::read(fs.resolve(path))
        .with_context(|| format!("Failed to read measurements {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse measurements {}", path.display()))
}

#[derive(Debug, Serialize, Deserialize)]
struct MeasuredDocument {
    measurements: Measurements,
    #[serde(with = "base64_bytes")]
    user_data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    nonce: Vec<u8>,
}

/// Issues documents reporting a fixed set of boot measurements.
pub struct MeasuredIssuer {
    oid: Oid,
    measurements: Measurements,
}

impl MeasuredIssuer {
    pub fn new(provider: CloudProvider, measurements: Measurements) -> Self {
        Self {
            oid: provider_oid(provider),
            measurements,
        }
    }
}

impl Issuer for MeasuredIssuer {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let doc = MeasuredDocument {
            measurements: self.measurements.clone(),
            user_data: user_data.to_vec(),
            nonce: nonce.to_vec(),
        };
        serde_json::to_vec(&doc).with_context(|| "Failed to serialize attestation document")
    }
}

/// Accepts documents whose measurements include every expected value.
///
/// Expected values can be reloaded from disk through [`Updater::update`].
pub struct MeasuredValidator {
    oid: Oid,
    expected: RwLock<Measurements>,
    source: Option<(HostFs, PathBuf)>,
}

impl MeasuredValidator {
    pub fn new(provider: CloudProvider, expected: Measurements) -> Self {
        Self {
            oid: provider_oid(provider),
            expected: RwLock::new(expected),
            source: None,
        }
    }

    /// Validator whose expectations come from (and reload from) a file.
    pub fn from_file(provider: CloudProvider, fs: HostFs, path: PathBuf) -> Result<Self> {
        let expected = load_measurements(&fs, &path)?;
        Ok(Self {
            oid: provider_oid(provider),
            expected: RwLock::new(expected),
            source: Some((fs, path)),
        })
    }

    pub fn expected(&self) -> Measurements {
        match self.expected.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Validator for MeasuredValidator {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn validate(&self, doc: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let doc: MeasuredDocument =
            serde_json::from_slice(doc).with_context(|| "Malformed attestation document")?;
        if doc.nonce != nonce {
            anyhow::bail!("Attestation document nonce mismatch");
        }
        for (index, want) in self.expected() {
            match doc.measurements.get(&index) {
                Some(got) if got.eq_ignore_ascii_case(&want) => {}
                Some(got) => anyhow::bail!(
                    "Measurement {} mismatch: expected {}, got {}",
                    index,
                    want,
                    got
                ),
                None => anyhow::bail!("Measurement {} missing from document", index),
            }
        }
        Ok(doc.user_data)
    }
}

impl Updater for MeasuredValidator {
    fn update(&self) -> Result<()> {
        let Some((fs, path)) = &self.source else {
            return Ok(());
        };
        let fresh = load_measurements(fs, path)?;
        info!(path = %path.display(), count = fresh.len(), "Reloaded expected measurements");
        match self.expected.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        Ok(())
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Attestation variant of this node: the config override, else `CONSTEL_CSP`.
pub fn node_provider(section: &AttestationSection) -> Result<CloudProvider> {
    if let Some(name) = &section.provider {
        return name.parse();
    }
    CloudProvider::from_env().with_context(|| {
        format!(
            "No attestation provider configured and {} is unset or unknown",
            CSP_ENV
        )
    })
}

/// Issuer reporting this node's boot measurements.
pub fn node_issuer(fs: &HostFs, section: &AttestationSection) -> Result<Arc<dyn Issuer>> {
    let provider = node_provider(section)?;
    let measurements = load_measurements(fs, &section.measurements_path)?;
    info!(provider = %provider, count = measurements.len(), "Attestation issuer ready");
    Ok(Arc::new(MeasuredIssuer::new(provider, measurements)))
}

/// Validator for a cluster created by the CLI, keyed by the provider in
/// its state file.
pub async fn validator_for_state(
    fs: &HostFs,
    state_path: &Path,
    measurements_path: &Path,
) -> Result<Arc<MeasuredValidator>> {
    let state = ConstellationState::load(fs, state_path).await?;
    let provider = state
        .provider()
        .with_context(|| format!("Invalid cloud provider in {}", state_path.display()))?;
    let validator =
        MeasuredValidator::from_file(provider, fs.clone(), measurements_path.to_path_buf())?;
    Ok(Arc::new(validator))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurements(pairs: &[(u32, &str)]) -> Measurements {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_issue_then_validate() {
        let m = measurements(&[(4, "aa"), (8, "bb"), (9, "cc")]);
        let issuer = MeasuredIssuer::new(CloudProvider::Qemu, m.clone());
        let validator = MeasuredValidator::new(CloudProvider::Qemu, measurements(&[(4, "AA")]));
        assert_eq!(issuer.oid(), validator.oid());

        let doc = issuer.issue(b"pubkey-hash", b"nonce").unwrap();
        let user_data = validator.validate(&doc, b"nonce").unwrap();
        assert_eq!(user_data, b"pubkey-hash");
    }

    #[test]
    fn test_validate_rejects_wrong_nonce() {
        let issuer = MeasuredIssuer::new(CloudProvider::Gcp, Measurements::new());
        let validator = MeasuredValidator::new(CloudProvider::Gcp, Measurements::new());
        let doc = issuer.issue(b"data", b"nonce-a").unwrap();
        assert!(validator.validate(&doc, b"nonce-b").is_err());
    }

    #[test]
    fn test_validate_rejects_measurement_mismatch() {
        let issuer = MeasuredIssuer::new(CloudProvider::Aws, measurements(&[(4, "aa")]));
        let validator = MeasuredValidator::new(CloudProvider::Aws, measurements(&[(4, "ab")]));
        let doc = issuer.issue(b"data", b"n").unwrap();
        let err = validator.validate(&doc, b"n").unwrap_err();
        assert!(err.to_string().contains("mismatch"));

        let missing = MeasuredValidator::new(CloudProvider::Aws, measurements(&[(11, "00")]));
        assert!(missing.validate(&doc, b"n").is_err());
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let validator = MeasuredValidator::new(CloudProvider::Azure, Measurements::new());
        assert!(validator.validate(b"not json", b"n").is_err());
    }

    #[test]
    fn test_provider_oids_are_distinct() {
        let oids = [
            provider_oid(CloudProvider::Azure),
            provider_oid(CloudProvider::Gcp),
            provider_oid(CloudProvider::Aws),
            provider_oid(CloudProvider::Qemu),
        ];
        for (i, a) in oids.iter().enumerate() {
            for b in &oids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_update_reloads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        let path = PathBuf::from("/etc/constellation/measurements.json");
        std::fs::create_dir_all(fs.resolve("/etc/constellation")).unwrap();
        std::fs::write(fs.resolve(&path), r#"{"4":"aa"}"#).unwrap();

        let validator = MeasuredValidator::from_file(CloudProvider::Qemu, fs.clone(), path.clone())
            .unwrap();
        assert_eq!(validator.expected(), measurements(&[(4, "aa")]));

        std::fs::write(fs.resolve(&path), r#"{"4":"bb","9":"cc"}"#).unwrap();
        validator.update().unwrap();
        assert_eq!(validator.expected(), measurements(&[(4, "bb"), (9, "cc")]));
    }

    #[test]
    fn test_node_provider_prefers_config() {
        let section = AttestationSection {
            provider: Some("GCP".to_string()),
            ..Default::default()
        };
        assert_eq!(node_provider(&section).unwrap(), CloudProvider::Gcp);

        let bad = AttestationSection {
            provider: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(node_provider(&bad).is_err());
    }

    #[tokio::test]
    async fn test_validator_for_state_uses_state_provider() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        fs.write("/constellation-state.json", br#"{"cloudProvider":"Azure"}"#, 0o644)
            .await
            .unwrap();
        fs.write("/measurements.json", br#"{"4":"aa"}"#, 0o644)
            .await
            .unwrap();

        let validator = validator_for_state(
            &fs,
            Path::new("/constellation-state.json"),
            Path::new("/measurements.json"),
        )
        .await
        .unwrap();
        assert_eq!(validator.oid(), provider_oid(CloudProvider::Azure));
        assert_eq!(validator.expected(), measurements(&[(4, "aa")]));
    }
}
