use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use tracing::info;

use constel_core::crypto::generate_random_bytes;
use constel_core::fs::HostFs;

/// Organization of every kubelet client certificate.
pub const KUBELET_ORGANIZATION: &str = "system:nodes";

const VALIDITY_DAYS: i64 = 365;

/// Issues kubelet credentials for joining nodes.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// PEM certificate and PEM private key bound to `node_name`.
    async fn get_certificate(&self, node_name: &str) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Common name Kubernetes expects for a node's kubelet.
pub fn kubelet_common_name(node_name: &str) -> String {
    format!("system:node:{}", node_name)
}

/// [`CertificateAuthority`] signing with the cluster CA pair on disk.
///
/// Every call generates a fresh ECDSA P-256 key. The CA files are read per
/// call.
pub struct KubeletCa {
    fs: HostFs,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl KubeletCa {
    pub fn new(fs: HostFs, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    fn sign(&self, node_name: &str, ca_cert_pem: &str, ca_key_pem: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let ca_key = KeyPair::from_pem(ca_key_pem).with_context(|| "Failed to parse CA key")?;
        let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
            .with_context(|| "Failed to parse CA certificate")?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let node_key = KeyPair::generate().with_context(|| "Failed to generate kubelet key")?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, kubelet_common_name(node_name));
        dn.push(DnType::OrganizationName, KUBELET_ORGANIZATION);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.serial_number = Some(SerialNumber::from_slice(&generate_random_bytes(16)));

        let not_before = Utc::now() - chrono::Duration::hours(2);
        let not_after = Utc::now() + chrono::Duration::days(VALIDITY_DAYS);
        params.not_before =
            rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

        let cert = params
            .signed_by(&node_key, &ca_cert, &ca_key)
            .with_context(|| "Failed to sign kubelet certificate")?;
        Ok((
            cert.pem().into_bytes(),
            node_key.serialize_pem().into_bytes(),
        ))
    }
}

#[async_trait]
impl CertificateAuthority for KubeletCa {
    async fn get_certificate(&self, node_name: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        if node_name.is_empty() {
            anyhow::bail!("Node name must not be empty");
        }
        let ca_cert_pem = self.fs.read_to_string(&self.cert_path).await?;
        let ca_key_pem = self.fs.read_to_string(&self.key_path).await?;
        let pair = self.sign(node_name, &ca_cert_pem, &ca_key_pem)?;
        info!(node = %node_name, "Issued kubelet certificate");
        Ok(pair)
    }
}
