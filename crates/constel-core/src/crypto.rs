use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::fs::HostFs;
use crate::naming;

/// Length of a derived state-disk key.
pub const STATE_DISK_KEY_LENGTH: usize = 32;

/// Default length of a freshly generated master secret.
pub const MASTER_SECRET_LENGTH_DEFAULT: usize = 32;

/// Shortest master secret accepted anywhere.
pub const MASTER_SECRET_LENGTH_MIN: usize = 16;

/// Length of generated random identifiers.
pub const RNG_LENGTH_DEFAULT: usize = 32;

const KDF_SALT: &[u8] = b"Constellation";
const KDF_INFO_OWNER_ID: &[u8] = b"id";
const KDF_INFO_DISK_KEY_PREFIX: &[u8] = b"key";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("master secret too short: {len} bytes (min {min})")]
    MasterSecretTooShort { len: usize, min: usize },
    #[error("invalid disk UUID: {0}")]
    InvalidDiskUuid(String),
    #[error("cannot derive {0} bytes")]
    InvalidOutputLength(usize),
}

/// HKDF-SHA256 expand of `secret` with the given salt and info.
pub fn derive_key(
    secret: &[u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut okm)
        .map_err(|_| KeyError::InvalidOutputLength(length))?;
    Ok(okm)
}

/// Fill a fresh buffer with `length` random bytes.
pub fn generate_random_bytes(length: usize) -> Vec<u8> {
    let mut buf = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Cluster-wide root of key derivation.
#[derive(Clone)]
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterSecret({} bytes)", self.0.len())
    }
}

impl MasterSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, KeyError> {
        if bytes.len() < MASTER_SECRET_LENGTH_MIN {
            return Err(KeyError::MasterSecretTooShort {
                len: bytes.len(),
                min: MASTER_SECRET_LENGTH_MIN,
            });
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn generate(length: usize) -> Result<Self, KeyError> {
        Self::from_bytes(generate_random_bytes(length))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.as_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .with_context(|| "Master secret is not valid base64")?;
        Ok(Self::from_bytes(bytes)?)
    }

    /// Key unlocking the state disk with the given UUID.
    ///
    /// The UUID is validated and lowercased first, so both spellings of a
    /// UUID derive the same key.
    pub fn derive_state_disk_key(&self, disk_uuid: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let uuid = naming::canonical_disk_uuid(disk_uuid)
            .map_err(|_| KeyError::InvalidDiskUuid(disk_uuid.to_string()))?;
        self.derive_data_key(&uuid, STATE_DISK_KEY_LENGTH)
    }

    /// Key for an arbitrary key ID, without UUID validation.
    pub fn derive_data_key(
        &self,
        key_id: &str,
        length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let mut info = KDF_INFO_DISK_KEY_PREFIX.to_vec();
        info.extend_from_slice(key_id.as_bytes());
        derive_key(self.as_bytes(), KDF_SALT, &info, length)
    }

    /// Owner ID: a stable value tied to this secret.
    pub fn derive_owner_id(&self) -> Result<Vec<u8>, KeyError> {
        derive_key(self.as_bytes(), KDF_SALT, KDF_INFO_OWNER_ID, RNG_LENGTH_DEFAULT)
            .map(|k| k.to_vec())
    }
}

/// Read a base64 master secret file.
pub async fn read_master_secret(fs: &HostFs, path: impl AsRef<Path>) -> Result<MasterSecret> {
    let path = path.as_ref();
    let encoded = fs.read_to_string(path).await?;
    MasterSecret::from_base64(&encoded)
        .with_context(|| format!("Invalid master secret in {}", path.display()))
}

/// Write a master secret file (mode 0600), refusing to overwrite.
pub async fn write_master_secret(
    fs: &HostFs,
    path: impl AsRef<Path>,
    secret: &MasterSecret,
) -> Result<()> {
    let path = path.as_ref();
    if fs.exists(path).await {
        anyhow::bail!("Master secret file {} already exists", path.display());
    }
    fs.write(path, secret.to_base64().as_bytes(), 0o600).await
}
