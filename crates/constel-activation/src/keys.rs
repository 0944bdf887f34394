use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use constel_core::crypto::{self, MasterSecret};
use constel_core::fs::HostFs;
use constel_core::naming;

/// Derives per-disk keys for joining nodes.
#[async_trait]
pub trait DataKeyGetter: Send + Sync {
    async fn get_data_key(&self, disk_uuid: &str, length: usize) -> Result<Vec<u8>>;
}

/// [`DataKeyGetter`] deriving keys locally from the cluster master secret.
///
/// Produces the same bytes the recovery client derives for a disk, so a
/// node activated here can later be unlocked by `recover`.
pub struct MasterSecretKeyGetter {
    secret: MasterSecret,
}

impl MasterSecretKeyGetter {
    pub fn new(secret: MasterSecret) -> Self {
        Self { secret }
    }

    pub async fn load(fs: &HostFs, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(crypto::read_master_secret(fs, path).await?))
    }
}

#[async_trait]
impl DataKeyGetter for MasterSecretKeyGetter {
    async fn get_data_key(&self, disk_uuid: &str, length: usize) -> Result<Vec<u8>> {
        let uuid = naming::canonical_disk_uuid(disk_uuid)?;
        let key = self.secret.derive_data_key(&uuid, length)?;
        Ok(key.to_vec())
    }
}
