use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Access to the encrypted state disk of this node.
#[async_trait]
pub trait DiskUnlocker: Send + Sync {
    /// UUID of the encrypted volume.
    async fn disk_uuid(&self) -> Result<String>;

    /// Open the volume with `key`, returning the mapped device path.
    async fn unlock(&self, key: &[u8]) -> Result<PathBuf>;
}

/// [`DiskUnlocker`] for a LUKS volume driven through `cryptsetup`.
///
/// The key is passed on stdin, never on the command line.
pub struct Cryptsetup {
    device: PathBuf,
    mapper_name: String,
}

impl Cryptsetup {
    pub fn new(device: impl Into<PathBuf>, mapper_name: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            mapper_name: mapper_name.into(),
        }
    }

    pub fn mapper_path(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.mapper_name)
    }
}

/// Arguments of `cryptsetup` opening `device` as `name` with a key on stdin.
pub fn luks_open_args(device: &Path, name: &str) -> Vec<String> {
    vec![
        "luksOpen".to_string(),
        "--key-file".to_string(),
        "-".to_string(),
        device.display().to_string(),
        name.to_string(),
    ]
}

#[async_trait]
impl DiskUnlocker for Cryptsetup {
    async fn disk_uuid(&self) -> Result<String> {
        let output = tokio::process::Command::new("cryptsetup")
            .arg("luksUUID")
            .arg(&self.device)
            .output()
            .await
            .with_context(|| "Failed to run cryptsetup")?;
        if !output.status.success() {
            anyhow::bail!(
                "cryptsetup luksUUID {} failed: {}",
                self.device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let uuid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if uuid.is_empty() {
            anyhow::bail!("{} reports no LUKS UUID", self.device.display());
        }
        Ok(uuid)
    }

    async fn unlock(&self, key: &[u8]) -> Result<PathBuf> {
        let mut child = tokio::process::Command::new("cryptsetup")
            .args(luks_open_args(&self.device, &self.mapper_name))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| "Failed to run cryptsetup")?;
        {
            let mut stdin = child
                .stdin
                .take()
                .with_context(|| "cryptsetup stdin unavailable")?;
            stdin
                .write_all(key)
                .await
                .with_context(|| "Failed to pass key to cryptsetup")?;
        }
        let output = child
            .wait_with_output()
            .await
            .with_context(|| "Failed to wait for cryptsetup")?;
        if !output.status.success() {
            anyhow::bail!(
                "Failed to open LUKS volume {} as {}: {}",
                self.device.display(),
                self.mapper_name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let path = self.mapper_path();
        info!(device = %self.device.display(), mapper = %path.display(), "State disk unlocked");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luks_open_args() {
        assert_eq!(
            luks_open_args(Path::new("/dev/sda2"), "state"),
            vec!["luksOpen", "--key-file", "-", "/dev/sda2", "state"]
        );
    }

    #[test]
    fn test_mapper_path() {
        let unlocker = Cryptsetup::new("/dev/sda2", "state");
        assert_eq!(unlocker.mapper_path(), PathBuf::from("/dev/mapper/state"));
    }
}
