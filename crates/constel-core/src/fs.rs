use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Handle through which every service touches the filesystem.
///
/// Production code uses [`HostFs::host`], which passes paths through
/// unchanged. Tests use [`HostFs::rooted`] to confine absolute paths like
/// `/etc/systemd/system/foo.service` below a temporary directory.
#[derive(Debug, Clone, Default)]
pub struct HostFs {
    root: Option<PathBuf>,
}

impl HostFs {
    pub fn host() -> Self {
        Self { root: None }
    }

    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Map a logical path to the path on disk.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.root {
            None => path.to_path_buf(),
            Some(root) => {
                let mut out = root.clone();
                for component in path.components() {
                    match component {
                        Component::Normal(part) => out.push(part),
                        Component::ParentDir => {
                            if out != *root {
                                out.pop();
                            }
                        }
                        _ => {}
                    }
                }
                out
            }
        }
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let real = self.resolve(&path);
        tokio::fs::read(&real)
            .await
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))
    }

    pub async fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        let real = self.resolve(&path);
        tokio::fs::read_to_string(&real)
            .await
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))
    }

    /// Write a whole file, creating parent directories, and apply `mode`.
    pub async fn write(&self, path: impl AsRef<Path>, data: &[u8], mode: u32) -> Result<()> {
        let real = self.resolve(&path);
        if let Some(parent) = real.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::write(&real, data)
            .await
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        self.set_mode(&path, mode).await
    }

    /// Create (or truncate) a file for writing, creating parent directories.
    pub async fn create(&self, path: impl AsRef<Path>) -> Result<tokio::fs::File> {
        let real = self.resolve(&path);
        if let Some(parent) = real.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::File::create(&real)
            .await
            .with_context(|| format!("Failed to create {}", path.as_ref().display()))
    }

    pub async fn open(&self, path: impl AsRef<Path>) -> Result<tokio::fs::File> {
        let real = self.resolve(&path);
        tokio::fs::File::open(&real)
            .await
            .with_context(|| format!("Failed to open {}", path.as_ref().display()))
    }

    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let real = self.resolve(&path);
        tokio::fs::create_dir_all(&real)
            .await
            .with_context(|| format!("Failed to create directory {}", path.as_ref().display()))
    }

    pub async fn set_mode(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let real = self.resolve(&path);
            tokio::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode))
                .await
                .with_context(|| format!("Failed to set mode of {}", path.as_ref().display()))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }

    pub async fn mode(&self, path: impl AsRef<Path>) -> Result<u32> {
        let real = self.resolve(&path);
        let meta = tokio::fs::metadata(&real)
            .await
            .with_context(|| format!("Failed to stat {}", path.as_ref().display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            Ok(meta.permissions().mode() & 0o7777)
        }
        #[cfg(not(unix))]
        {
            Ok(if meta.permissions().readonly() { 0o444 } else { 0o644 })
        }
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .unwrap_or(false)
    }
}
