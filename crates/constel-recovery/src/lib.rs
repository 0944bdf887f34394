// constel-recovery: State-disk key recovery
// Depends on constel-core, constel-atls.
//
// A rebooted node whose state disk cannot be unlocked locally waits for an
// operator to push the disk key over attested TLS.

pub mod client;
pub mod keyapi;
pub mod unlock;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use constel_atls::create_attestation_server_config;
use constel_atls::measured;
use constel_core::config::{AttestationSection, RecoverySection};
use constel_core::fs::HostFs;

use crate::keyapi::KeyApi;
use crate::unlock::{Cryptsetup, DiskUnlocker};

/// Wait for pushed keys on `listener` until one opens the disk.
pub async fn unlock_with_pushed_key(
    api: Arc<KeyApi>,
    unlocker: &dyn DiskUnlocker,
    listener: &TcpListener,
) -> Result<PathBuf> {
    let disk_uuid = unlocker
        .disk_uuid()
        .await
        .with_context(|| "Reading state disk UUID")?;
    loop {
        let key = Arc::clone(&api)
            .wait_on_listener(&disk_uuid, listener)
            .await?;
        match unlocker.unlock(&key).await {
            Ok(path) => return Ok(path),
            Err(e) => {
                warn!(disk_uuid = %disk_uuid, error = %format!("{:#}", e), "Pushed key did not open state disk");
                api.reset_key();
            }
        }
    }
}

/// Run the recovery service until the state disk is open or ctrl-c.
pub async fn run(config: &RecoverySection, attestation: &AttestationSection) -> Result<()> {
    let fs = HostFs::host();
    let issuer = measured::node_issuer(&fs, attestation)?;
    let api = KeyApi::new(Arc::new(create_attestation_server_config(issuer, vec![])));
    let unlocker = Cryptsetup::new(&config.state_device, &config.mapper_name);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind recovery service on {}", config.listen))?;

    tokio::select! {
        result = unlock_with_pushed_key(api, &unlocker, &listener) => {
            let path = result?;
            info!(mapper = %path.display(), "State disk ready");
        }
        result = tokio::signal::ctrl_c() => {
            result.with_context(|| "Failed to listen for ctrl-c")?;
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use constel_atls::measured::{MeasuredIssuer, Measurements};
    use constel_core::state::CloudProvider;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeDisk {
        accepts: Vec<u8>,
        attempts: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DiskUnlocker for FakeDisk {
        async fn disk_uuid(&self) -> Result<String> {
            Ok("00000000-0000-0000-0000-000000000000".to_string())
        }

        async fn unlock(&self, key: &[u8]) -> Result<PathBuf> {
            self.attempts.lock().unwrap().push(key.to_vec());
            if key == self.accepts.as_slice() {
                Ok(PathBuf::from("/dev/mapper/state"))
            } else {
                anyhow::bail!("No key available with this passphrase")
            }
        }
    }

    #[tokio::test]
    async fn test_wrong_key_is_reset_and_retried() {
        let issuer = Arc::new(MeasuredIssuer::new(CloudProvider::Qemu, Measurements::new()));
        let api = KeyApi::new(Arc::new(create_attestation_server_config(issuer, vec![])));
        let disk = Arc::new(FakeDisk {
            accepts: vec![7; 32],
            attempts: Mutex::new(Vec::new()),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (task_api, task_disk) = (api.clone(), disk.clone());
        let task = tokio::spawn(async move {
            unlock_with_pushed_key(task_api, task_disk.as_ref(), &listener).await
        });

        api.push_state_disk_key(vec![1; 32]).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while api.push_state_disk_key(vec![7; 32]).is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let path = task.await.unwrap().unwrap();
        assert_eq!(path, PathBuf::from("/dev/mapper/state"));
        assert_eq!(
            *disk.attempts.lock().unwrap(),
            vec![vec![1u8; 32], vec![7u8; 32]]
        );
    }
}
