use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use constel_core::protocol::debugd::InfoEntry;

use crate::client::DebugdClient;
use crate::deploy::{ServiceManager, SystemdAction};
use crate::filetransfer::FileTransferer;
use crate::info::{InfoError, InfoMap};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download from {endpoint} attempted {elapsed:?} ago, retry after {backoff:?}")]
    Backoff {
        endpoint: String,
        elapsed: Duration,
        backoff: Duration,
    },
}

/// An open connection to another debugd.
#[async_trait]
pub trait DebugdPeer: Send {
    /// Receive the peer's deployment files into `transfer`.
    async fn download_files(&mut self, transfer: &FileTransferer) -> Result<()>;

    async fn get_info(&mut self) -> Result<Vec<InfoEntry>>;
}

/// Opens [`DebugdPeer`] connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, ip: &str) -> Result<Box<dyn DebugdPeer>>;
}

#[async_trait]
impl DebugdPeer for DebugdClient {
    async fn download_files(&mut self, transfer: &FileTransferer) -> Result<()> {
        DebugdClient::download_files(self, transfer).await
    }

    async fn get_info(&mut self) -> Result<Vec<InfoEntry>> {
        DebugdClient::get_info(self).await
    }
}

/// Dials peers over plaintext TCP on a fixed port.
pub struct TcpConnector {
    port: u16,
}

impl TcpConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, ip: &str) -> Result<Box<dyn DebugdPeer>> {
        Ok(Box::new(DebugdClient::connect(ip, self.port).await?))
    }
}

/// Pulls deployment files and the info map from other debugd instances.
///
/// Owned by the discovery loop; the attempt log needs no lock.
pub struct Downloader {
    connector: Arc<dyn PeerConnector>,
    transfer: Arc<FileTransferer>,
    service_manager: Arc<ServiceManager>,
    info: Arc<InfoMap>,
    bootstrapper_unit: String,
    retry_backoff: Duration,
    attempts: HashMap<String, Instant>,
    /// Files were downloaded but their overrides or restart have not succeeded.
    apply_pending: bool,
}

impl Downloader {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        transfer: Arc<FileTransferer>,
        service_manager: Arc<ServiceManager>,
        info: Arc<InfoMap>,
        bootstrapper_unit: impl Into<String>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            connector,
            transfer,
            service_manager,
            info,
            bootstrapper_unit: bootstrapper_unit.into(),
            retry_backoff,
            attempts: HashMap::new(),
            apply_pending: false,
        }
    }

    /// Whether this node already holds a complete, applied deployment.
    pub async fn has_deployment(&self) -> bool {
        !self.apply_pending && self.transfer.can_send().await
    }

    /// Whether downloaded files still wait for [`Self::apply_deployment`].
    pub fn apply_pending(&self) -> bool {
        self.apply_pending
    }

    /// Fetch the deployment from `ip`, then apply it.
    pub async fn download_deployment(&mut self, ip: &str) -> Result<()> {
        self.check_backoff(ip, Instant::now())?;
        info!(peer = %ip, "Downloading deployment");

        let mut peer = self
            .connector
            .connect(ip)
            .await
            .with_context(|| format!("Failed to connect to {}", ip))?;
        peer.download_files(&self.transfer)
            .await
            .with_context(|| format!("Failed to download files from {}", ip))?;
        self.apply_pending = true;
        info!(peer = %ip, "Deployment files received");

        self.apply_deployment().await
    }

    /// Point overridden units at the held files and restart the bootstrapper.
    pub async fn apply_deployment(&mut self) -> Result<()> {
        let mut first_error = None;
        for file in self.transfer.get_files().await {
            let Some(unit) = &file.override_service_unit else {
                continue;
            };
            if let Err(e) = self
                .service_manager
                .override_service_unit_exec_start(unit, &file.target_path)
                .await
            {
                warn!(unit = %unit, error = %format!("{:#}", e), "Override failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.context("Failed to apply unit overrides"));
        }

        self.service_manager
            .systemd_action(
                &format!("{}.service", self.bootstrapper_unit),
                SystemdAction::Restart,
            )
            .await
            .with_context(|| "Failed to restart bootstrapper")?;
        self.apply_pending = false;
        info!("Deployment applied");
        Ok(())
    }

    /// Fetch the info map from `ip`. A map that is already set counts as
    /// success.
    pub async fn download_info(&mut self, ip: &str) -> Result<()> {
        info!(peer = %ip, "Downloading info");
        let mut peer = self
            .connector
            .connect(ip)
            .await
            .with_context(|| format!("Failed to connect to {}", ip))?;
        let entries = peer
            .get_info()
            .await
            .with_context(|| format!("Failed to get info from {}", ip))?;
        match self.info.set_proto(entries) {
            Ok(()) | Err(InfoError::AlreadySet) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail fast if `endpoint` was tried within the retry backoff; otherwise
    /// record this attempt.
    fn check_backoff(&mut self, endpoint: &str, now: Instant) -> Result<(), DownloadError> {
        if let Some(last) = self.attempts.get(endpoint) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.retry_backoff {
                return Err(DownloadError::Backoff {
                    endpoint: endpoint.to_string(),
                    elapsed,
                    backoff: self.retry_backoff,
                });
            }
        }
        self.attempts.insert(endpoint.to_string(), now);
        Ok(())
    }
}

// ============================================================================
// Test double
// ============================================================================


#[cfg(test)]
mod tests {
    use super::fake::FakeConnector;
    use super::*;
    use crate::deploy::FakeSystemd;
    use constel_core::fs::HostFs;
    use constel_core::protocol::debugd::{Chunk, FileTransferMessage};

    struct Fixture {
        _dir: tempfile::TempDir,
        fs: HostFs,
        bus: Arc<FakeSystemd>,
        connector: Arc<FakeConnector>,
        info: Arc<InfoMap>,
        downloader: Downloader,
    }

    fn fixture(connector: FakeConnector, bus: FakeSystemd) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        let bus = Arc::new(bus);
        let connector = Arc::new(connector);
        let info = InfoMap::new();
        let downloader = Downloader::new(
            connector.clone(),
            Arc::new(FileTransferer::new(fs.clone(), false)),
            Arc::new(ServiceManager::new(bus.clone(), fs.clone())),
            info.clone(),
            "bootstrapper",
            Duration::from_secs(60),
        );
        Fixture {
            _dir: dir,
            fs,
            bus,
            connector,
            info,
            downloader,
        }
    }

    fn bootstrapper_files(unit: &str) -> Vec<FileTransferMessage> {
        vec![
            FileTransferMessage::Header {
                target_path: "/opt/bootstrapper".to_string(),
                mode: 0o755,
                override_service_unit: Some(unit.to_string()),
            },
            FileTransferMessage::Chunk(Chunk {
                content: b"binary".to_vec(),
                last: true,
            }),
        ]
    }

    #[tokio::test]
    async fn test_download_deployment_overrides_and_restarts() {
        let mut f = fixture(
            FakeConnector {
                files: bootstrapper_files("bootstrapper"),
                ..Default::default()
            },
            FakeSystemd::default(),
        );
        f.downloader.download_deployment("192.0.2.5").await.unwrap();

        assert_eq!(f.fs.read("/opt/bootstrapper").await.unwrap(), b"binary");
        assert_eq!(
            f.fs.read_to_string("/run/systemd/system/bootstrapper.service.d/override.conf")
                .await
                .unwrap(),
            "[Service]\nExecStart=\nExecStart=/opt/bootstrapper\n"
        );
        assert_eq!(
            f.bus.calls().last(),
            Some(&(SystemdAction::Restart, "bootstrapper.service".to_string()))
        );
        assert!(f.downloader.has_deployment().await);
    }

    #[tokio::test]
    async fn test_second_attempt_within_backoff_does_not_dial() {
        let mut f = fixture(
            FakeConnector {
                unreachable: vec!["192.0.2.5".to_string()],
                ..Default::default()
            },
            FakeSystemd::default(),
        );
        assert!(f.downloader.download_deployment("192.0.2.5").await.is_err());
        let err = f.downloader.download_deployment("192.0.2.5").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::Backoff { .. })
        ));
        assert_eq!(f.connector.dials(), vec!["192.0.2.5"]);
    }

    #[test]
    fn test_backoff_window() {
        let mut f = fixture(FakeConnector::default(), FakeSystemd::default());
        let start = Instant::now();
        f.downloader.check_backoff("192.0.2.5", start).unwrap();
        assert!(matches!(
            f.downloader
                .check_backoff("192.0.2.5", start + Duration::from_secs(10)),
            Err(DownloadError::Backoff { .. })
        ));
        // Other endpoints are tracked separately.
        f.downloader.check_backoff("192.0.2.6", start).unwrap();
        f.downloader
            .check_backoff("192.0.2.5", start + Duration::from_secs(60))
            .unwrap();
    }

    #[tokio::test]
    async fn test_override_failure_skips_restart_and_reports() {
        let mut f = fixture(
            FakeConnector {
                files: bootstrapper_files("bad unit"),
                ..Default::default()
            },
            FakeSystemd::default(),
        );
        assert!(f.downloader.download_deployment("192.0.2.5").await.is_err());
        assert!(f.bus.calls().is_empty());
        // The files were received but still need applying.
        assert!(f.downloader.apply_pending());
        assert!(!f.downloader.has_deployment().await);
    }

    #[tokio::test]
    async fn test_failed_restart_is_retried_without_download() {
        let mut f = fixture(
            FakeConnector {
                files: bootstrapper_files("bootstrapper"),
                ..Default::default()
            },
            FakeSystemd {
                job_result: Some("failed".to_string()),
                ..Default::default()
            },
        );
        assert!(f.downloader.download_deployment("192.0.2.5").await.is_err());
        assert!(f.downloader.apply_pending());

        let restarts_before = f.bus.calls().len();
        assert!(f.downloader.apply_deployment().await.is_err());
        assert!(f.bus.calls().len() > restarts_before);
        assert!(f.downloader.apply_pending());
        assert_eq!(f.connector.dials(), vec!["192.0.2.5"]);
    }

    #[tokio::test]
    async fn test_download_info_sets_map_and_tolerates_already_set() {
        let mut f = fixture(
            FakeConnector {
                info: Some(vec![InfoEntry::new("logcollect", "false")]),
                ..Default::default()
            },
            FakeSystemd::default(),
        );
        f.downloader.download_info("192.0.2.5").await.unwrap();
        assert_eq!(f.info.get("logcollect").unwrap().as_deref(), Some("false"));
        f.downloader.download_info("192.0.2.6").await.unwrap();
    }

    #[tokio::test]
    async fn test_download_info_from_peer_without_info_fails() {
        let mut f = fixture(FakeConnector::default(), FakeSystemd::default());
        assert!(f.downloader.download_info("192.0.2.5").await.is_err());
        assert!(!f.info.received());
    }
}
