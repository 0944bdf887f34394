use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::downloader::{DownloadError, Downloader};
use crate::metadata::Fetcher;

/// Which downloads have succeeded. Flags never go back to false.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerDownloadRecord {
    pub deployment_done: bool,
    pub info_done: bool,
}

impl PeerDownloadRecord {
    pub fn complete(&self) -> bool {
        self.deployment_done && self.info_done
    }
}

/// Periodically discovers peers and pulls the deployment and info map from
/// them until both have arrived.
pub struct Scheduler {
    fetcher: Arc<dyn Fetcher>,
    downloader: Downloader,
    interval: Duration,
    record: PeerDownloadRecord,
}

impl Scheduler {
    pub fn new(fetcher: Arc<dyn Fetcher>, downloader: Downloader, interval: Duration) -> Self {
        Self {
            fetcher,
            downloader,
            interval,
            record: PeerDownloadRecord::default(),
        }
    }

    /// Run until both downloads succeeded or `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PeerDownloadRecord {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("Discovery loop stopped");
                    return self.record;
                }
            }

            let interval = self.interval;
            tokio::select! {
                round = tokio::time::timeout(interval, self.tick()) => {
                    if round.is_err() {
                        warn!(timeout = ?interval, "Discovery round timed out");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Discovery loop stopped");
                    return self.record;
                }
            }

            if self.record.complete() {
                info!("Deployment and info received, discovery loop done");
                return self.record;
            }
        }
    }

    async fn tick(&mut self) {
        if !self.record.deployment_done {
            if self.downloader.apply_pending() {
                match self.downloader.apply_deployment().await {
                    Ok(()) => self.record.deployment_done = true,
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "Applying downloaded deployment failed")
                    }
                }
            } else if self.downloader.has_deployment().await {
                info!("Deployment already present locally");
                self.record.deployment_done = true;
            }
        }

        let mut candidates = match self.fetcher.discover_debugd_ips().await {
            Ok(ips) => ips,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Discovering debugd IPs failed");
                return;
            }
        };
        match self.fetcher.discover_loadbalancer_ip().await {
            Ok(Some(lb)) => candidates.push(lb),
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{:#}", e), "Discovering load balancer failed"),
        }
        debug!(candidates = ?candidates, "Discovered peers");

        for ip in &candidates {
            if self.record.complete() {
                return;
            }
            if !self.record.deployment_done && !self.downloader.apply_pending() {
                match self.downloader.download_deployment(ip).await {
                    Ok(()) => self.record.deployment_done = true,
                    Err(e) if e.downcast_ref::<DownloadError>().is_some() => {
                        debug!(peer = %ip, error = %e, "Skipping peer");
                    }
                    Err(e) => {
                        warn!(peer = %ip, error = %format!("{:#}", e), "Downloading deployment failed")
                    }
                }
            }
            if !self.record.info_done {
                match self.downloader.download_info(ip).await {
                    Ok(()) => self.record.info_done = true,
                    Err(e) => {
                        warn!(peer = %ip, error = %format!("{:#}", e), "Downloading info failed")
                    }
                }
            }
        }
    }
}
