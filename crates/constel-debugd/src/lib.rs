// constel-debugd: Debug daemon for peer bootstrap, file distribution, systemd control
// Depends on constel-core.

pub mod cdbg;
pub mod client;
pub mod deploy;
pub mod downloader;
pub mod filetransfer;
pub mod info;
pub mod logcollector;
pub mod metadata;
pub mod scheduler;
pub mod server;
pub mod streamer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use constel_core::config::DebugdSection;
use constel_core::fs::HostFs;
use constel_core::retry::retry;
use constel_core::state::CloudProvider;

use crate::deploy::{DbusSystemd, ServiceManager};
use crate::downloader::{Downloader, TcpConnector};
use crate::filetransfer::FileTransferer;
use crate::info::InfoMap;
use crate::logcollector::{LogCollector, Podman};
use crate::scheduler::Scheduler;
use crate::server::DebugdServer;

/// Run debugd until ctrl-c: the RPC server plus the discovery loop.
pub async fn run(config: &DebugdSection) -> Result<()> {
    let fs = HostFs::host();
    // The system bus may still be coming up this early in boot.
    let bus = retry(
        5,
        Duration::from_secs(1),
        "Connecting to systemd",
        DbusSystemd::connect,
    )
    .await?;
    let service_manager = Arc::new(ServiceManager::new(Arc::new(bus), fs.clone()));
    if let Err(e) = service_manager.ensure_bootstrapper_unit().await {
        warn!(error = %format!("{:#}", e), "Installing bootstrapper unit failed");
    }

    let info = InfoMap::new();
    let collector = Arc::new(LogCollector::new(
        fs.clone(),
        CloudProvider::from_env(),
        Arc::new(Podman),
    ));
    info.register_on_receive_trigger(collector.start_trigger());

    let transfer = Arc::new(FileTransferer::with_chunk_size(
        fs.clone(),
        config.chunk_size,
        true,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let downloader = Downloader::new(
        Arc::new(TcpConnector::new(config.peer_port)),
        transfer.clone(),
        service_manager.clone(),
        info.clone(),
        config.bootstrapper_unit.clone(),
        config.retry_backoff(),
    );
    let scheduler = Scheduler::new(
        metadata::fetcher_from_env()?,
        downloader,
        config.discover_interval(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let server = Arc::new(DebugdServer::new(
        fs,
        transfer,
        info,
        service_manager,
        config,
    ));
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind debugd on {}", config.listen))?;
    let server_handle = tokio::spawn(server.serve(listener, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let record = scheduler_handle
        .await
        .with_context(|| "Discovery loop panicked")?;
    info!(
        deployment = record.deployment_done,
        info = record.info_done,
        "Discovery state at shutdown"
    );
    server_handle
        .await
        .with_context(|| "debugd server panicked")??;
    info!("debugd stopped");
    Ok(())
}
