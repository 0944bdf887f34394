//! `cdbg deploy`: push a bootstrapper and the info map to debugd instances.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use constel_core::constants::{BOOTSTRAPPER_DEPLOY_PATH, BOOTSTRAPPER_UNIT, DEBUGD_PORT};
use constel_core::fs::HostFs;
use constel_core::protocol::debugd::{InfoEntry, SetInfoStatus, UploadFilesStatus};

use crate::client::DebugdClient;
use crate::filetransfer::{FileStat, FileTransferer};
use crate::logcollector::{LOGCOLLECT_KEY, LOGCOLLECT_PREFIX};

/// Subkeys accepted below `logcollect.`.
pub const LOG_FIELDS: [&str; 4] = ["admin", "is_debug_cluster", "uid", "deployment_type"];

/// Mode of deployed binaries.
const BINARY_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub ips: Vec<String>,
    pub port: u16,
    /// Local bootstrapper binary.
    pub bootstrapper: PathBuf,
    pub info: BTreeMap<String, String>,
}

impl DeployOptions {
    pub fn new(ips: Vec<String>, bootstrapper: PathBuf, info: BTreeMap<String, String>) -> Self {
        Self {
            ips,
            port: DEBUGD_PORT,
            bootstrapper,
            info,
        }
    }
}

/// Parse `key=value` arguments.
pub fn parse_info_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Info entry {:?} is not key=value", pair))?;
            if key.is_empty() {
                anyhow::bail!("Info entry {:?} has an empty key", pair);
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Reject info maps the log collector would not understand.
pub fn check_info_map(info: &BTreeMap<String, String>) -> Result<()> {
    if let Some(value) = info.get(LOGCOLLECT_KEY)
        && value != "true"
        && value != "false"
    {
        anyhow::bail!("Info key {} must be true or false, got {:?}", LOGCOLLECT_KEY, value);
    }
    for key in info.keys() {
        let Some(subkey) = key.strip_prefix(LOGCOLLECT_PREFIX) else {
            continue;
        };
        if !LOG_FIELDS.contains(&subkey) {
            anyhow::bail!("Invalid subkey {:?} for info key {:?}", subkey, key);
        }
    }
    Ok(())
}

/// Deploy to every endpoint in turn, stopping at the first failure.
pub async fn deploy(opts: &DeployOptions) -> Result<()> {
    check_info_map(&opts.info)?;
    if opts.ips.is_empty() {
        anyhow::bail!("No debugd endpoints given");
    }

    let transfer = FileTransferer::new(HostFs::host(), true);
    transfer
        .set_files(vec![FileStat {
            source_path: opts.bootstrapper.display().to_string(),
            target_path: BOOTSTRAPPER_DEPLOY_PATH.to_string(),
            mode: BINARY_MODE,
            override_service_unit: Some(BOOTSTRAPPER_UNIT.to_string()),
        }])
        .await;

    for ip in &opts.ips {
        info!(endpoint = %ip, "Deploying");
        let mut client = DebugdClient::connect(ip, opts.port).await?;
        let info: Vec<InfoEntry> = opts
            .info
            .iter()
            .map(|(k, v)| InfoEntry::new(k, v))
            .collect();
        set_info(&mut client, info)
            .await
            .with_context(|| format!("Setting info on {}", ip))?;
        upload_files(&mut client, &transfer)
            .await
            .with_context(|| format!("Uploading files to {}", ip))?;
    }
    Ok(())
}

pub async fn set_info(client: &mut DebugdClient, info: Vec<InfoEntry>) -> Result<()> {
    info!(entries = info.len(), "Setting info");
    match client.set_info(info).await? {
        SetInfoStatus::Success => info!("Info set"),
        SetInfoStatus::AlreadySet => warn!("Info already set"),
    }
    Ok(())
}

pub async fn upload_files(client: &mut DebugdClient, transfer: &FileTransferer) -> Result<()> {
    info!("Uploading files");
    match client.upload_files(transfer).await? {
        UploadFilesStatus::Success => info!("Upload successful"),
        UploadFilesStatus::AlreadyFinished => info!("Files already uploaded"),
        UploadFilesStatus::StartFailed => {
            anyhow::bail!("Files uploaded but the bootstrapper failed to start")
        }
        UploadFilesStatus::UploadFailed => anyhow::bail!("Upload failed"),
        UploadFilesStatus::AlreadyStarted => anyhow::bail!("An upload is already in progress"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{FakeSystemd, ServiceManager};
    use crate::info::InfoMap;
    use crate::server::DebugdServer;
    use constel_core::config::DebugdSection;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_info_pairs() {
        let parsed = parse_info_pairs(&["logcollect=true".to_string(), "a=b=c".to_string()]).unwrap();
        assert_eq!(parsed, map(&[("logcollect", "true"), ("a", "b=c")]));
        assert!(parse_info_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_info_pairs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_check_info_map() {
        check_info_map(&map(&[
            ("logcollect", "true"),
            ("logcollect.admin", "alice"),
            ("logcollect.deployment_type", "debugd"),
            ("qemu.opensearch-pw", "pw"),
        ]))
        .unwrap();
        assert!(check_info_map(&map(&[("logcollect", "yes")])).is_err());
        assert!(check_info_map(&map(&[("logcollect.unknown", "x")])).is_err());
    }

    #[tokio::test]
    async fn test_deploy_to_running_debugd() {
        let local = tempfile::tempdir().unwrap();
        let bootstrapper = local.path().join("bootstrapper");
        std::fs::write(&bootstrapper, b"fresh build").unwrap();

        let node = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(node.path());
        let bus = Arc::new(FakeSystemd::default());
        let info = InfoMap::new();
        let server = Arc::new(DebugdServer::new(
            fs.clone(),
            Arc::new(FileTransferer::new(fs.clone(), false)),
            info.clone(),
            Arc::new(ServiceManager::new(bus.clone(), fs.clone())),
            &DebugdSection::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(listener, rx));

        let mut opts = DeployOptions::new(
            vec!["127.0.0.1".to_string()],
            bootstrapper,
            map(&[("logcollect", "false")]),
        );
        opts.port = port;
        deploy(&opts).await.unwrap();

        assert_eq!(fs.read("/opt/bootstrapper").await.unwrap(), b"fresh build");
        assert_eq!(info.get("logcollect").unwrap().as_deref(), Some("false"));
        assert!(fs
            .exists("/run/systemd/system/bootstrapper.service.d/override.conf")
            .await);

        // A second deploy finds everything in place and still succeeds.
        deploy(&opts).await.unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
