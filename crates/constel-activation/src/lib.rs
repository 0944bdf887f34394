// constel-activation: Node activation service
// Depends on constel-core, constel-atls.
//
// Joining workers dial the service over attested TLS and receive their
// state-disk key, a Kubernetes join token, and a kubelet certificate.

pub mod ca;
pub mod client;
pub mod keys;
pub mod kubeadm;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use constel_atls::{Validator, create_attestation_server_config};
use constel_atls::measured::{self, MeasuredValidator};
use constel_atls::watcher::MeasurementWatcher;
use constel_core::config::{ActivationSection, AttestationSection};
use constel_core::fs::HostFs;

use crate::ca::KubeletCa;
use crate::keys::MasterSecretKeyGetter;
use crate::kubeadm::{Kubeadm, KubeadmCli};
use crate::server::ActivationServer;

/// Run the activation service until ctrl-c.
///
/// Joining nodes must attest with the same measurements this node reports;
/// the expected values reload whenever the measurements file changes.
pub async fn run(config: &ActivationSection, attestation: &AttestationSection) -> Result<()> {
    let fs = HostFs::host();
    let provider = measured::node_provider(attestation)?;
    let issuer = measured::node_issuer(&fs, attestation)?;
    let validator = Arc::new(MeasuredValidator::from_file(
        provider,
        fs.clone(),
        attestation.measurements_path.clone(),
    )?);
    let tls = Arc::new(create_attestation_server_config(
        issuer,
        vec![validator.clone() as Arc<dyn Validator>],
    ));

    let data_keys = MasterSecretKeyGetter::load(&fs, &config.master_secret_path)
        .await
        .with_context(|| "Loading master secret")?;
    let server = Arc::new(ActivationServer::new(
        fs.clone(),
        config,
        Arc::new(data_keys),
        Arc::new(Kubeadm::new(
            fs.clone(),
            &config.admin_conf_path,
            Arc::new(KubeadmCli::default()),
        )),
        Arc::new(KubeletCa::new(
            fs.clone(),
            &config.ca_cert_path,
            &config.ca_key_path,
        )),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = MeasurementWatcher::new(fs.resolve(&attestation.measurements_path), validator)?;
    let watcher_handle = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind activation service on {}", config.listen))?;
    let server_handle = tokio::spawn(server.serve(listener, tls, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = watcher_handle
        .await
        .with_context(|| "Measurement watcher panicked")?
    {
        warn!(error = %format!("{:#}", e), "Measurement watcher stopped with error");
    }
    server_handle
        .await
        .with_context(|| "Activation server panicked")??;
    info!("Activation service stopped");
    Ok(())
}
