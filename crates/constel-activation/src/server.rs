use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use constel_atls::AttestationServerConfig;
use constel_core::config::ActivationSection;
use constel_core::crypto::STATE_DISK_KEY_LENGTH;
use constel_core::fs::HostFs;
use constel_core::identity::IdFile;
use constel_core::protocol::activation::{
    ActivateNodeRequest, ActivateNodeResponse, ActivationRequest, ActivationResponse,
};
use constel_core::protocol::{FrameReader, FrameWriter, RpcError, RpcErrorKind};

use crate::ca::CertificateAuthority;
use crate::keys::DataKeyGetter;
use crate::kubeadm::JoinTokenGetter;

/// Step of node activation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadIds,
    DataKey,
    JoinToken,
    KubeletCert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LoadIds => "load IDs",
            Self::DataKey => "get key for stateful disk",
            Self::JoinToken => "generate Kubernetes join arguments",
            Self::KubeletCert => "generate kubelet certificate",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unable to {stage}: {message}")]
pub struct ActivationError {
    pub stage: Stage,
    pub message: String,
}

impl From<ActivationError> for RpcError {
    fn from(e: ActivationError) -> Self {
        RpcError::internal(e.to_string())
    }
}

/// Run one activation stage against the request deadline.
async fn stage<T, F>(deadline: Instant, stage: Stage, fut: F) -> Result<T, ActivationError>
where
    F: Future<Output = Result<T>>,
{
    debug!(stage = %stage, "Activation stage");
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ActivationError {
            stage,
            message: format!("{:#}", e),
        }),
        Err(_) => Err(ActivationError {
            stage,
            message: "request deadline exceeded".to_string(),
        }),
    }
}

/// Hands joining nodes their disk key, join token and kubelet credentials.
///
/// Stateless apart from the identity file, which is read on every request.
pub struct ActivationServer {
    fs: HostFs,
    identity_path: PathBuf,
    data_keys: Arc<dyn DataKeyGetter>,
    join_tokens: Arc<dyn JoinTokenGetter>,
    ca: Arc<dyn CertificateAuthority>,
    token_ttl: Duration,
    deadline: Duration,
}

impl ActivationServer {
    pub fn new(
        fs: HostFs,
        config: &ActivationSection,
        data_keys: Arc<dyn DataKeyGetter>,
        join_tokens: Arc<dyn JoinTokenGetter>,
        ca: Arc<dyn CertificateAuthority>,
    ) -> Self {
        Self {
            fs,
            identity_path: config.identity_path.clone(),
            data_keys,
            join_tokens,
            ca,
            token_ttl: config.token_ttl(),
            deadline: config.request_deadline(),
        }
    }

    /// Activate one worker. Stages run strictly in order and the first
    /// failure aborts the request.
    pub async fn activate_node(
        &self,
        req: &ActivateNodeRequest,
    ) -> Result<ActivateNodeResponse, ActivationError> {
        let deadline = Instant::now() + self.deadline;

        let id = stage(deadline, Stage::LoadIds, async {
            IdFile::load(&self.fs, &self.identity_path).await
        })
        .await?;

        let state_disk_key = stage(deadline, Stage::DataKey, async {
            self.data_keys
                .get_data_key(&req.disk_uuid, STATE_DISK_KEY_LENGTH)
                .await
        })
        .await?;

        let (join, ca_hash) = stage(deadline, Stage::JoinToken, async {
            let mut bundle = self.join_tokens.get_join_token(self.token_ttl).await?;
            if bundle.ca_cert_hashes.is_empty() {
                anyhow::bail!("join token carries no CA certificate hash");
            }
            let hash = bundle.ca_cert_hashes.swap_remove(0);
            Ok::<_, anyhow::Error>((bundle, hash))
        })
        .await?;

        let (kubelet_cert, kubelet_key) = stage(deadline, Stage::KubeletCert, async {
            self.ca.get_certificate(&req.node_name).await
        })
        .await?;

        Ok(ActivateNodeResponse {
            state_disk_key,
            cluster_id: id.cluster_id,
            owner_id: id.owner_id,
            api_server_endpoint: join.api_server_endpoint,
            token: join.token,
            discovery_token_ca_cert_hash: ca_hash,
            kubelet_cert,
            kubelet_key,
        })
    }

    /// Accept attested connections until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Arc<AttestationServerConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let local = listener
            .local_addr()
            .with_context(|| "Failed to read listener address")?;
        info!(listen = %local, "Activation service listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            let tls = Arc::clone(&tls);
                            tokio::spawn(async move {
                                let stream = match tls.accept(stream).await {
                                    Ok(s) => s,
                                    Err(e) => {
                                        warn!(peer = %peer, error = %format!("{:#}", e), "Attestation handshake rejected");
                                        return;
                                    }
                                };
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    warn!(peer = %peer, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(listen = %local, "Activation listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serve requests on one established connection.
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        while let Some(request) = reader.try_recv_message::<ActivationRequest>().await? {
            let method = request.method();
            info!(peer = %peer, method, "RPC received");
            let response = self.dispatch(request).await;
            match &response {
                ActivationResponse::Error(e) => {
                    error!(peer = %peer, method, kind = ?e.kind, error = %e.message, "RPC failed")
                }
                _ => info!(peer = %peer, method, result = "ok", "RPC finished"),
            }
            writer.send_message(&response).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: ActivationRequest) -> ActivationResponse {
        match request {
            ActivationRequest::ActivateNode(req) => match self.activate_node(&req).await {
                Ok(resp) => {
                    info!(node = %req.node_name, "Node activated");
                    ActivationResponse::ActivateNode(resp)
                }
                Err(e) => ActivationResponse::Error(e.into()),
            },
            ActivationRequest::ActivateCoordinator => ActivationResponse::Error(RpcError::new(
                RpcErrorKind::Unimplemented,
                "ActivateCoordinator is not implemented",
            )),
            ActivationRequest::Ping => ActivationResponse::Pong,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::client::ActivationClient;
    use crate::kubeadm::JoinTokenBundle;

    fn request() -> ActivateNodeRequest {
        ActivateNodeRequest {
            disk_uuid: "uuid".to_string(),
            node_name: "n1".to_string(),
        }
    }

    async fn happy() -> (tempfile::TempDir, ActivationServer) {
        server(
            StubKeys(Ok(vec![1, 2, 3])),
            StubKubeadm(Ok(bundle())),
            StubCa(Ok((b"cert".to_vec(), b"key".to_vec()))),
        )
        .await
    }

    #[tokio::test]
    async fn test_activate_node_happy_path() {
        let (_dir, server) = happy().await;
        let resp = server.activate_node(&request()).await.unwrap();
        assert_eq!(
            resp,
            ActivateNodeResponse {
                state_disk_key: vec![1, 2, 3],
                cluster_id: vec![7, 8, 9],
                owner_id: vec![4, 5, 6],
                api_server_endpoint: "192.0.2.1".to_string(),
                token: "t".to_string(),
                discovery_token_ca_cert_hash: "h".to_string(),
                kubelet_cert: b"cert".to_vec(),
                kubelet_key: b"key".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_first_ca_hash_only() {
        let mut two = bundle();
        two.ca_cert_hashes = vec!["first".to_string(), "second".to_string()];
        let (_dir, server) = server(
            StubKeys(Ok(vec![1])),
            StubKubeadm(Ok(two)),
            StubCa(Ok((vec![], vec![]))),
        )
        .await;
        let resp = server.activate_node(&request()).await.unwrap();
        assert_eq!(resp.discovery_token_ca_cert_hash, "first");
    }

    #[tokio::test]
    async fn test_failing_stage_is_named() {
        let (_dir, s) = server(
            StubKeys(Err("kms down".to_string())),
            StubKubeadm(Ok(bundle())),
            StubCa(Ok((vec![], vec![]))),
        )
        .await;
        let err = s.activate_node(&request()).await.unwrap_err();
        assert_eq!(err.stage, Stage::DataKey);
        assert!(err.to_string().contains("kms down"));

        let no_hash = JoinTokenBundle {
            ca_cert_hashes: vec![],
            ..bundle()
        };
        let (_dir, s) = server(
            StubKeys(Ok(vec![1])),
            StubKubeadm(Ok(no_hash)),
            StubCa(Ok((vec![], vec![]))),
        )
        .await;
        assert_eq!(
            s.activate_node(&request()).await.unwrap_err().stage,
            Stage::JoinToken
        );

        let (_dir, s) = server(
            StubKeys(Ok(vec![1])),
            StubKubeadm(Ok(bundle())),
            StubCa(Err("ca key unreadable".to_string())),
        )
        .await;
        assert_eq!(
            s.activate_node(&request()).await.unwrap_err().stage,
            Stage::KubeletCert
        );
    }

    #[tokio::test]
    async fn test_missing_identity_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = ActivationServer::new(
            HostFs::rooted(dir.path()),
            &ActivationSection::default(),
            Arc::new(StubKeys(Ok(vec![1]))),
            Arc::new(StubKubeadm(Ok(bundle()))),
            Arc::new(StubCa(Ok((vec![], vec![])))),
        );
        let err = server.activate_node(&request()).await.unwrap_err();
        assert_eq!(err.stage, Stage::LoadIds);
        assert!(err.to_string().starts_with("unable to load IDs"));
    }

    #[tokio::test]
    async fn test_rpc_over_connection() {
        let (_dir, server) = happy().await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let handle =
            tokio::spawn(async move { server.handle_connection(server_io, peer).await });

        let mut client = ActivationClient::from_stream(client_io);
        client.ping().await.unwrap();
        let resp = client.activate_node("uuid", "n1").await.unwrap();
        assert_eq!(resp.cluster_id, vec![7, 8, 9]);

        let err = client.activate_coordinator().await.unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.kind, RpcErrorKind::Unimplemented);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_internal_error_over_connection() {
        let (_dir, server) = server(
            StubKeys(Ok(vec![1])),
            StubKubeadm(Err("kubeadm missing".to_string())),
            StubCa(Ok((vec![], vec![]))),
        )
        .await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        tokio::spawn(async move { server.handle_connection(server_io, peer).await });

        let mut client = ActivationClient::from_stream(client_io);
        let err = client.activate_node("uuid", "n1").await.unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.kind, RpcErrorKind::Internal);
        assert!(rpc.message.contains("join arguments"));
    }

    #[tokio::test]
    async fn test_serve_over_attested_tls() {
        use constel_atls::measured::{MeasuredIssuer, MeasuredValidator, Measurements};
        use constel_atls::{Validator, create_attestation_client_config, create_attestation_server_config};
        use constel_core::state::CloudProvider;

        let (_dir, server) = happy().await;
        let good: Measurements = [(4, "aa".to_string())].into();
        let issuer = Arc::new(MeasuredIssuer::new(CloudProvider::Qemu, good.clone()));
        let validator: Arc<dyn Validator> =
            Arc::new(MeasuredValidator::new(CloudProvider::Qemu, good));
        let tls = Arc::new(create_attestation_server_config(
            issuer.clone(),
            vec![validator.clone()],
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(server).serve(listener, tls, rx));

        let client_tls = create_attestation_client_config(Some(issuer), vec![validator.clone()]);
        let mut client = ActivationClient::connect(&addr, &client_tls).await.unwrap();
        let resp = client.activate_node("uuid", "n1").await.unwrap();
        assert_eq!(resp.owner_id, vec![4, 5, 6]);

        // A node reporting other measurements never reaches the handler.
        let rogue = Arc::new(MeasuredIssuer::new(
            CloudProvider::Qemu,
            [(4, "bb".to_string())].into(),
        ));
        let rogue_tls = create_attestation_client_config(Some(rogue), vec![validator]);
        let refused = match ActivationClient::connect(&addr, &rogue_tls).await {
            Err(_) => true,
            Ok(mut c) => c.activate_node("uuid", "n1").await.is_err(),
        };
        assert!(refused);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
