use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use constel_atls::AttestationClientConfig;
use constel_core::constants::RECOVERY_PORT;
use constel_core::crypto::MasterSecret;
use constel_core::protocol::recovery::{RecoveryRequest, RecoveryResponse};
use constel_core::protocol::{FrameReader, FrameWriter};

pub struct RecoveryClient {
    reader: FrameReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl RecoveryClient {
    pub async fn connect(addr: &str, tls: &AttestationClientConfig) -> Result<Self> {
        let stream = tls
            .connect(addr)
            .await
            .with_context(|| format!("Failed to connect to recovery service at {}", addr))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: FrameReader::new(Box::new(read)),
            writer: FrameWriter::new(Box::new(write)),
        }
    }

    pub async fn push_state_disk_key(&mut self, key: Vec<u8>) -> Result<()> {
        self.writer
            .send_message(&RecoveryRequest::PushStateDiskKey {
                state_disk_key: key,
            })
            .await?;
        let response: RecoveryResponse = self
            .reader
            .recv_message()
            .await
            .with_context(|| "No response to PushStateDiskKey")?;
        match response {
            RecoveryResponse::PushStateDiskKey => Ok(()),
            RecoveryResponse::Error(e) => Err(anyhow::Error::new(e)),
        }
    }
}

/// `host` → `host:<port>`; endpoints with a port are kept.
pub fn with_default_port(endpoint: &str, port: u16) -> String {
    let has_port = match endpoint.rsplit_once(':') {
        Some((host, p)) => {
            !p.is_empty()
                && p.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        endpoint.to_string()
    } else if endpoint.contains(':') && !endpoint.starts_with('[') {
        format!("[{}]:{}", endpoint, port)
    } else {
        format!("{}:{}", endpoint, port)
    }
}

/// Derive the state-disk key of `disk_uuid` and push it to a waiting node.
pub async fn recover(
    endpoint: &str,
    secret: &MasterSecret,
    disk_uuid: &str,
    tls: &AttestationClientConfig,
) -> Result<()> {
    let key = secret
        .derive_state_disk_key(disk_uuid)
        .with_context(|| "Deriving state disk key")?;
    let addr = with_default_port(endpoint, RECOVERY_PORT);
    info!(endpoint = %addr, disk_uuid = %disk_uuid, "Pushing state disk key");
    let mut client = RecoveryClient::connect(&addr, tls).await?;
    client.push_state_disk_key(key.to_vec()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyapi::KeyApi;
    use constel_atls::measured::{MeasuredIssuer, MeasuredValidator, Measurements};
    use constel_atls::{Validator, create_attestation_client_config, create_attestation_server_config};
    use constel_core::protocol::{RpcError, RpcErrorKind};
    use constel_core::state::CloudProvider;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const UUID: &str = "00000000-0000-0000-0000-000000000000";

    fn measurements() -> Measurements {
        [(4, "aa".to_string()), (9, "bb".to_string())].into()
    }

    fn validator() -> Arc<dyn Validator> {
        Arc::new(MeasuredValidator::new(CloudProvider::Gcp, measurements()))
    }

    fn key_api() -> Arc<KeyApi> {
        let issuer = Arc::new(MeasuredIssuer::new(CloudProvider::Gcp, measurements()));
        KeyApi::new(Arc::new(create_attestation_server_config(issuer, vec![])))
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("192.0.2.3", 9999), "192.0.2.3:9999");
        assert_eq!(with_default_port("192.0.2.3:1234", 9999), "192.0.2.3:1234");
        assert_eq!(with_default_port("node.local", 9999), "node.local:9999");
        assert_eq!(with_default_port("::1", 9999), "[::1]:9999");
        assert_eq!(with_default_port("[::1]:10", 9999), "[::1]:10");
    }

    #[tokio::test]
    async fn test_recover_unlocks_waiting_node() {
        let api = key_api();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = api.clone();
        let waiting = tokio::spawn(async move { server.wait_on_listener(UUID, &listener).await });

        let secret = MasterSecret::from_bytes(vec![0u8; 32]).unwrap();
        let tls = create_attestation_client_config(None, vec![validator()]);
        recover(&addr, &secret, &UUID.to_uppercase(), &tls)
            .await
            .unwrap();

        let key = waiting.await.unwrap().unwrap();
        assert_eq!(key.len(), 32);
        assert_eq!(key[0], 0xa8);
        assert_eq!(*key, *secret.derive_state_disk_key(UUID).unwrap());
    }

    #[tokio::test]
    async fn test_second_push_is_refused() {
        let api = key_api();
        api.push_state_disk_key(vec![0; 32]).unwrap();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let peer = "127.0.0.1:50000".parse().unwrap();
        let server = api.clone();
        tokio::spawn(async move { server.handle_connection(server_io, peer).await });

        let mut client = RecoveryClient::from_stream(client_io);
        let err = client.push_state_disk_key(vec![1; 32]).await.unwrap_err();
        let rpc = err.downcast_ref::<RpcError>().unwrap();
        assert_eq!(rpc.kind, RpcErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_recover_rejects_bad_uuid_before_dialing() {
        let secret = MasterSecret::from_bytes(vec![0u8; 32]).unwrap();
        let tls = create_attestation_client_config(None, vec![validator()]);
        let err = recover("127.0.0.1:1", &secret, "not-a-uuid", &tls)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Deriving state disk key"));
    }

    #[tokio::test]
    async fn test_recover_refuses_unattested_server() {
        let api = key_api();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = api.clone();
        tokio::spawn(async move { server.wait_on_listener(UUID, &listener).await });

        let secret = MasterSecret::from_bytes(vec![0u8; 32]).unwrap();
        let expect_other: Arc<dyn Validator> = Arc::new(MeasuredValidator::new(
            CloudProvider::Gcp,
            [(4, "ff".to_string())].into(),
        ));
        let tls = create_attestation_client_config(None, vec![expect_other]);
        assert!(recover(&addr, &secret, UUID, &tls).await.is_err());
        assert!(!api.has_key());
    }
}
