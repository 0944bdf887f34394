use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use constel_atls::AttestationServerConfig;
use constel_core::crypto::STATE_DISK_KEY_LENGTH;
use constel_core::protocol::recovery::{RecoveryRequest, RecoveryResponse};
use constel_core::protocol::{FrameReader, FrameWriter, RpcError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    #[error("node already received a passphrase")]
    AlreadyReceived,
    #[error("received invalid passphrase: expected length: {expected}, but got: {got}")]
    InvalidLength { expected: usize, got: usize },
}

impl From<RecoveryError> for RpcError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::AlreadyReceived => RpcError::failed_precondition(e.to_string()),
            RecoveryError::InvalidLength { .. } => RpcError::invalid_argument(e.to_string()),
        }
    }
}

/// Accepts a single state-disk key pushed by an operator or control plane.
pub struct KeyApi {
    tls: Arc<AttestationServerConfig>,
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
    received: watch::Sender<bool>,
}

impl KeyApi {
    pub fn new(tls: Arc<AttestationServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            tls,
            key: Mutex::new(None),
            received: watch::Sender::new(false),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<Zeroizing<Vec<u8>>>> {
        match self.key.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store `key` unless one was already accepted.
    pub fn push_state_disk_key(&self, key: Vec<u8>) -> Result<(), RecoveryError> {
        let key = Zeroizing::new(key);
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(RecoveryError::AlreadyReceived);
        }
        if key.len() != STATE_DISK_KEY_LENGTH {
            return Err(RecoveryError::InvalidLength {
                expected: STATE_DISK_KEY_LENGTH,
                got: key.len(),
            });
        }
        *slot = Some(key);
        drop(slot);
        self.received.send_replace(true);
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        *self.received.borrow()
    }

    /// Forget an accepted key so another push can be made, e.g. after the
    /// key failed to open the disk.
    pub fn reset_key(&self) {
        *self.slot() = None;
        self.received.send_replace(false);
    }

    /// Serve on `listen` until a key arrives and return it.
    pub async fn wait_for_decryption_key(
        self: Arc<Self>,
        disk_uuid: &str,
        listen: SocketAddr,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind recovery service on {}", listen))?;
        self.wait_on_listener(disk_uuid, &listener).await
    }

    /// Like [`wait_for_decryption_key`](Self::wait_for_decryption_key) on
    /// an already bound listener.
    pub async fn wait_on_listener(
        self: Arc<Self>,
        disk_uuid: &str,
        listener: &TcpListener,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if disk_uuid.is_empty() {
            anyhow::bail!("Received no disk UUID");
        }
        let local = listener
            .local_addr()
            .with_context(|| "Failed to read listener address")?;
        info!(listen = %local, disk_uuid = %disk_uuid, "Waiting for decryption key");

        let mut received = self.received.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                let stream = match api.tls.accept(stream).await {
                                    Ok(s) => s,
                                    Err(e) => {
                                        warn!(peer = %peer, error = %format!("{:#}", e), "Attestation handshake failed");
                                        return;
                                    }
                                };
                                if let Err(e) = api.handle_connection(stream, peer).await {
                                    warn!(peer = %peer, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                result = received.wait_for(|got| *got) => {
                    result.with_context(|| "Key notifier closed")?;
                    break;
                }
            }
        }

        info!(listen = %local, "Decryption key received");
        self.slot()
            .clone()
            .with_context(|| "Key was reset before it could be used")
    }

    /// Serve requests on one established connection.
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        while let Some(request) = reader.try_recv_message::<RecoveryRequest>().await? {
            let response = match request {
                RecoveryRequest::PushStateDiskKey { state_disk_key } => {
                    info!(peer = %peer, method = "PushStateDiskKey", "RPC received");
                    match self.push_state_disk_key(state_disk_key) {
                        Ok(()) => RecoveryResponse::PushStateDiskKey,
                        Err(e) => {
                            error!(peer = %peer, error = %e, "PushStateDiskKey rejected");
                            RecoveryResponse::Error(e.into())
                        }
                    }
                }
            };
            writer.send_message(&response).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use constel_atls::create_attestation_server_config;
    use constel_atls::measured::{MeasuredIssuer, Measurements};
    use constel_core::protocol::RpcErrorKind;
    use constel_core::state::CloudProvider;

    fn api() -> Arc<KeyApi> {
        let issuer = Arc::new(MeasuredIssuer::new(CloudProvider::Qemu, Measurements::new()));
        KeyApi::new(Arc::new(create_attestation_server_config(issuer, vec![])))
    }

    #[test]
    fn test_accepts_exactly_one_key() {
        let api = api();
        api.push_state_disk_key(vec![1; 32]).unwrap();
        assert_eq!(
            api.push_state_disk_key(vec![2; 32]),
            Err(RecoveryError::AlreadyReceived)
        );
        assert_eq!(api.slot().as_deref().map(|k| k.to_vec()), Some(vec![1; 32]));
    }

    #[test]
    fn test_rejects_wrong_length() {
        let api = api();
        assert_eq!(
            api.push_state_disk_key(vec![1; 31]),
            Err(RecoveryError::InvalidLength {
                expected: 32,
                got: 31
            })
        );
        // A rejected push leaves the slot open.
        api.push_state_disk_key(vec![1; 32]).unwrap();
    }

    #[test]
    fn test_error_kinds() {
        let rpc: RpcError = RecoveryError::AlreadyReceived.into();
        assert_eq!(rpc.kind, RpcErrorKind::FailedPrecondition);
        assert_eq!(rpc.message, "node already received a passphrase");
        let rpc: RpcError = RecoveryError::InvalidLength { expected: 32, got: 0 }.into();
        assert_eq!(rpc.kind, RpcErrorKind::InvalidArgument);
    }

    #[test]
    fn test_reset_key() {
        let api = api();
        api.push_state_disk_key(vec![1; 32]).unwrap();
        api.reset_key();
        assert!(!api.has_key());
        api.push_state_disk_key(vec![3; 32]).unwrap();
        assert!(api.has_key());
    }

    #[tokio::test]
    async fn test_empty_disk_uuid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(api().wait_on_listener("", &listener).await.is_err());
    }
}
