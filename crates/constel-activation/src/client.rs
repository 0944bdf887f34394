use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use constel_atls::AttestationClientConfig;
use constel_core::protocol::activation::{
    ActivateNodeRequest, ActivateNodeResponse, ActivationRequest, ActivationResponse,
};
use constel_core::protocol::{FrameReader, FrameWriter};

/// Client of the activation service. Calls on one client share a connection.
pub struct ActivationClient {
    reader: FrameReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ActivationClient {
    /// Dial `addr` and complete the attested handshake.
    pub async fn connect(addr: &str, tls: &AttestationClientConfig) -> Result<Self> {
        let stream = tls
            .connect(addr)
            .await
            .with_context(|| format!("Failed to connect to activation service at {}", addr))?;
        debug!(addr = %addr, "Connected to activation service");
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

    async fn call(&mut self, request: &ActivationRequest) -> Result<ActivationResponse> {
        self.writer.send_message(request).await?;
        let response: ActivationResponse = self
            .reader
            .recv_message()
            .await
            .with_context(|| format!("No response to {}", request.method()))?;
        match response {
            ActivationResponse::Error(e) => Err(anyhow::Error::new(e)),
            other => Ok(other),
        }
    }

    pub async fn activate_node(
        &mut self,
        disk_uuid: &str,
        node_name: &str,
    ) -> Result<ActivateNodeResponse> {
        let request = ActivationRequest::ActivateNode(ActivateNodeRequest {
            disk_uuid: disk_uuid.to_string(),
            node_name: node_name.to_string(),
        });
        match self.call(&request).await? {
            ActivationResponse::ActivateNode(resp) => Ok(resp),
            other => anyhow::bail!("Unexpected response to ActivateNode: {:?}", other),
        }
    }

    /// Reserved call; current servers always answer `Unimplemented`.
    pub async fn activate_coordinator(&mut self) -> Result<()> {
        let response = self.call(&ActivationRequest::ActivateCoordinator).await?;
        anyhow::bail!("Unexpected response to ActivateCoordinator: {:?}", response)
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.call(&ActivationRequest::Ping).await? {
            ActivationResponse::Pong => Ok(()),
            other => anyhow::bail!("Unexpected response to Ping: {:?}", other),
        }
    }
}
