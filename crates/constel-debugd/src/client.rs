use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use constel_core::constants::DIAL_TIMEOUT;
use constel_core::protocol::debugd::{
    DebugdRequest, DebugdResponse, InfoEntry, ServiceUnit, SetInfoStatus,
    UploadBootstrapperStatus, UploadFilesStatus, UploadSystemdServiceUnitsStatus,
};
use constel_core::protocol::{FrameReader, FrameWriter};

use crate::filetransfer::FileTransferer;
use crate::streamer::FileStreamer;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Client for one debugd connection.
///
/// Calls run sequentially over the same connection. A call that fails inside
/// a stream leaves the connection unusable.
pub struct DebugdClient {
    reader: FrameReader<BoxedReader>,
    writer: FrameWriter<BoxedWriter>,
}

impl DebugdClient {
    /// Dial `host:port` (plaintext).
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Timed out dialling debugd at {}:{}", host, port))?
            .with_context(|| format!("Failed to dial debugd at {}:{}", host, port))?;
        stream.set_nodelay(true).ok();
        debug!(host = %host, port, "Connected to debugd");
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

    async fn unary(&mut self, request: &DebugdRequest) -> Result<DebugdResponse> {
        self.writer.send_message(request).await?;
        self.response(request.method()).await
    }

    async fn response(&mut self, method: &str) -> Result<DebugdResponse> {
        let response: DebugdResponse = self
            .reader
            .recv_message()
            .await
            .with_context(|| format!("No response to {}", method))?;
        match response {
            DebugdResponse::Error(e) => Err(anyhow::Error::new(e)),
            other => Ok(other),
        }
    }

    pub async fn set_info(&mut self, info: Vec<InfoEntry>) -> Result<SetInfoStatus> {
        match self.unary(&DebugdRequest::SetInfo { info }).await? {
            DebugdResponse::SetInfo { status } => Ok(status),
            other => anyhow::bail!("Unexpected response to SetInfo: {:?}", other),
        }
    }

    pub async fn get_info(&mut self) -> Result<Vec<InfoEntry>> {
        match self.unary(&DebugdRequest::GetInfo).await? {
            DebugdResponse::GetInfo { info } => Ok(info),
            other => anyhow::bail!("Unexpected response to GetInfo: {:?}", other),
        }
    }

    pub async fn upload_system_service_units(
        &mut self,
        units: Vec<ServiceUnit>,
    ) -> Result<UploadSystemdServiceUnitsStatus> {
        match self
            .unary(&DebugdRequest::UploadSystemServiceUnits { units })
            .await?
        {
            DebugdResponse::UploadSystemServiceUnits { status } => Ok(status),
            other => anyhow::bail!("Unexpected response to UploadSystemServiceUnits: {:?}", other),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.unary(&DebugdRequest::Ping).await? {
            DebugdResponse::Pong => Ok(()),
            other => anyhow::bail!("Unexpected response to Ping: {:?}", other),
        }
    }

    /// Stream the local file at `path` as the peer's bootstrapper.
    pub async fn upload_bootstrapper(
        &mut self,
        streamer: &FileStreamer,
        path: &Path,
        chunk_size: usize,
    ) -> Result<UploadBootstrapperStatus> {
        let request = DebugdRequest::UploadBootstrapper;
        let sent = async {
            self.writer.send_message(&request).await?;
            streamer
                .read_stream(path, &mut self.writer, chunk_size, true)
                .await?;
            self.writer.finish_stream().await
        }
        .await;
        match self.settle(request.method(), sent).await? {
            DebugdResponse::UploadBootstrapper { status } => Ok(status),
            other => anyhow::bail!("Unexpected response to UploadBootstrapper: {:?}", other),
        }
    }

    /// Fetch the peer's bootstrapper into `path`.
    pub async fn download_bootstrapper(&mut self, streamer: &FileStreamer, path: &Path) -> Result<()> {
        self.writer
            .send_message(&DebugdRequest::DownloadBootstrapper)
            .await?;
        streamer.write_stream(path, &mut self.reader, true).await
    }

    /// Send every file `transfer` holds.
    pub async fn upload_files(&mut self, transfer: &FileTransferer) -> Result<UploadFilesStatus> {
        let request = DebugdRequest::UploadFiles;
        let sent = async {
            self.writer.send_message(&request).await?;
            transfer.send_files(&mut self.writer).await?;
            self.writer.finish_stream().await
        }
        .await;
        match self.settle(request.method(), sent).await? {
            DebugdResponse::UploadFiles { status } => Ok(status),
            other => anyhow::bail!("Unexpected response to UploadFiles: {:?}", other),
        }
    }

    /// Receive the peer's files into `transfer`.
    pub async fn download_files(&mut self, transfer: &FileTransferer) -> Result<()> {
        self.writer.send_message(&DebugdRequest::DownloadFiles).await?;
        transfer.recv_files(&mut self.reader).await
    }

    /// Read the response of a client stream. The server may answer early and
    /// hang up, so a failed send still yields its response when there is one.
    async fn settle(&mut self, method: &str, sent: Result<()>) -> Result<DebugdResponse> {
        match self.response(method).await {
            Ok(response) => Ok(response),
            Err(e) => Err(sent.err().unwrap_or(e)),
        }
    }
}
