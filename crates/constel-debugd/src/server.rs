use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use constel_core::config::DebugdSection;
use constel_core::constants::KEEPALIVE_MIN_PING_INTERVAL;
use constel_core::fs::HostFs;
use constel_core::protocol::debugd::{
    DebugdRequest, DebugdResponse, InfoEntry, ServiceUnit, SetInfoStatus,
    UploadBootstrapperStatus, UploadFilesStatus, UploadSystemdServiceUnitsStatus,
};
use constel_core::protocol::{FrameReader, FrameWriter, RecvStream, RpcError, RpcErrorKind};
use serde::de::IgnoredAny;

use crate::deploy::{ServiceManager, SystemdAction};
use crate::filetransfer::{FileTransferer, TransferError};
use crate::info::InfoMap;
use crate::streamer::{FileStreamer, StreamerError};

/// What a handler reports back to the connection loop.
struct Outcome {
    /// Classification logged for the call.
    result: &'static str,
    /// False when the request stream was left half-read.
    reusable: bool,
}

impl Outcome {
    fn done(result: &'static str) -> Self {
        Self {
            result,
            reusable: true,
        }
    }

    fn close(result: &'static str) -> Self {
        Self {
            result,
            reusable: false,
        }
    }
}

/// The debugd RPC server.
pub struct DebugdServer {
    fs: HostFs,
    streamer: FileStreamer,
    transfer: Arc<FileTransferer>,
    info: Arc<InfoMap>,
    service_manager: Arc<ServiceManager>,
    bootstrapper_path: PathBuf,
    bootstrapper_unit: String,
    chunk_size: usize,
    pings: Mutex<HashMap<IpAddr, Instant>>,
}

impl DebugdServer {
    pub fn new(
        fs: HostFs,
        transfer: Arc<FileTransferer>,
        info: Arc<InfoMap>,
        service_manager: Arc<ServiceManager>,
        config: &DebugdSection,
    ) -> Self {
        Self {
            streamer: FileStreamer::new(fs.clone()),
            fs,
            transfer,
            info,
            service_manager,
            bootstrapper_path: config.bootstrapper_path.clone(),
            bootstrapper_unit: config.bootstrapper_unit.clone(),
            chunk_size: config.chunk_size,
            pings: Mutex::new(HashMap::new()),
        }
    }

    /// Accept connections until `shutdown` flips, one task per connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let local = listener
            .local_addr()
            .with_context(|| "Failed to read listener address")?;
        info!(listen = %local, "debugd listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer.ip()).await {
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
                    info!(listen = %local, "debugd listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serve requests on one connection until the client hangs up.
    pub async fn handle_connection<S>(&self, stream: S, peer: IpAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        while let Some(request) = reader.try_recv_message::<DebugdRequest>().await? {
            let method = request.method();
            info!(peer = %peer, method, "RPC received");
            let outcome = self
                .dispatch(request, peer, &mut reader, &mut writer)
                .await
                .with_context(|| format!("{} from {}", method, peer))?;
            info!(peer = %peer, method, result = outcome.result, "RPC finished");
            if !outcome.reusable {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch<R, W>(
        &self,
        request: DebugdRequest,
        peer: IpAddr,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        match request {
            DebugdRequest::SetInfo { info } => self.set_info(info, writer).await,
            DebugdRequest::GetInfo => self.get_info(writer).await,
            DebugdRequest::UploadBootstrapper => self.upload_bootstrapper(reader, writer).await,
            DebugdRequest::DownloadBootstrapper => self.download_bootstrapper(writer).await,
            DebugdRequest::UploadFiles => self.upload_files(reader, writer).await,
            DebugdRequest::DownloadFiles => self.download_files(writer).await,
            DebugdRequest::UploadSystemServiceUnits { units } => {
                self.upload_system_service_units(units, writer).await
            }
            DebugdRequest::Ping => self.ping(peer, Instant::now(), writer).await,
        }
    }

    // ========================================================================
    // Info
    // ========================================================================

    async fn set_info<W>(&self, info: Vec<InfoEntry>, writer: &mut FrameWriter<W>) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let status = match self.info.set_proto(info) {
            Ok(()) => SetInfoStatus::Success,
            Err(_) => SetInfoStatus::AlreadySet,
        };
        writer
            .send_message(&DebugdResponse::SetInfo { status })
            .await?;
        Ok(Outcome::done(match status {
            SetInfoStatus::Success => "ok",
            SetInfoStatus::AlreadySet => "AlreadySet",
        }))
    }

    async fn get_info<W>(&self, writer: &mut FrameWriter<W>) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        match self.info.get_proto() {
            Ok(info) => {
                writer.send_message(&DebugdResponse::GetInfo { info }).await?;
                Ok(Outcome::done("ok"))
            }
            // get_proto only fails while the map is unset.
            Err(e) => {
                writer
                    .send_message(&DebugdResponse::Error(RpcError::failed_precondition(
                        e.to_string(),
                    )))
                    .await?;
                Ok(Outcome::done("FailedPrecondition"))
            }
        }
    }

    // ========================================================================
    // Bootstrapper
    // ========================================================================

    async fn upload_bootstrapper<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let (status, reusable) = self.receive_bootstrapper(reader).await;
        writer
            .send_message(&DebugdResponse::UploadBootstrapper { status })
            .await?;
        let result = match status {
            UploadBootstrapperStatus::Success => "ok",
            UploadBootstrapperStatus::UploadFailed => "UploadFailed",
            UploadBootstrapperStatus::StartFailed => "StartFailed",
            UploadBootstrapperStatus::FileExists => "FileExists",
        };
        Ok(if reusable {
            Outcome::done(result)
        } else {
            Outcome::close(result)
        })
    }

    async fn receive_bootstrapper<R>(
        &self,
        reader: &mut FrameReader<R>,
    ) -> (UploadBootstrapperStatus, bool)
    where
        R: AsyncRead + Send + Unpin,
    {
        if self.fs.exists(&self.bootstrapper_path).await {
            warn!(path = %self.bootstrapper_path.display(), "Bootstrapper already present, refusing upload");
            return (UploadBootstrapperStatus::FileExists, drain(reader).await);
        }

        let written = async {
            self.streamer
                .write_stream(&self.bootstrapper_path, reader, true)
                .await?;
            self.fs.set_mode(&self.bootstrapper_path, 0o755).await
        }
        .await;
        if let Err(e) = written {
            error!(error = %format!("{:#}", e), "Bootstrapper upload failed");
            return (UploadBootstrapperStatus::UploadFailed, false);
        }
        info!(path = %self.bootstrapper_path.display(), "Bootstrapper received");

        let unit = format!("{}.service", self.bootstrapper_unit);
        if let Err(e) = self
            .service_manager
            .systemd_action(&unit, SystemdAction::Start)
            .await
        {
            error!(unit = %unit, error = %format!("{:#}", e), "Starting bootstrapper failed");
            return (UploadBootstrapperStatus::StartFailed, true);
        }
        (UploadBootstrapperStatus::Success, true)
    }

    async fn download_bootstrapper<W>(&self, writer: &mut FrameWriter<W>) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let sent = self
            .streamer
            .read_stream(&self.bootstrapper_path, writer, self.chunk_size, true)
            .await;
        self.finish_server_stream(sent, writer).await
    }

    // ========================================================================
    // Files
    // ========================================================================

    async fn upload_files<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let (status, reusable) = match self.transfer.recv_files(reader).await {
            Ok(()) => (self.apply_overrides().await, true),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "File upload rejected");
                match e.downcast_ref::<TransferError>() {
                    Some(TransferError::AlreadyRunning) => {
                        (UploadFilesStatus::AlreadyStarted, drain(reader).await)
                    }
                    Some(TransferError::AlreadyFinished) => {
                        (UploadFilesStatus::AlreadyFinished, drain(reader).await)
                    }
                    _ => (UploadFilesStatus::UploadFailed, false),
                }
            }
        };
        writer
            .send_message(&DebugdResponse::UploadFiles { status })
            .await?;
        let result = match status {
            UploadFilesStatus::Success => "ok",
            UploadFilesStatus::UploadFailed => "UploadFailed",
            UploadFilesStatus::AlreadyStarted => "AlreadyStarted",
            UploadFilesStatus::AlreadyFinished => "AlreadyFinished",
            UploadFilesStatus::StartFailed => "StartFailed",
        };
        Ok(if reusable {
            Outcome::done(result)
        } else {
            Outcome::close(result)
        })
    }

    /// Point every overridden unit at its received file. All overrides are
    /// attempted; any failure reports `StartFailed`.
    async fn apply_overrides(&self) -> UploadFilesStatus {
        let mut status = UploadFilesStatus::Success;
        for file in self.transfer.get_files().await {
            let Some(unit) = &file.override_service_unit else {
                continue;
            };
            if let Err(e) = self
                .service_manager
                .override_service_unit_exec_start(unit, &file.target_path)
                .await
            {
                error!(unit = %unit, error = %format!("{:#}", e), "Applying ExecStart override failed");
                status = UploadFilesStatus::StartFailed;
            }
        }
        status
    }

    async fn download_files<W>(&self, writer: &mut FrameWriter<W>) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        if !self.transfer.can_send().await {
            writer
                .abort_stream(RpcError::failed_precondition("not ready"))
                .await?;
            return Ok(Outcome::done("FailedPrecondition"));
        }
        let sent = self.transfer.send_files(writer).await;
        self.finish_server_stream(sent, writer).await
    }

    // ========================================================================
    // Units and keepalive
    // ========================================================================

    async fn upload_system_service_units<W>(
        &self,
        units: Vec<ServiceUnit>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut status = UploadSystemdServiceUnitsStatus::Success;
        for unit in &units {
            if let Err(e) = self.service_manager.write_systemd_unit_file(unit).await {
                error!(unit = %unit.name, error = %format!("{:#}", e), "Writing systemd unit failed");
                status = UploadSystemdServiceUnitsStatus::Failure;
                break;
            }
        }
        writer
            .send_message(&DebugdResponse::UploadSystemServiceUnits { status })
            .await?;
        Ok(Outcome::done(match status {
            UploadSystemdServiceUnitsStatus::Success => "ok",
            UploadSystemdServiceUnitsStatus::Failure => "Failure",
        }))
    }

    async fn ping<W>(&self, peer: IpAddr, now: Instant, writer: &mut FrameWriter<W>) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        if !self.accept_ping(peer, now) {
            writer
                .send_message(&DebugdResponse::Error(RpcError::new(
                    RpcErrorKind::ResourceExhausted,
                    "too many pings",
                )))
                .await?;
            return Ok(Outcome::done("ResourceExhausted"));
        }
        writer.send_message(&DebugdResponse::Pong).await?;
        Ok(Outcome::done("ok"))
    }

    /// Enforce the minimum interval between two pings of one peer.
    fn accept_ping(&self, peer: IpAddr, now: Instant) -> bool {
        let mut pings = match self.pings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match pings.get(&peer) {
            Some(last) if now.duration_since(*last) < KEEPALIVE_MIN_PING_INTERVAL => false,
            _ => {
                pings.insert(peer, now);
                true
            }
        }
    }

    async fn finish_server_stream<W>(
        &self,
        sent: Result<()>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Outcome>
    where
        W: AsyncWrite + Send + Unpin,
    {
        match sent {
            Ok(()) => {
                writer.finish_stream().await?;
                Ok(Outcome::done("ok"))
            }
            Err(e) => {
                let status = classify(&e);
                warn!(error = %format!("{:#}", e), "Server stream aborted");
                let result = kind_label(status.kind);
                writer.abort_stream(status).await?;
                Ok(Outcome::done(result))
            }
        }
    }
}

/// Consume the rest of a client stream that was refused up front.
/// Returns whether the connection is still in sync.
async fn drain<R>(reader: &mut FrameReader<R>) -> bool
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        match RecvStream::<IgnoredAny>::recv(reader).await {
            Ok(Some(_)) => continue,
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

/// Map a handler failure to the error the peer sees.
fn classify(err: &anyhow::Error) -> RpcError {
    if let Some(TransferError::NotReady) = err.downcast_ref::<TransferError>() {
        return RpcError::failed_precondition("not ready");
    }
    match err.downcast_ref::<StreamerError>() {
        Some(StreamerError::WriteInProgress) => {
            RpcError::new(RpcErrorKind::Unavailable, err.to_string())
        }
        Some(StreamerError::InvalidChunkSize) => RpcError::invalid_argument(err.to_string()),
        _ => RpcError::internal(format!("{:#}", err)),
    }
}

fn kind_label(kind: RpcErrorKind) -> &'static str {
    match kind {
        RpcErrorKind::InvalidArgument => "InvalidArgument",
        RpcErrorKind::FailedPrecondition => "FailedPrecondition",
        RpcErrorKind::Internal => "Internal",
        RpcErrorKind::Unavailable => "Unavailable",
        RpcErrorKind::ResourceExhausted => "ResourceExhausted",
        RpcErrorKind::Unimplemented => "Unimplemented",
    }
}
