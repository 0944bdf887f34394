use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod activation;
pub mod debugd;
pub mod recovery;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Coarse error classification carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    InvalidArgument,
    FailedPrecondition,
    Internal,
    Unavailable,
    ResourceExhausted,
    Unimplemented,
}

/// Error returned by a remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Internal, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::FailedPrecondition, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::InvalidArgument, message)
    }
}

// ============================================================================
// Frame protocol (length-prefixed JSON)
// ============================================================================

/// Read a length-prefixed frame, returning `None` if the peer closed the
/// connection cleanly on a frame boundary.
pub async fn try_read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader
            .read(&mut len_buf[filled..])
            .await
            .with_context(|| "Failed to read frame length")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("Connection closed inside frame length");
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read frame body")?;

    Ok(Some(buf))
}

/// Read a length-prefixed frame; a closed connection is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    try_read_frame(reader)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Connection closed before frame"))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame too large: {} bytes (max {})",
            data.len(),
            MAX_FRAME_SIZE
        );
    }
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .with_context(|| "Failed to write frame length")?;
    writer
        .write_all(data)
        .await
        .with_context(|| "Failed to write frame body")?;
    writer
        .flush()
        .await
        .with_context(|| "Failed to flush frame")?;
    Ok(())
}

/// Serialize and send one message.
pub async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(msg).with_context(|| "Failed to serialize message")?;
    write_frame(writer, &data).await
}

/// Read and deserialize one message.
pub async fn recv_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "Failed to deserialize message")
}

// ============================================================================
// Message streams
// ============================================================================

/// One frame of a streaming RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamItem<T> {
    Message(T),
    End,
    Error(RpcError),
}

/// Receiving half of a message stream. `Ok(None)` marks the end.
#[async_trait]
pub trait RecvStream<T>: Send {
    async fn recv(&mut self) -> Result<Option<T>>;
}

/// Sending half of a message stream.
#[async_trait]
pub trait SendStream<T>: Send {
    async fn send(&mut self, msg: T) -> Result<()>;
}

/// Reads streamed messages from a framed connection.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read a single non-stream message.
    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        recv_message(&mut self.inner).await
    }

    /// Read a single non-stream message, or `None` on a clean close.
    pub async fn try_recv_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match try_read_frame(&mut self.inner).await? {
            Some(data) => Ok(Some(
                serde_json::from_slice(&data).with_context(|| "Failed to deserialize message")?,
            )),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<R, T> RecvStream<T> for FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned + Send,
{
    async fn recv(&mut self) -> Result<Option<T>> {
        let item: StreamItem<T> = match self.try_recv_message().await? {
            Some(item) => item,
            None => anyhow::bail!("Stream closed without end marker"),
        };
        match item {
            StreamItem::Message(msg) => Ok(Some(msg)),
            StreamItem::End => Ok(None),
            StreamItem::Error(e) => Err(anyhow::Error::new(e)),
        }
    }
}

/// Writes streamed messages to a framed connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write a single non-stream message.
    pub async fn send_message<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        send_message(&mut self.inner, msg).await
    }

    /// Terminate the stream successfully.
    pub async fn finish_stream(&mut self) -> Result<()> {
        self.send_message(&StreamItem::<()>::End).await
    }

    /// Terminate the stream with an error the peer can classify.
    pub async fn abort_stream(&mut self, err: RpcError) -> Result<()> {
        self.send_message(&StreamItem::<()>::Error(err)).await
    }

    /// Half-close the underlying connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .with_context(|| "Failed to shut down connection")
    }
}

#[async_trait]
impl<W, T> SendStream<T> for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Send + Sync + 'static,
{
    async fn send(&mut self, msg: T) -> Result<()> {
        self.send_message(&StreamItem::Message(msg)).await
    }
}

#[async_trait]
impl<T: Send> RecvStream<T> for tokio::sync::mpsc::Receiver<T> {
    async fn recv(&mut self) -> Result<Option<T>> {
        Ok(tokio::sync::mpsc::Receiver::recv(self).await)
    }
}

#[async_trait]
impl<T: Send + 'static> SendStream<T> for tokio::sync::mpsc::Sender<T> {
    async fn send(&mut self, msg: T) -> Result<()> {
        tokio::sync::mpsc::Sender::send(self, msg)
            .await
            .map_err(|_| anyhow::anyhow!("Stream receiver dropped"))
    }
}

#[async_trait]
impl<T: Send> SendStream<T> for Vec<T> {
    async fn send(&mut self, msg: T) -> Result<()> {
        self.push(msg);
        Ok(())
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize binary fields as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================
