use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use constel_core::constants::CHUNK_SIZE;
use constel_core::fs::HostFs;
use constel_core::protocol::debugd::{Chunk, FileTransferMessage};
use constel_core::protocol::{RecvStream, SendStream};

use crate::streamer::FileStreamer;

/// A file known to the transferer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Where the file is read from when sending.
    pub source_path: String,
    /// Where the receiving side writes it.
    pub target_path: String,
    pub mode: u32,
    /// Unit whose `ExecStart` is pointed at `target_path` after a transfer.
    pub override_service_unit: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("not ready to send files")]
    NotReady,
    #[error("a receive is already running")]
    AlreadyRunning,
    #[error("files were already received")]
    AlreadyFinished,
    #[error("expected a file header")]
    ExpectedHeader,
    #[error("unexpected header before the last chunk of {0}")]
    UnexpectedHeader(String),
}

#[derive(Debug, Default)]
struct ReceiveState {
    started: bool,
    finished: bool,
    /// Set by [`FileTransferer::set_files`] rather than a receive.
    local: bool,
    files: Vec<FileStat>,
}

/// Sends and receives sets of files over a [`FileTransferMessage`] stream.
///
/// Files are received at most once. A failed or cancelled receive leaves the
/// transferer idle with no files, ready for another attempt. The state lock
/// is only held for flag transitions, never across a transfer.
pub struct FileTransferer {
    fs: HostFs,
    streamer: FileStreamer,
    state: Mutex<ReceiveState>,
    chunk_size: usize,
    show_progress: bool,
}

impl FileTransferer {
    pub fn new(fs: HostFs, show_progress: bool) -> Self {
        Self::with_chunk_size(fs, CHUNK_SIZE, show_progress)
    }

    pub fn with_chunk_size(fs: HostFs, chunk_size: usize, show_progress: bool) -> Self {
        Self {
            streamer: FileStreamer::new(fs.clone()),
            fs,
            state: Mutex::new(ReceiveState::default()),
            chunk_size,
            show_progress,
        }
    }

    /// Send every known file: a header, then its chunks.
    pub async fn send_files<S>(&self, stream: &mut S) -> Result<()>
    where
        S: SendStream<FileTransferMessage> + ?Sized,
    {
        let files = {
            let state = self.lock();
            if !state.finished || state.started {
                return Err(TransferError::NotReady.into());
            }
            state.files.clone()
        };
        for file in &files {
            info!(source = %file.source_path, target = %file.target_path, "Sending file");
            stream
                .send(FileTransferMessage::Header {
                    target_path: file.target_path.clone(),
                    mode: file.mode,
                    override_service_unit: file.override_service_unit.clone(),
                })
                .await?;
            let mut chunks = ChunkSender { inner: &mut *stream };
            self.streamer
                .read_stream(
                    Path::new(&file.source_path),
                    &mut chunks,
                    self.chunk_size,
                    self.show_progress,
                )
                .await
                .with_context(|| format!("Failed to send {}", file.source_path))?;
        }
        Ok(())
    }

    /// Receive files until the stream ends, writing each to its target path.
    pub async fn recv_files<S>(&self, stream: &mut S) -> Result<()>
    where
        S: RecvStream<FileTransferMessage> + ?Sized,
    {
        let mut receive = ReceiveGuard::begin(&self.state)?;

        loop {
            let (target_path, mode, override_service_unit) = match stream.recv().await? {
                None => break,
                Some(FileTransferMessage::Header {
                    target_path,
                    mode,
                    override_service_unit,
                }) => (target_path, mode, override_service_unit),
                Some(FileTransferMessage::Chunk(_)) => {
                    return Err(TransferError::ExpectedHeader.into());
                }
            };
            info!(target = %target_path, mode = %format!("{:o}", mode), "Receiving file");

            let mut chunks = ChunkReceiver {
                inner: &mut *stream,
                target_path: &target_path,
            };
            self.streamer
                .write_stream(Path::new(&target_path), &mut chunks, self.show_progress)
                .await?;
            self.fs.set_mode(&target_path, mode).await?;

            receive.files.push(FileStat {
                source_path: target_path.clone(),
                target_path,
                mode,
                override_service_unit,
            });
        }

        receive.commit();
        Ok(())
    }

    /// Replace the known files and mark them as ready to send.
    pub async fn set_files(&self, files: Vec<FileStat>) {
        let mut state = self.lock();
        state.files = files;
        state.started = false;
        state.finished = true;
        state.local = true;
    }

    pub async fn get_files(&self) -> Vec<FileStat> {
        self.lock().files.clone()
    }

    /// True once files are held and no receive is in progress.
    pub async fn can_send(&self) -> bool {
        let state = self.lock();
        state.finished && !state.started
    }

    /// True when the held files were set locally instead of received.
    pub async fn is_local(&self) -> bool {
        self.lock().local
    }

    fn lock(&self) -> MutexGuard<'_, ReceiveState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<ReceiveState>) -> MutexGuard<'_, ReceiveState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks a receive as running and collects its files.
///
/// Dropped without [`commit`](Self::commit), it rolls the state back to idle.
struct ReceiveGuard<'a> {
    state: &'a Mutex<ReceiveState>,
    files: Vec<FileStat>,
    committed: bool,
}

impl<'a> ReceiveGuard<'a> {
    fn begin(state: &'a Mutex<ReceiveState>) -> Result<Self, TransferError> {
        {
            let mut current = lock_state(state);
            if current.finished {
                return Err(TransferError::AlreadyFinished);
            }
            if current.started {
                return Err(TransferError::AlreadyRunning);
            }
            current.started = true;
            current.files.clear();
        }
        Ok(Self {
            state,
            files: Vec::new(),
            committed: false,
        })
    }

    fn commit(mut self) {
        let mut current = lock_state(self.state);
        current.files = std::mem::take(&mut self.files);
        current.started = false;
        current.finished = true;
        current.local = false;
        drop(current);
        self.committed = true;
    }
}

impl Drop for ReceiveGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            warn!(
                received = self.files.len(),
                "File receive aborted, discarding partial state"
            );
            let mut current = lock_state(self.state);
            current.started = false;
            current.files.clear();
        }
    }
}

/// Presents the chunk messages of one file as a chunk stream.
struct ChunkReceiver<'a, S: ?Sized> {
    inner: &'a mut S,
    target_path: &'a str,
}

#[async_trait]
impl<S> RecvStream<Chunk> for ChunkReceiver<'_, S>
where
    S: RecvStream<FileTransferMessage> + ?Sized,
{
    async fn recv(&mut self) -> Result<Option<Chunk>> {
        match self.inner.recv().await? {
            Some(FileTransferMessage::Chunk(chunk)) => Ok(Some(chunk)),
            Some(FileTransferMessage::Header { .. }) => {
                Err(TransferError::UnexpectedHeader(self.target_path.to_string()).into())
            }
            None => Ok(None),
        }
    }
}

struct ChunkSender<'a, S: ?Sized> {
    inner: &'a mut S,
}

#[async_trait]
impl<S> SendStream<Chunk> for ChunkSender<'_, S>
where
    S: SendStream<FileTransferMessage> + ?Sized,
{
    async fn send(&mut self, chunk: Chunk) -> Result<()> {
        self.inner.send(FileTransferMessage::Chunk(chunk)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn header(target: &str, mode: u32, unit: Option<&str>) -> FileTransferMessage {
        FileTransferMessage::Header {
            target_path: target.to_string(),
            mode,
            override_service_unit: unit.map(str::to_string),
        }
    }

    fn chunk(data: &[u8], last: bool) -> FileTransferMessage {
        FileTransferMessage::Chunk(Chunk {
            content: data.to_vec(),
            last,
        })
    }

    async fn feed(messages: Vec<FileTransferMessage>) -> mpsc::Receiver<FileTransferMessage> {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for msg in messages {
            tx.send(msg).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_receive_then_send_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        let transferer = FileTransferer::with_chunk_size(fs.clone(), 3, false);
        assert!(!transferer.can_send().await);

        let mut rx = feed(vec![
            header("/opt/bootstrapper", 0o755, Some("bootstrapper")),
            chunk(b"abc", false),
            chunk(b"de", true),
            header("/etc/extra.conf", 0o644, None),
            chunk(b"", true),
        ])
        .await;
        transferer.recv_files(&mut rx).await.unwrap();

        assert!(transferer.can_send().await);
        assert_eq!(fs.read("/opt/bootstrapper").await.unwrap(), b"abcde");
        #[cfg(unix)]
        assert_eq!(fs.mode("/opt/bootstrapper").await.unwrap(), 0o755);

        let files = transferer.get_files().await;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].source_path, "/opt/bootstrapper");
        assert_eq!(files[0].override_service_unit.as_deref(), Some("bootstrapper"));

        let mut out: Vec<FileTransferMessage> = Vec::new();
        transferer.send_files(&mut out).await.unwrap();
        assert_eq!(
            out,
            vec![
                header("/opt/bootstrapper", 0o755, Some("bootstrapper")),
                chunk(b"abc", false),
                chunk(b"de", true),
                header("/etc/extra.conf", 0o644, None),
                chunk(b"", true),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_receive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transferer = FileTransferer::new(HostFs::rooted(dir.path()), false);
        let mut rx = feed(vec![header("/a", 0o644, None), chunk(b"x", true)]).await;
        transferer.recv_files(&mut rx).await.unwrap();

        let mut rx = feed(vec![]).await;
        let err = transferer.recv_files(&mut rx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::AlreadyFinished)
        ));
    }

    #[tokio::test]
    async fn test_chunk_before_header_fails_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let transferer = FileTransferer::new(HostFs::rooted(dir.path()), false);
        let mut rx = feed(vec![chunk(b"x", true)]).await;
        let err = transferer.recv_files(&mut rx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::ExpectedHeader)
        ));
        assert!(!transferer.can_send().await);
        assert!(transferer.get_files().await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_mid_file_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let transferer = FileTransferer::new(HostFs::rooted(dir.path()), false);

        // First file completes, second is cut off.
        let mut rx = feed(vec![
            header("/a", 0o644, None),
            chunk(b"a", true),
            header("/b", 0o644, None),
            chunk(b"b", false),
        ])
        .await;
        assert!(transferer.recv_files(&mut rx).await.is_err());
        assert!(!transferer.can_send().await);
        assert!(transferer.get_files().await.is_empty());

        // A retry from idle succeeds.
        let mut rx = feed(vec![header("/a", 0o644, None), chunk(b"a", true)]).await;
        transferer.recv_files(&mut rx).await.unwrap();
        assert!(transferer.can_send().await);
    }

    #[tokio::test]
    async fn test_cancelled_receive_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let transferer = FileTransferer::new(HostFs::rooted(dir.path()), false);
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(header("/a", 0o644, None)).await.unwrap();
        tx.send(chunk(b"a", true)).await.unwrap();

        // The receive blocks waiting for more messages and is dropped.
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            transferer.recv_files(&mut rx),
        )
        .await;
        assert!(result.is_err());
        assert!(!transferer.can_send().await);
        assert!(transferer.get_files().await.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_in_flight_receive_blocks_send_and_second_receive() {
        let dir = tempfile::tempdir().unwrap();
        let transferer = std::sync::Arc::new(FileTransferer::new(HostFs::rooted(dir.path()), false));
        let (tx, mut rx) = mpsc::channel(1);
        let receiving = transferer.clone();
        let task = tokio::spawn(async move { receiving.recv_files(&mut rx).await });

        // The second send only completes once the receive has taken the header.
        tx.send(header("/a", 0o644, None)).await.unwrap();
        tx.send(chunk(b"a", false)).await.unwrap();

        assert!(!transferer.can_send().await);
        let mut out: Vec<FileTransferMessage> = Vec::new();
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            transferer.send_files(&mut out),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::NotReady)
        ));
        assert!(out.is_empty());

        let mut other = feed(vec![]).await;
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            transferer.recv_files(&mut other),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::AlreadyRunning)
        ));

        tx.send(chunk(b"b", true)).await.unwrap();
        drop(tx);
        task.await.unwrap().unwrap();
        assert!(transferer.can_send().await);
        assert!(!transferer.is_local().await);
    }

    #[tokio::test]
    async fn test_send_requires_finished_receive() {
        let dir = tempfile::tempdir().unwrap();
        let transferer = FileTransferer::new(HostFs::rooted(dir.path()), false);
        let mut out: Vec<FileTransferMessage> = Vec::new();
        let err = transferer.send_files(&mut out).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_set_files_enables_sending() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        fs.write("/local/bootstrapper", b"bin", 0o755).await.unwrap();
        let transferer = FileTransferer::new(fs, false);

        transferer
            .set_files(vec![FileStat {
                source_path: "/local/bootstrapper".to_string(),
                target_path: "/opt/bootstrapper".to_string(),
                mode: 0o755,
                override_service_unit: Some("bootstrapper".to_string()),
            }])
            .await;
        assert!(transferer.can_send().await);
        assert!(transferer.is_local().await);

        let mut out: Vec<FileTransferMessage> = Vec::new();
        transferer.send_files(&mut out).await.unwrap();
        assert_eq!(out[0], header("/opt/bootstrapper", 0o755, Some("bootstrapper")));
        assert_eq!(out[1], chunk(b"bin", true));
    }
}
