use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::debug;

use constel_core::fs::HostFs;
use constel_core::protocol::debugd::Chunk;
use constel_core::protocol::{RecvStream, SendStream};

#[derive(Debug, thiserror::Error)]
pub enum StreamerError {
    #[error("a write to the file is in progress")]
    WriteInProgress,
    #[error("chunk size must be positive")]
    InvalidChunkSize,
    #[error("stream ended before the last chunk")]
    UnexpectedEnd,
}

/// Moves whole files between the local filesystem and chunk streams.
///
/// Writers are exclusive; a read attempted while a write is running fails
/// instead of waiting, so a half-written file is never served.
pub struct FileStreamer {
    fs: HostFs,
    lock: RwLock<()>,
}

impl FileStreamer {
    pub fn new(fs: HostFs) -> Self {
        Self {
            fs,
            lock: RwLock::new(()),
        }
    }

    /// Receive chunks into `path` until a chunk marked `last`.
    pub async fn write_stream<S>(&self, path: &Path, stream: &mut S, show_progress: bool) -> Result<()>
    where
        S: RecvStream<Chunk> + ?Sized,
    {
        let _guard = self.lock.write().await;
        let mut file = self.fs.create(path).await?;
        let mut written: u64 = 0;
        loop {
            let chunk = stream
                .recv()
                .await
                .with_context(|| format!("Failed to receive chunk for {}", path.display()))?
                .ok_or(StreamerError::UnexpectedEnd)?;
            file.write_all(&chunk.content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written += chunk.content.len() as u64;
            if show_progress {
                debug!(path = %path.display(), bytes = written, "Receiving file");
            }
            if chunk.last {
                break;
            }
        }
        file.flush()
            .await
            .with_context(|| format!("Failed to flush {}", path.display()))?;
        debug!(path = %path.display(), bytes = written, "File received");
        Ok(())
    }

    /// Send `path` as chunks of at most `chunk_size` bytes.
    ///
    /// The final chunk carries `last`, even if it is empty.
    pub async fn read_stream<S>(
        &self,
        path: &Path,
        stream: &mut S,
        chunk_size: usize,
        show_progress: bool,
    ) -> Result<()>
    where
        S: SendStream<Chunk> + ?Sized,
    {
        if chunk_size == 0 {
            return Err(StreamerError::InvalidChunkSize.into());
        }
        let _guard = self
            .lock
            .try_read()
            .map_err(|_| StreamerError::WriteInProgress)?;

        let mut file = self.fs.open(path).await?;
        let total = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let mut buf = vec![0u8; chunk_size];
        let mut sent: u64 = 0;
        let mut next_report: u64 = 10;

        loop {
            let n = read_full(&mut file, &mut buf)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            sent += n as u64;
            let last = n < chunk_size || sent >= total;
            stream
                .send(Chunk {
                    content: buf[..n].to_vec(),
                    last,
                })
                .await?;

            if show_progress && total > 0 {
                let percent = sent * 100 / total;
                if percent >= next_report {
                    debug!(path = %path.display(), sent, total, percent, "Sending file");
                    next_report = percent / 10 * 10 + 10;
                }
            }
            if last {
                return Ok(());
            }
        }
    }
}

/// Fill `buf` unless EOF comes first; returns the bytes read.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (tempfile::TempDir, HostFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::rooted(dir.path());
        (dir, fs)
    }

    #[tokio::test]
    async fn test_read_stream_splits_into_chunks() {
        let (_dir, fs) = setup();
        fs.write("/data/file", b"abcdefghij", 0o644).await.unwrap();
        let streamer = FileStreamer::new(fs);

        let mut out: Vec<Chunk> = Vec::new();
        streamer
            .read_stream(Path::new("/data/file"), &mut out, 4, false)
            .await
            .unwrap();
        let contents: Vec<&[u8]> = out.iter().map(|c| c.content.as_slice()).collect();
        assert_eq!(contents, vec![&b"abcd"[..], b"efgh", b"ij"]);
        assert_eq!(
            out.iter().map(|c| c.last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
    }

    #[tokio::test]
    async fn test_read_stream_exact_multiple_has_no_empty_tail() {
        let (_dir, fs) = setup();
        fs.write("/f", b"abcdefgh", 0o644).await.unwrap();
        let streamer = FileStreamer::new(fs);

        let mut out: Vec<Chunk> = Vec::new();
        streamer
            .read_stream(Path::new("/f"), &mut out, 4, true)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[1].last);
        assert_eq!(out[1].content, b"efgh");
    }

    #[tokio::test]
    async fn test_read_stream_empty_file_sends_one_last_chunk() {
        let (_dir, fs) = setup();
        fs.write("/empty", b"", 0o644).await.unwrap();
        let streamer = FileStreamer::new(fs);

        let mut out: Vec<Chunk> = Vec::new();
        streamer
            .read_stream(Path::new("/empty"), &mut out, 1024, false)
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![Chunk {
                content: vec![],
                last: true
            }]
        );
    }

    #[tokio::test]
    async fn test_read_stream_rejects_zero_chunk_size() {
        let (_dir, fs) = setup();
        fs.write("/f", b"x", 0o644).await.unwrap();
        let streamer = FileStreamer::new(fs);
        let mut out: Vec<Chunk> = Vec::new();
        let err = streamer
            .read_stream(Path::new("/f"), &mut out, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamerError>(),
            Some(StreamerError::InvalidChunkSize)
        ));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_write_stream_assembles_file() {
        let (_dir, fs) = setup();
        let streamer = FileStreamer::new(fs.clone());
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Chunk {
            content: b"hello ".to_vec(),
            last: false,
        })
        .await
        .unwrap();
        tx.send(Chunk {
            content: b"world".to_vec(),
            last: true,
        })
        .await
        .unwrap();

        streamer
            .write_stream(Path::new("/out/file"), &mut rx, true)
            .await
            .unwrap();
        assert_eq!(fs.read("/out/file").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_write_stream_fails_without_last_chunk() {
        let (_dir, fs) = setup();
        let streamer = FileStreamer::new(fs);
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Chunk {
            content: b"partial".to_vec(),
            last: false,
        })
        .await
        .unwrap();
        drop(tx);

        let err = streamer
            .write_stream(Path::new("/out"), &mut rx, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamerError>(),
            Some(StreamerError::UnexpectedEnd)
        ));
    }

    #[tokio::test]
    async fn test_read_during_write_fails_immediately() {
        let (_dir, fs) = setup();
        fs.write("/f", b"old", 0o644).await.unwrap();
        let streamer = Arc::new(FileStreamer::new(fs));
        let (tx, mut rx) = mpsc::channel::<Chunk>(1);

        let writer = {
            let streamer = streamer.clone();
            tokio::spawn(async move {
                streamer
                    .write_stream(&PathBuf::from("/f"), &mut rx, false)
                    .await
            })
        };
        // Let the writer take the lock and block on the empty channel.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut out: Vec<Chunk> = Vec::new();
        let err = streamer
            .read_stream(Path::new("/f"), &mut out, 16, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamerError>(),
            Some(StreamerError::WriteInProgress)
        ));

        tx.send(Chunk {
            content: b"new".to_vec(),
            last: true,
        })
        .await
        .unwrap();
        writer.await.unwrap().unwrap();

        streamer
            .read_stream(Path::new("/f"), &mut out, 16, false)
            .await
            .unwrap();
        assert_eq!(out[0].content, b"new");
    }
}
