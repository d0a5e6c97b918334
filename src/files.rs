//! File Stream Source - chunked reads confined to a download root
//!
//! Identifiers are paths relative to the root. Anything that would leave the
//! root (absolute paths, `..`, symlinks pointing outside) is reported as
//! `NotFound`, the same as a file that does not exist, so callers cannot probe
//! the filesystem layout.

use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::metrics::DOWNLOAD_BYTES;

/// One piece of a file, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk>> + Send>>;

#[derive(Debug, Clone)]
pub struct FileStreamSource {
    /// Canonical root; `None` disables downloads
    root: Option<PathBuf>,
    chunk_size: usize,
}

impl FileStreamSource {
    pub fn new(root: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self { root: Some(root), chunk_size: chunk_size.max(1) })
    }

    /// A source that serves nothing.
    pub fn disabled() -> Self {
        Self { root: None, chunk_size: 1 }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Map an identifier to a regular file inside the root.
    pub async fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        let not_found = || Error::file_not_found(identifier);
        let root = self.root.as_ref().ok_or_else(not_found)?;

        let relative = Path::new(identifier);
        let plain = !identifier.is_empty()
            && relative.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !plain {
            return Err(not_found());
        }

        let path = tokio::fs::canonicalize(root.join(relative)).await.map_err(|_| not_found())?;
        if !path.starts_with(root) {
            tracing::warn!(identifier, "download path escapes the root");
            return Err(not_found());
        }
        let meta = tokio::fs::metadata(&path).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }
        Ok(path)
    }

    /// Open `identifier` as a stream of fixed-size chunks.
    ///
    /// Every chunk but the last is exactly `chunk_size` bytes. A read error
    /// part way through is yielded as the final item.
    pub async fn open(&self, identifier: &str) -> Result<ChunkStream> {
        let path = self.resolve(identifier).await?;
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::file_not_found(identifier),
            _ => Error::Io(e),
        })?;
        let chunk_size = self.chunk_size;
        tracing::debug!(path = %path.display(), chunk_size, "streaming file");

        let chunks = stream! {
            let mut offset = 0u64;
            loop {
                let mut buf = BytesMut::with_capacity(chunk_size);
                while buf.len() < chunk_size {
                    match file.read_buf(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            yield Err(Error::Io(e));
                            return;
                        }
                    }
                }
                if buf.is_empty() {
                    break;
                }

                let len = buf.len();
                DOWNLOAD_BYTES.inc_by(len as f64);
                yield Ok(Chunk { offset, data: buf.freeze() });
                offset += len as u64;
                if len < chunk_size {
                    break;
                }
            }
        };
        Ok(Box::pin(chunks))
    }
}
