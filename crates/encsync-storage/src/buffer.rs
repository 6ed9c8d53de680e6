//! Transfer buffers
//!
//! Downloads land in a [`SpillBuffer`]: memory up to a threshold (80 MiB by
//! default), an anonymous temporary file beyond it. The cipher sinks wrap a
//! buffer sink to encrypt or decrypt file contents on the fly.

use std::io::{self, SeekFrom};

use async_trait::async_trait;
use encsync_core::crypto::content::{ContentDecryptor, ContentEncryptor};
use encsync_core::crypto::Key;
use encsync_core::ports::{BoxedReader, ChunkSink, StorageError};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

/// Size above which a buffer moves to a temporary file.
pub const SPILL_THRESHOLD: usize = 80 * 1024 * 1024;

enum Backing {
    Memory(Vec<u8>),
    File(tokio::fs::File),
}

/// Byte buffer that spills to disk when it grows large
pub struct SpillBuffer {
    backing: Backing,
    len: u64,
    threshold: usize,
}

impl std::fmt::Debug for SpillBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillBuffer")
            .field("len", &self.len)
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

impl Default for SpillBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpillBuffer {
    pub fn new() -> Self {
        Self::with_threshold(SPILL_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            len: 0,
            threshold,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Backing::Memory(bytes) = &mut self.backing {
            if bytes.len() + data.len() <= self.threshold {
                bytes.extend_from_slice(data);
                self.len += data.len() as u64;
                return Ok(());
            }
            let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
            file.write_all(bytes).await?;
            debug!(bytes = bytes.len(), "Buffer spilled to temporary file");
            self.backing = Backing::File(file);
        }
        if let Backing::File(file) = &mut self.backing {
            file.write_all(data).await?;
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// Reader over the buffered bytes, from the start.
    pub async fn into_reader(self) -> io::Result<BoxedReader> {
        match self.backing {
            Backing::Memory(bytes) => Ok(Box::new(io::Cursor::new(bytes))),
            Backing::File(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(Box::new(file))
            }
        }
    }

    pub async fn to_vec(self) -> io::Result<Vec<u8>> {
        let mut reader = self.into_reader().await?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Turns the buffer into a sink; the receiver yields it back once the
    /// transfer has finished.
    pub fn into_sink(self) -> (BufferSink, oneshot::Receiver<SpillBuffer>) {
        let (tx, rx) = oneshot::channel();
        (
            BufferSink {
                buffer: Some(self),
                done: Some(tx),
            },
            rx,
        )
    }
}

/// Sink filling a [`SpillBuffer`]
pub struct BufferSink {
    buffer: Option<SpillBuffer>,
    done: Option<oneshot::Sender<SpillBuffer>>,
}

#[async_trait]
impl ChunkSink for BufferSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        match self.buffer.as_mut() {
            Some(buffer) => Ok(buffer.write(chunk).await?),
            None => Err(StorageError::Permanent("write after finish".to_string())),
        }
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        if let (Some(buffer), Some(done)) = (self.buffer.take(), self.done.take()) {
            let _ = done.send(buffer);
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.buffer = None;
        self.done = None;
    }
}

// ============================================================================
// Cipher sinks
// ============================================================================

/// Decrypts file contents before handing them to `inner`
pub struct DecryptingSink<S> {
    inner: S,
    decryptor: Option<ContentDecryptor>,
}

impl<S: ChunkSink> DecryptingSink<S> {
    pub fn new(inner: S, key: &Key) -> Self {
        Self {
            inner,
            decryptor: Some(ContentDecryptor::new(key)),
        }
    }
}

#[async_trait]
impl<S: ChunkSink> ChunkSink for DecryptingSink<S> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let decryptor = self
            .decryptor
            .as_mut()
            .ok_or_else(|| StorageError::Permanent("write after finish".to_string()))?;
        let plain = decryptor.update(chunk)?;
        if !plain.is_empty() {
            self.inner.write_chunk(&plain).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        if let Some(decryptor) = self.decryptor.take() {
            decryptor.finish()?;
        }
        self.inner.finish().await
    }

    async fn abort(&mut self) {
        self.decryptor = None;
        self.inner.abort().await;
    }
}

/// Encrypts file contents before handing them to `inner`
pub struct EncryptingSink<S> {
    inner: S,
    encryptor: Option<ContentEncryptor>,
}

impl<S: ChunkSink> EncryptingSink<S> {
    /// `size` is the plaintext size, written into the header.
    pub fn new(inner: S, key: &Key, size: u64) -> Result<Self, StorageError> {
        Ok(Self {
            inner,
            encryptor: Some(ContentEncryptor::new(key, size)?),
        })
    }
}

#[async_trait]
impl<S: ChunkSink> ChunkSink for EncryptingSink<S> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let encryptor = self
            .encryptor
            .as_mut()
            .ok_or_else(|| StorageError::Permanent("write after finish".to_string()))?;
        let cipher = encryptor.update(chunk)?;
        if !cipher.is_empty() {
            self.inner.write_chunk(&cipher).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        if let Some(encryptor) = self.encryptor.take() {
            let tail = encryptor.finish()?;
            if !tail.is_empty() {
                self.inner.write_chunk(&tail).await?;
            }
        }
        self.inner.finish().await
    }

    async fn abort(&mut self) {
        self.encryptor = None;
        self.inner.abort().await;
    }
}
