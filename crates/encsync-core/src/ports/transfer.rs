//! Cooperative transfer controllers
//!
//! Every upload and download is driven by a [`TransferController`]. The
//! controller copies data from a reader into a [`ChunkSink`] one chunk at a
//! time and, at every chunk boundary:
//!
//! - checks its stop token and fails with [`StorageError::Interrupted`]
//! - publishes the transferred byte count on a watch channel
//! - lets its [`SpeedLimiter`] delay the next chunk
//!
//! ```text
//!  reader ──chunk──▶ controller ──chunk──▶ sink
//!                        │
//!                        ├── stop token (child of the task token)
//!                        ├── watch::Sender<u64> (progress)
//!                        └── SpeedLimiter (bytes/s)
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::storage::{BoxedReader, StorageError};

/// Longest uninterrupted sleep of a limiter, so stops are noticed quickly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(250);

// ============================================================================
// ChunkSink
// ============================================================================

/// Destination of a transfer
#[async_trait]
pub trait ChunkSink: Send {
    /// Appends one chunk.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError>;

    /// Called once after the last chunk; the data becomes visible here.
    async fn finish(&mut self) -> Result<(), StorageError>;

    /// Called instead of `finish` when the transfer fails or is stopped.
    async fn abort(&mut self) {}
}

// ============================================================================
// SpeedLimiter
// ============================================================================

/// Byte-rate limiter
///
/// Accumulates transferred quantities and, when they run ahead of
/// `limit` bytes per second, sleeps the difference. The accounting window
/// restarts every `interval`.
#[derive(Debug, Clone)]
pub struct SpeedLimiter {
    limit: Option<u64>,
    interval: Duration,
    quantity: u64,
    window_start: Instant,
}

impl SpeedLimiter {
    pub fn new(limit: Option<u64>) -> Self {
        Self::with_interval(limit, Duration::from_secs(1))
    }

    pub fn with_interval(limit: Option<u64>, interval: Duration) -> Self {
        Self {
            limit: limit.filter(|l| *l > 0),
            interval,
            quantity: 0,
            window_start: Instant::now(),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Changes the limit; `None` or `0` disables limiting.
    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit.filter(|l| *l > 0);
        self.reset();
    }

    fn reset(&mut self) {
        self.quantity = 0;
        self.window_start = Instant::now();
    }

    /// How long to wait after `quantity` more bytes, without sleeping.
    pub fn pending_delay(&mut self, quantity: u64) -> Duration {
        let Some(limit) = self.limit else {
            return Duration::ZERO;
        };
        self.quantity += quantity;
        let required = Duration::from_secs_f64(self.quantity as f64 / limit as f64);
        required.saturating_sub(self.window_start.elapsed())
    }

    /// Accounts for `quantity` bytes and sleeps as needed, in slices of at
    /// most 250 ms. Fails with `Interrupted` as soon as `stop` fires.
    pub async fn delay(
        &mut self,
        quantity: u64,
        stop: &CancellationToken,
    ) -> Result<(), StorageError> {
        let mut remaining = self.pending_delay(quantity);
        while !remaining.is_zero() {
            if stop.is_cancelled() {
                return Err(StorageError::Interrupted);
            }
            let slice = remaining.min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = stop.cancelled() => return Err(StorageError::Interrupted),
                _ = tokio::time::sleep(slice) => {}
            }
            remaining = remaining.saturating_sub(slice);
        }
        if self.window_start.elapsed() >= self.interval {
            self.reset();
        }
        Ok(())
    }
}

// ============================================================================
// TransferController
// ============================================================================

/// A cancellable, rate-limited handle to one transfer
///
/// Nothing moves until [`work`](Self::work) is awaited.
pub struct TransferController {
    reader: BoxedReader,
    sink: Box<dyn ChunkSink>,
    size: Option<u64>,
    chunk_size: usize,
    limiter: SpeedLimiter,
    stopper: CancellationToken,
    progress_tx: watch::Sender<u64>,
    transferred: u64,
    chunk_timeout: Option<Duration>,
}

impl std::fmt::Debug for TransferController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferController")
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("limit", &self.limiter.limit())
            .field("transferred", &self.transferred)
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}

/// Controller of an upload
pub type UploadController = TransferController;

/// Controller of a download
pub type DownloadController = TransferController;

impl TransferController {
    pub fn new(reader: BoxedReader, sink: Box<dyn ChunkSink>, chunk_size: usize) -> Self {
        let (progress_tx, _) = watch::channel(0u64);
        Self {
            reader,
            sink,
            size: None,
            chunk_size: chunk_size.max(1),
            limiter: SpeedLimiter::new(None),
            stopper: CancellationToken::new(),
            progress_tx,
            transferred: 0,
            chunk_timeout: None,
        }
    }

    /// Declares the expected number of bytes; `work` fails on a mismatch.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn limit(&self) -> Option<u64> {
        self.limiter.limit()
    }

    /// Sets the speed limit in bytes per second.
    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limiter.set_limit(limit);
    }

    /// Bounds every chunk read and write; exceeding it is a temporary error.
    pub fn set_chunk_timeout(&mut self, timeout: Option<Duration>) {
        self.chunk_timeout = timeout;
    }

    /// Makes the controller stop whenever `parent` is cancelled.
    pub fn link(&mut self, parent: &CancellationToken) {
        self.stopper = parent.child_token();
    }

    /// Token that stops this transfer when cancelled.
    pub fn stopper(&self) -> CancellationToken {
        self.stopper.clone()
    }

    /// Requests a stop. Idempotent and non-blocking.
    pub fn stop(&self) {
        self.stopper.cancel();
    }

    pub fn stopped(&self) -> bool {
        self.stopper.is_cancelled()
    }

    /// Receiver of the transferred byte count.
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress_tx.subscribe()
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Runs the transfer to completion. Returns the number of bytes moved.
    pub async fn work(mut self) -> Result<u64, StorageError> {
        match self.run().await {
            Ok(()) => Ok(self.transferred),
            Err(e) => {
                self.sink.abort().await;
                debug!(transferred = self.transferred, error = %e, "Transfer aborted");
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<(), StorageError> {
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if self.stopper.is_cancelled() {
                return Err(StorageError::Interrupted);
            }

            let n = with_timeout(self.chunk_timeout, read_chunk(&mut self.reader, &mut buf)).await?;
            if n == 0 {
                break;
            }

            with_timeout(self.chunk_timeout, self.sink.write_chunk(&buf[..n])).await?;
            self.transferred += n as u64;
            self.progress_tx.send_replace(self.transferred);

            self.limiter.delay(n as u64, &self.stopper).await?;
        }

        if let Some(expected) = self.size {
            if expected != self.transferred {
                return Err(StorageError::Temporary(format!(
                    "transfer size mismatch: expected {expected} bytes, moved {}",
                    self.transferred
                )));
            }
        }
        self.sink.finish().await
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, StorageError>
where
    F: std::future::Future<Output = Result<T, StorageError>>,
{
    match timeout {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StorageError::Temporary(format!("chunk timed out after {limit:?}")))?,
    }
}

/// Fills `buf` as far as the reader allows. Returns 0 at end of input.
async fn read_chunk(reader: &mut BoxedReader, buf: &mut [u8]) -> Result<usize, StorageError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default, Clone)]
    struct CollectSink {
        data: Arc<Mutex<Vec<u8>>>,
        chunks: Arc<Mutex<usize>>,
        finished: Arc<Mutex<bool>>,
        aborted: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl ChunkSink for CollectSink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
            self.data.lock().unwrap().extend_from_slice(chunk);
            *self.chunks.lock().unwrap() += 1;
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), StorageError> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }

        async fn abort(&mut self) {
            *self.aborted.lock().unwrap() = true;
        }
    }

    fn reader(data: Vec<u8>) -> BoxedReader {
        Box::new(std::io::Cursor::new(data))
    }

    #[test]
    fn debug_shows_progress_not_payload() {
        let ctl = TransferController::new(reader(vec![7u8; 10]), Box::new(CollectSink::default()), 4)
            .with_size(10);
        let text = format!("{ctl:?}");
        assert!(text.contains("size: Some(10)"));
        assert!(text.contains("transferred: 0"));
        assert!(!text.contains("reader"));
    }

    #[tokio::test]
    async fn copies_all_chunks() {
        let sink = CollectSink::default();
        let data: Vec<u8> = (0..100u8).collect();
        let ctl = TransferController::new(reader(data.clone()), Box::new(sink.clone()), 30)
            .with_size(100);
        let progress = ctl.progress();

        assert_eq!(ctl.work().await.unwrap(), 100);
        assert_eq!(*sink.data.lock().unwrap(), data);
        assert_eq!(*sink.chunks.lock().unwrap(), 4);
        assert!(*sink.finished.lock().unwrap());
        assert_eq!(*progress.borrow(), 100);
    }

    #[tokio::test]
    async fn stop_interrupts_at_chunk_boundary() {
        let sink = CollectSink::default();
        let ctl = TransferController::new(reader(vec![0; 64]), Box::new(sink.clone()), 16);
        ctl.stop();
        ctl.stop();
        assert!(ctl.stopped());

        assert!(matches!(ctl.work().await, Err(StorageError::Interrupted)));
        assert!(sink.data.lock().unwrap().is_empty());
        assert!(*sink.aborted.lock().unwrap());
        assert!(!*sink.finished.lock().unwrap());
    }

    #[tokio::test]
    async fn parent_token_stops_linked_controller() {
        let parent = CancellationToken::new();
        let mut ctl =
            TransferController::new(reader(vec![0; 64]), Box::new(CollectSink::default()), 16);
        ctl.link(&parent);
        parent.cancel();
        assert!(ctl.stopped());
        assert!(ctl.work().await.unwrap_err().is_interrupted());
    }

    #[tokio::test]
    async fn size_mismatch_fails_and_aborts() {
        let sink = CollectSink::default();
        let ctl = TransferController::new(reader(vec![1; 10]), Box::new(sink.clone()), 4)
            .with_size(11);
        assert!(ctl.work().await.is_err());
        assert!(*sink.aborted.lock().unwrap());
    }

    #[tokio::test]
    async fn limiter_sleeps_to_respect_rate() {
        let mut limiter = SpeedLimiter::new(Some(10_000));
        let token = CancellationToken::new();
        let started = Instant::now();
        limiter.delay(1_000, &token).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn limiter_sleep_observes_stop() {
        let mut limiter = SpeedLimiter::new(Some(1));
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            limiter.delay(1_000, &token).await,
            Err(StorageError::Interrupted)
        ));
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let mut limiter = SpeedLimiter::new(Some(0));
        assert_eq!(limiter.limit(), None);
        assert_eq!(limiter.pending_delay(1 << 30), Duration::ZERO);
    }
}
