//! Retry policy for remote storages
//!
//! [`RetryingStorage`] wraps any backend and gives every metadata call a
//! deadline and a bounded retry loop. Only [`StorageError::is_transient`]
//! failures are retried; not-found, authentication and other permanent
//! errors are returned on the first attempt.
//!
//! Transfers are not retried here because their reader or sink is consumed
//! by the first attempt. The wrapper instead sets the controller's per-chunk
//! deadline, and callers retry a whole transfer with
//! [`RetryPolicy::upload_backoff`] between attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encsync_core::config::{Config, Timeout, Timeouts};
use encsync_core::domain::StorageKind;
use encsync_core::ports::{BoxedReader, ChunkSink, Meta, Storage, StorageError, TransferController};
use tracing::{info, warn};

/// Pause between two attempts of a metadata call.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause between two attempts of a whole upload.
const DEFAULT_UPLOAD_BACKOFF: Duration = Duration::from_secs(3);

/// How remote calls are retried and timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call; 0 behaves like 1
    pub n_retries: u32,
    pub backoff: Duration,
    pub upload_backoff: Duration,
    pub timeouts: Timeouts,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            n_retries: config.n_retries,
            backoff: DEFAULT_BACKOFF,
            upload_backoff: DEFAULT_UPLOAD_BACKOFF,
            timeouts: config.timeouts(),
        }
    }

    /// Same policy with both pauses set to `backoff`.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self.upload_backoff = backoff;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.n_retries.max(1)
    }

    fn call_deadline(timeout: Timeout) -> Duration {
        timeout.connect_duration() + timeout.read_duration()
    }

    /// Runs `call` until it succeeds, fails permanently or runs out of
    /// attempts. Each attempt is bounded by `deadline`.
    pub async fn run<T, F, Fut>(
        &self,
        op: &str,
        path: &str,
        deadline: Duration,
        mut call: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        let attempts = self.attempts();
        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(deadline, call()).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Temporary(format!(
                    "{op} {path} timed out after {}s",
                    deadline.as_secs()
                ))),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(op, path, attempt, "Storage call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        op,
                        path,
                        attempt,
                        backoff_ms = self.backoff.as_millis() as u64,
                        error = %e,
                        "Transient storage error, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(op, path, attempts, error = %e, "Retry limit exhausted");
                    return Err(StorageError::Temporary(format!(
                        "{op} {path}: {e} (after {attempts} attempts)"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Temporary(format!("{op} {path}: no attempt made")))
    }
}

/// A storage whose calls follow a [`RetryPolicy`]
pub struct RetryingStorage {
    inner: Arc<dyn Storage>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RetryingStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingStorage")
            .field("storage", &self.inner.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryingStorage {
    pub fn new(inner: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    fn deadline(&self) -> Duration {
        RetryPolicy::call_deadline(self.policy.timeouts.default)
    }
}

#[async_trait]
impl Storage for RetryingStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StorageKind {
        self.inner.kind()
    }

    fn case_sensitive(&self) -> bool {
        self.inner.case_sensitive()
    }

    fn parallelizable(&self) -> bool {
        self.inner.parallelizable()
    }

    fn chunk_size(&self) -> usize {
        self.inner.chunk_size()
    }

    async fn get_meta(&self, path: &str) -> Result<Meta, StorageError> {
        let inner = self.inner.as_ref();
        self.policy
            .run("get_meta", path, self.deadline(), move || inner.get_meta(path))
            .await
    }

    async fn listdir(&self, path: &str) -> Result<Vec<Meta>, StorageError> {
        let inner = self.inner.as_ref();
        self.policy
            .run("listdir", path, self.deadline(), move || inner.listdir(path))
            .await
    }

    async fn mkdir(&self, path: &str) -> Result<(), StorageError> {
        let inner = self.inner.as_ref();
        let mut retried = false;
        self.policy
            .run("mkdir", path, self.deadline(), move || {
                let first = !retried;
                retried = true;
                async move {
                    match inner.mkdir(path).await {
                        // A timed-out attempt may have created the directory.
                        Err(StorageError::AlreadyExists(_)) if !first => Ok(()),
                        other => other,
                    }
                }
            })
            .await
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let inner = self.inner.as_ref();
        let mut retried = false;
        self.policy
            .run("remove", path, self.deadline(), move || {
                let first = !retried;
                retried = true;
                async move {
                    match inner.remove(path).await {
                        Err(StorageError::NotFound(_)) if !first => Ok(()),
                        other => other,
                    }
                }
            })
            .await
    }

    async fn upload(
        &self,
        reader: BoxedReader,
        size: u64,
        path: &str,
    ) -> Result<TransferController, StorageError> {
        let timeout = self.policy.timeouts.for_upload(size);
        let start = self.inner.upload(reader, size, path);
        let mut controller = match tokio::time::timeout(RetryPolicy::call_deadline(timeout), start).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StorageError::Temporary(format!(
                    "upload {path} timed out while starting"
                )))
            }
        };
        controller.set_chunk_timeout(Some(timeout.read_duration()));
        Ok(controller)
    }

    async fn download(
        &self,
        path: &str,
        sink: Box<dyn ChunkSink>,
    ) -> Result<TransferController, StorageError> {
        let timeout = self.policy.timeouts.default;
        let start = self.inner.download(path, sink);
        let mut controller = match tokio::time::timeout(RetryPolicy::call_deadline(timeout), start).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StorageError::Temporary(format!(
                    "download {path} timed out while starting"
                )))
            }
        };
        controller.set_chunk_timeout(Some(timeout.read_duration()));
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use chrono::Utc;

    fn policy(n_retries: u32) -> RetryPolicy {
        RetryPolicy {
            n_retries,
            ..RetryPolicy::default()
        }
        .with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let memory = MemoryStorage::new("mem");
        memory.put_file("/f", b"x".to_vec(), Utc::now()).unwrap();
        let storage = RetryingStorage::new(Arc::new(memory.clone()), policy(3));

        memory.fail_next(2);
        assert!(storage.get_meta("/f").await.unwrap().is_file());
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_temporary() {
        let memory = MemoryStorage::new("mem");
        let storage = RetryingStorage::new(Arc::new(memory.clone()), policy(2));

        memory.fail_next(5);
        let err = storage.listdir("/").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let memory = MemoryStorage::new("mem");
        let storage = RetryingStorage::new(Arc::new(memory.clone()), policy(3));

        let err = storage.listdir("/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_upload_gets_chunk_timeout() {
        let storage = RetryingStorage::new(Arc::new(MemoryStorage::new("mem")), policy(1));
        let reader: BoxedReader = Box::new(std::io::Cursor::new(b"abc".to_vec()));
        let controller = storage.upload(reader, 3, "/f").await.unwrap();
        assert_eq!(controller.work().await.unwrap(), 3);
        assert!(storage.is_file("/f").await.unwrap());
    }
}
