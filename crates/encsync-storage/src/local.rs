//! Local filesystem storage
//!
//! Storage paths are `/` paths resolved below a configured root directory.
//!
//! ## Design Decisions
//!
//! - **Atomic uploads**: data is written to `<name>.tmp` next to the target
//!   and renamed into place when the transfer finishes.
//! - **Unsupported entries**: symlinks, sockets and devices are reported as
//!   missing by `get_meta` and skipped by `listdir`.
//! - **Serial access**: local disks are not parallelizable; the scanner walks
//!   them with a single worker.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encsync_core::domain::{path, StorageKind};
use encsync_core::ports::{BoxedReader, ChunkSink, Meta, Storage, StorageError, TransferController};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Longest file name accepted by local storages, in bytes.
pub const MAX_LOCAL_NAME_LEN: usize = 160;

/// Storage backed by a directory of the local filesystem
#[derive(Debug, Clone)]
pub struct LocalStorage {
    name: String,
    root: PathBuf,
    case_sensitive: bool,
}

impl LocalStorage {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            case_sensitive: !cfg!(any(target_os = "windows", target_os = "macos")),
        }
    }

    #[must_use]
    pub fn with_case_sensitivity(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a storage path.
    pub fn resolve(&self, storage_path: &str) -> PathBuf {
        let relative = path::join_properly("/", storage_path);
        let relative = relative.trim_start_matches(path::SEP);
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path::to_sys(relative))
        }
    }

    fn check_name(storage_path: &str) -> Result<(), StorageError> {
        let name = path::basename(storage_path);
        if name.len() > MAX_LOCAL_NAME_LEN {
            return Err(StorageError::NameTooLong {
                name: name.to_string(),
                len: name.len(),
            });
        }
        Ok(())
    }
}

fn modified_of(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn meta_from(name: String, metadata: &std::fs::Metadata) -> Meta {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        Meta::dir(name, modified_of(metadata))
    } else if file_type.is_file() {
        Meta::file(name, modified_of(metadata), metadata.len())
    } else {
        Meta::missing(name)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn parallelizable(&self) -> bool {
        false
    }

    #[instrument(skip(self), fields(storage = %self.name))]
    async fn get_meta(&self, path: &str) -> Result<Meta, StorageError> {
        let host = self.resolve(path);
        let name = path::basename(path).to_string();
        match tokio::fs::symlink_metadata(&host).await {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                let link = tokio::fs::read_link(&host)
                    .await
                    .ok()
                    .map(|target| path::from_sys(&target.to_string_lossy()));
                Ok(Meta {
                    link,
                    ..Meta::missing(name)
                })
            }
            Ok(metadata) => Ok(meta_from(name, &metadata)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Meta::missing(name)),
            Err(e) => Err(StorageError::from_io(e, path)),
        }
    }

    #[instrument(skip(self), fields(storage = %self.name))]
    async fn listdir(&self, path: &str) -> Result<Vec<Meta>, StorageError> {
        let host = self.resolve(path);
        let mut entries = tokio::fs::read_dir(&host)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let meta = meta_from(name, &metadata);
            if meta.exists() {
                children.push(meta);
            }
        }
        Ok(children)
    }

    #[instrument(skip(self), fields(storage = %self.name))]
    async fn mkdir(&self, path: &str) -> Result<(), StorageError> {
        Self::check_name(path::denormalize_dir(path))?;
        tokio::fs::create_dir(self.resolve(path))
            .await
            .map_err(|e| StorageError::from_io(e, path))
    }

    #[instrument(skip(self), fields(storage = %self.name))]
    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let host = self.resolve(path);
        let metadata = tokio::fs::symlink_metadata(&host)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&host).await
        } else {
            tokio::fs::remove_file(&host).await
        };
        result.map_err(|e| StorageError::from_io(e, path))
    }

    #[instrument(skip(self, reader), fields(storage = %self.name))]
    async fn upload(
        &self,
        reader: BoxedReader,
        size: u64,
        path: &str,
    ) -> Result<TransferController, StorageError> {
        Self::check_name(path)?;
        let target = self.resolve(path);
        let parent_exists = match target.parent() {
            Some(parent) => tokio::fs::metadata(parent)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            None => false,
        };
        if !parent_exists {
            return Err(StorageError::NotFound(path::dirname(path).to_string()));
        }

        let mut tmp = target.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;

        let sink = LocalFileSink {
            file: Some(file),
            tmp,
            target,
            path: path.to_string(),
        };
        Ok(TransferController::new(reader, Box::new(sink), self.chunk_size()).with_size(size))
    }

    #[instrument(skip(self, sink), fields(storage = %self.name))]
    async fn download(
        &self,
        path: &str,
        sink: Box<dyn ChunkSink>,
    ) -> Result<TransferController, StorageError> {
        let host = self.resolve(path);
        let file = tokio::fs::File::open(&host)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(TransferController::new(Box::new(file), sink, self.chunk_size()).with_size(metadata.len()))
    }
}

/// Writes into a temporary file renamed over the target on success
struct LocalFileSink {
    file: Option<tokio::fs::File>,
    tmp: PathBuf,
    target: PathBuf,
    path: String,
}

#[async_trait]
impl ChunkSink for LocalFileSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        match self.file.as_mut() {
            Some(file) => file
                .write_all(chunk)
                .await
                .map_err(|e| StorageError::from_io(e, &self.path)),
            None => Err(StorageError::Permanent(format!(
                "write after finish: {}",
                self.path
            ))),
        }
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| StorageError::from_io(e, &self.path))?;
            file.sync_all()
                .await
                .map_err(|e| StorageError::from_io(e, &self.path))?;
        }
        tokio::fs::rename(&self.tmp, &self.target)
            .await
            .map_err(|e| StorageError::from_io(e, &self.path))?;
        debug!(path = %self.path, "Upload complete");
        Ok(())
    }

    async fn abort(&mut self) {
        self.file = None;
        let _ = tokio::fs::remove_file(&self.tmp).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SpillBuffer;

    fn storage(dir: &Path) -> LocalStorage {
        LocalStorage::new("local", dir)
    }

    #[tokio::test]
    async fn test_mkdir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());

        s.mkdir("/a").await.unwrap();
        assert!(matches!(
            s.mkdir("/a").await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(
            s.mkdir("/missing/b").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(s.is_dir("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_meta_and_listdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("f.txt"), b"hello").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("f.txt"), dir.path().join("link")).unwrap();
        let s = storage(dir.path());

        let meta = s.get_meta("/f.txt").await.unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 5);
        assert_eq!(meta.name, "f.txt");
        assert!(!s.get_meta("/nope").await.unwrap().exists());

        let mut names: Vec<String> = s
            .listdir("/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["f.txt", "sub"]);
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let data = vec![7u8; 1000];

        let controller = s
            .upload(Box::new(std::io::Cursor::new(data.clone())), 1000, "/out.bin")
            .await
            .unwrap();
        assert_eq!(controller.work().await.unwrap(), 1000);
        assert!(!dir.path().join("out.bin.tmp").exists());

        let (sink, done) = SpillBuffer::new().into_sink();
        s.download("/out.bin", Box::new(sink))
            .await
            .unwrap()
            .work()
            .await
            .unwrap();
        let buffer = done.await.unwrap();
        assert_eq!(buffer.to_vec().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_upload_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let result = s
            .upload(Box::new(std::io::Cursor::new(vec![1u8])), 1, "/no/f")
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_long_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let long = format!("/{}", "x".repeat(MAX_LOCAL_NAME_LEN + 1));
        assert!(matches!(
            s.mkdir(&long).await,
            Err(StorageError::NameTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c"), b"x").unwrap();
        let s = storage(dir.path());

        s.remove("/a/").await.unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(matches!(
            s.remove("/a").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
