//! Duplicate remover
//!
//! Removes the extra ciphertexts recorded in a storage's duplist for one
//! encrypted folder. The pass iterates a snapshot of the duplist so that no
//! read transaction stays open on the live file while removals delete rows
//! from it. A removal that fails leaves its row in place for the next run.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use encsync_cache::{CdbRegistry, DataDir, Duplist};
use encsync_core::domain::{Duplicate, StatusCounts, TaskStatus};
use encsync_storage::FolderStorage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::StageReporter;
use crate::worker::{cursor_stream, run_pool, Worker};
use crate::SyncError;

pub struct DuplicateRemover {
    folder: Arc<FolderStorage>,
    duplist: Duplist,
    registry: Arc<CdbRegistry>,
    layout: DataDir,
    threads: usize,
    token: CancellationToken,
    reporter: Option<StageReporter>,
}

impl DuplicateRemover {
    pub fn new(
        folder: Arc<FolderStorage>,
        duplist: Duplist,
        registry: Arc<CdbRegistry>,
        layout: DataDir,
        threads: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            folder,
            duplist,
            registry,
            layout,
            threads: threads.max(1),
            token,
            reporter: None,
        }
    }

    /// Reports every removal as a task of a target stage.
    #[must_use]
    pub fn with_reporter(mut self, reporter: StageReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Removes every duplicate under the folder prefix.
    pub async fn run(&self) -> Result<StatusCounts, SyncError> {
        let folder = self.folder.folder();
        if !folder.encrypted || self.duplist.count().await? == 0 {
            return Ok(StatusCounts::default());
        }

        let snapshot_path = self.layout.snapshot_path(&folder.storage_name);
        self.duplist.snapshot(&snapshot_path).await?;
        let result = self.remove_from_snapshot(&snapshot_path).await;
        remove_snapshot(&snapshot_path).await;

        let counts = result?;
        info!(
            folder = %folder.name,
            removed = counts.finished,
            failed = counts.failed,
            "Duplicate removal done"
        );
        Ok(counts)
    }

    async fn remove_from_snapshot(&self, snapshot_path: &Path) -> Result<StatusCounts, SyncError> {
        let snapshot = Duplist::open_at(&self.registry, snapshot_path).await?;
        let threads = if self.folder.parallelizable() {
            self.threads
        } else {
            1
        };
        let tasks = cursor_stream(snapshot.select_children(&self.folder.folder().prefix));
        run_pool(tasks, threads, &self.token, |duplicate| self.remove_one(duplicate)).await
    }

    async fn remove_one(&self, duplicate: Duplicate) -> TaskStatus {
        let status = self.try_remove(&duplicate).await;
        if let Some(reporter) = &self.reporter {
            reporter.task(&duplicate.path, status);
        }
        status
    }

    async fn try_remove(&self, duplicate: &Duplicate) -> TaskStatus {
        if self.token.is_cancelled() {
            return TaskStatus::Suspended;
        }
        let rel = match self.folder.folder().relative(&duplicate.path) {
            Ok(rel) => rel,
            Err(e) => {
                warn!(path = %duplicate.path, error = %e, "Duplicate outside folder");
                return TaskStatus::Skipped;
            }
        };

        match self.folder.remove_with_ivs(&rel, &duplicate.ivs).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(path = %duplicate.path, "Duplicate already gone");
            }
            Err(e) if e.is_interrupted() => return TaskStatus::Suspended,
            Err(e) => {
                self.report_error(&duplicate.path, &e);
                return TaskStatus::Failed;
            }
        }

        match self.duplist.remove(&duplicate.path, &duplicate.ivs).await {
            Ok(_) => {
                debug!(path = %duplicate.path, "Removed duplicate");
                TaskStatus::Finished
            }
            Err(e) => {
                self.report_error(&duplicate.path, &e);
                TaskStatus::Failed
            }
        }
    }

    fn report_error(&self, path: &str, error: &dyn std::fmt::Display) {
        match &self.reporter {
            Some(reporter) => reporter.error(path, error),
            None => warn!(path, error = %error, "Duplicate removal failed"),
        }
    }
}

/// Deletes a snapshot and its journal files.
async fn remove_snapshot(path: &Path) {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(name.into());
    }
    for file in files {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %file.display(), error = %e, "Could not delete duplist snapshot"),
        }
    }
}

#[async_trait]
impl Worker for DuplicateRemover {
    fn name(&self) -> &str {
        "rmdup"
    }

    fn stopper(&self) -> &CancellationToken {
        &self.token
    }

    async fn work(&mut self) -> Result<TaskStatus, SyncError> {
        let counts = self.run().await?;
        if counts.total == 0 {
            return Ok(TaskStatus::Finished);
        }
        Ok(counts.aggregate())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use encsync_core::crypto::{encrypt_filename, Key};
    use encsync_core::domain::{FilenameEncoding, Folder, NodeType};
    use encsync_storage::MemoryStorage;

    use super::*;

    #[tokio::test]
    async fn test_removes_recorded_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(CdbRegistry::default());
        let layout = DataDir::new(dir.path());
        let duplist = Duplist::open(&registry, &layout, "mem").await.unwrap();

        let key = Key::new(vec![3u8; 32]).unwrap();
        let storage = MemoryStorage::new("mem");
        let (keep, _) = encrypt_filename("f", &key, &[1u8; 16], FilenameEncoding::Base64).unwrap();
        let (extra, _) = encrypt_filename("f", &key, &[2u8; 16], FilenameEncoding::Base64).unwrap();
        let at = Utc.timestamp_opt(10, 0).unwrap();
        storage.put_file(&format!("/v/{keep}"), vec![0u8; 40], at).unwrap();
        storage.put_file(&format!("/v/{extra}"), vec![0u8; 40], at).unwrap();

        duplist
            .insert(&Duplicate {
                node_type: NodeType::File,
                ivs: vec![2u8; 16],
                path: "/v/f".to_string(),
            })
            .await
            .unwrap();
        // Rows of other folders on the same storage stay untouched.
        duplist
            .insert(&Duplicate {
                node_type: NodeType::File,
                ivs: vec![4u8; 16],
                path: "/other/g".to_string(),
            })
            .await
            .unwrap();

        let folder = FolderStorage::new(
            Arc::new(storage.clone()),
            Folder::new("v", "mem", "/v").encrypted(FilenameEncoding::Base64),
            Some(key),
            Some(Key::new(vec![5u8; 32]).unwrap()),
        )
        .unwrap();
        let mut remover = DuplicateRemover::new(
            Arc::new(folder),
            duplist.clone(),
            Arc::clone(&registry),
            layout,
            4,
            CancellationToken::new(),
        );

        let status = crate::worker::run_worker(&mut remover).await;
        assert_eq!(status, TaskStatus::Finished);
        assert_eq!(storage.paths(), vec!["/v/".to_string(), format!("/v/{keep}")]);

        let left = duplist.select_all().collect_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].path, "/other/g");

        let snapshots: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("snapshot"))
            .collect();
        assert!(snapshots.is_empty());
    }
}
