//! Folder scanner
//!
//! The scanner walks a folder on its storage and rebuilds the folder's
//! filelist. On encrypted folders it also records duplicates: ciphertexts
//! that decrypt to a name already seen in the same directory.
//!
//! ## Algorithm
//!
//! 1. Clear the filelist (and the duplist entries under the prefix).
//! 2. Stat the folder root; a missing root yields an empty filelist.
//! 3. List directories, in parallel when the storage allows it, otherwise
//!    depth first in lexicographic order with a single worker.
//! 4. Within one directory, entries decrypting to the same path keep the
//!    most recently modified one; the others go to the duplist.
//! 5. Commit on success. Any failure or stop rolls both inventories back,
//!    so a stopped scan starts over on the next run.
//!
//! Listing runs on spawned tasks; every inventory write happens on the
//! scanner's own task.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use encsync_cache::{Duplist, Filelist};
use encsync_core::crypto::content::{padded_size, padded_size_of_encrypted};
use encsync_core::domain::{path, Duplicate, Node, NodeType, StatusCounts, TaskStatus};
use encsync_core::events::Emitter;
use encsync_storage::{FolderStorage, ListedEntry};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filter::PathFilter;
use crate::worker::Worker;
use crate::SyncError;

/// Events raised by a standalone scanner
pub const SCANNER_EVENTS: &[&str] = &["status_changed", "duplicates_found"];

// ============================================================================
// Scan targets and reports
// ============================================================================

/// A folder to scan together with its inventories
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub folder: Arc<FolderStorage>,
    pub filelist: Filelist,
    /// Required for encrypted folders
    pub duplist: Option<Duplist>,
}

impl ScanTarget {
    pub fn new(folder: Arc<FolderStorage>, filelist: Filelist, duplist: Option<Duplist>) -> Self {
        Self {
            folder,
            filelist,
            duplist,
        }
    }

    fn name(&self) -> &str {
        &self.folder.folder().name
    }
}

/// Outcome of scanning one folder
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub folder: String,
    pub status: TaskStatus,
    pub nodes: u64,
    pub duplicates: u64,
    pub error: Option<String>,
}

#[derive(Default)]
struct ScanStats {
    nodes: u64,
    duplicates: u64,
}

// ============================================================================
// Directory listing
// ============================================================================

/// A directory waiting to be listed
#[derive(Debug, Clone)]
struct DirJob {
    storage_path: String,
    /// Folder-relative path, `""` for the root
    rel: String,
    ivs: Vec<u8>,
}

/// Entries of one directory that decrypt to the same path
#[derive(Debug, Serialize)]
struct DuplicateGroup {
    path: String,
    entries: Vec<serde_json::Value>,
}

#[derive(Default)]
struct Listing {
    nodes: Vec<Node>,
    subdirs: Vec<DirJob>,
    duplicates: Vec<Duplicate>,
    groups: Vec<DuplicateGroup>,
}

/// Lists one directory and turns its entries into nodes.
async fn read_directory(
    folder: &FolderStorage,
    filter: &PathFilter,
    job: &DirJob,
) -> Result<Listing, SyncError> {
    let mut entries: Vec<ListedEntry> = match folder.list_storage_dir(&job.storage_path).await {
        Ok(entries) => entries,
        Err(e) if e.is_not_found() => {
            debug!(dir = %job.storage_path, "Directory vanished during scan");
            return Ok(Listing::default());
        }
        Err(e) => return Err(e.into()),
    };
    entries.retain(|e| e.meta.exists());
    // Same name and kind end up adjacent, newest first.
    entries.sort_by(|a, b| {
        a.meta
            .name
            .cmp(&b.meta.name)
            .then(a.meta.is_dir().cmp(&b.meta.is_dir()))
            .then(b.meta.modified.cmp(&a.meta.modified))
    });

    let encrypted = folder.encrypted();
    let mut listing = Listing::default();
    let mut idx = 0;
    while idx < entries.len() {
        let mut end = idx + 1;
        while end < entries.len()
            && entries[end].meta.name == entries[idx].meta.name
            && entries[end].meta.is_dir() == entries[idx].meta.is_dir()
        {
            end += 1;
        }
        let group = &entries[idx..end];
        idx = end;

        let primary = &group[0];
        let is_dir = primary.meta.is_dir();
        let joined = path::join(&job.rel, &primary.meta.name);
        let rel = if is_dir {
            path::normalize_dir(&joined)
        } else {
            joined
        };
        if !filter.includes(&rel) {
            debug!(path = %rel, "Excluded by filter");
            continue;
        }

        let absolute = folder.folder().absolute(&rel);
        let ivs_of = |entry: &ListedEntry| -> Vec<u8> {
            if encrypted {
                [job.ivs.as_slice(), entry.iv.as_slice()].concat()
            } else {
                Vec::new()
            }
        };
        let ivs = ivs_of(primary);

        if is_dir {
            listing.subdirs.push(DirJob {
                storage_path: path::normalize_dir(&path::join(
                    &job.storage_path,
                    &primary.storage_name,
                )),
                rel: rel.clone(),
                ivs: ivs.clone(),
            });
            listing.nodes.push(Node::dir(&absolute, primary.meta.modified, ivs));
        } else {
            let padded = if encrypted {
                padded_size_of_encrypted(primary.meta.size)
            } else {
                padded_size(primary.meta.size)
            };
            listing
                .nodes
                .push(Node::file(absolute, primary.meta.modified, padded, ivs));
        }

        if group.len() > 1 && encrypted {
            let node_type = if is_dir { NodeType::Dir } else { NodeType::File };
            for extra in &group[1..] {
                listing.duplicates.push(Duplicate {
                    node_type,
                    ivs: ivs_of(extra),
                    path: folder.folder().absolute(&rel),
                });
            }
            listing.groups.push(DuplicateGroup {
                path: rel,
                entries: group
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| {
                        json!({
                            "storage_name": entry.storage_name,
                            "modified": entry.meta.modified.timestamp(),
                            "size": entry.meta.size,
                            "primary": i == 0,
                        })
                    })
                    .collect(),
            });
        }
    }
    Ok(listing)
}

// ============================================================================
// Scanner
// ============================================================================

/// Scans a FIFO of folders, one after the other
pub struct Scanner {
    queue: VecDeque<ScanTarget>,
    threads: usize,
    filter: Arc<PathFilter>,
    emitter: Emitter,
    token: CancellationToken,
    reports: Vec<ScanReport>,
}

impl Scanner {
    /// `threads` bounds the directories listed at once on parallelizable
    /// storages.
    pub fn new(threads: usize, filter: PathFilter, token: CancellationToken) -> Self {
        Self {
            queue: VecDeque::new(),
            threads: threads.max(1),
            filter: Arc::new(filter),
            emitter: Emitter::new("scanner", SCANNER_EVENTS.iter().copied()),
            token,
            reports: Vec::new(),
        }
    }

    /// Raises events on `emitter` instead of the scanner's own.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn add_target(&mut self, target: ScanTarget) {
        self.queue.push_back(target);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Reports of the targets scanned so far.
    pub fn reports(&self) -> &[ScanReport] {
        &self.reports
    }

    /// Scans every queued target in FIFO order. Targets left when the
    /// scanner is stopped stay queued.
    pub async fn run(&mut self) -> Vec<ScanReport> {
        let mut reports = Vec::new();
        while !self.token.is_cancelled() {
            let Some(target) = self.queue.pop_front() else {
                break;
            };
            let report = self.scan(&target).await;
            self.reports.push(report.clone());
            reports.push(report);
        }
        reports
    }

    fn set_status(&self, folder: &str, from: TaskStatus, to: TaskStatus) {
        self.emitter.emit(
            "status_changed",
            json!({ "folder": folder, "from": from.as_str(), "to": to.as_str() }),
        );
    }

    /// Scans one folder inside a transaction on its inventories.
    pub async fn scan(&self, target: &ScanTarget) -> ScanReport {
        let name = target.name().to_string();
        let mut report = ScanReport {
            folder: name.clone(),
            status: TaskStatus::Pending,
            nodes: 0,
            duplicates: 0,
            error: None,
        };
        self.set_status(&name, TaskStatus::New, TaskStatus::Pending);
        info!(folder = %name, prefix = %target.folder.folder().prefix, "Scanning folder");

        let mut stats = ScanStats::default();
        let outcome = match self.begin(target).await {
            Ok(()) => {
                let result = self.scan_folder(target, &mut stats).await;
                self.finish(target, result).await
            }
            Err(e) => Err(e),
        };

        report.nodes = stats.nodes;
        report.duplicates = stats.duplicates;
        report.status = match outcome {
            Ok(()) => {
                info!(folder = %name, nodes = stats.nodes, duplicates = stats.duplicates, "Scan finished");
                TaskStatus::Finished
            }
            Err(e) if e.is_stop() => {
                info!(folder = %name, "Scan stopped");
                TaskStatus::Suspended
            }
            Err(e) => {
                error!(folder = %name, error = %e, "Scan failed");
                report.error = Some(e.to_string());
                TaskStatus::Failed
            }
        };
        self.set_status(&name, TaskStatus::Pending, report.status);
        report
    }

    async fn begin(&self, target: &ScanTarget) -> Result<(), SyncError> {
        target.filelist.begin().await?;
        if let Some(duplist) = &target.duplist {
            if let Err(e) = duplist.begin().await {
                target.filelist.rollback().await?;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Commits after a complete scan and rolls back otherwise.
    async fn finish(
        &self,
        target: &ScanTarget,
        result: Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        match result {
            Ok(()) => {
                target.filelist.commit().await?;
                if let Some(duplist) = &target.duplist {
                    duplist.commit().await?;
                }
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = target.filelist.rollback().await {
                    warn!(folder = target.name(), error = %rollback, "Filelist rollback failed");
                }
                if let Some(duplist) = &target.duplist {
                    if let Err(rollback) = duplist.rollback().await {
                        warn!(folder = target.name(), error = %rollback, "Duplist rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn scan_folder(&self, target: &ScanTarget, stats: &mut ScanStats) -> Result<(), SyncError> {
        let folder = &target.folder;
        let prefix = folder.folder().prefix.clone();

        target.filelist.clear().await?;
        if folder.encrypted() {
            let Some(duplist) = &target.duplist else {
                return Err(SyncError::Storage(encsync_core::ports::StorageError::Permanent(
                    format!("encrypted folder {} scanned without a duplist", target.name()),
                )));
            };
            duplist.remove_children(&prefix).await?;
        }

        let root = match folder.storage().get_meta(&prefix).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !root.is_dir() {
            debug!(folder = target.name(), "Folder root does not exist");
            return Ok(());
        }
        target
            .filelist
            .insert_node(&Node::dir(&prefix, root.modified, Vec::new()))
            .await?;
        stats.nodes += 1;

        let root_job = DirJob {
            storage_path: prefix,
            rel: String::new(),
            ivs: Vec::new(),
        };
        if folder.parallelizable() && self.threads > 1 {
            self.scan_parallel(target, root_job, stats).await
        } else {
            self.scan_serial(target, root_job, stats).await
        }
    }

    /// Depth-first walk with one worker, children in lexicographic order.
    async fn scan_serial(
        &self,
        target: &ScanTarget,
        root: DirJob,
        stats: &mut ScanStats,
    ) -> Result<(), SyncError> {
        let mut stack = vec![root];
        while let Some(job) = stack.pop() {
            if self.token.is_cancelled() {
                return Err(SyncError::Stopped);
            }
            let listing = read_directory(&target.folder, &self.filter, &job).await?;
            let mut subdirs = self.record(target, listing, stats).await?;
            subdirs.reverse();
            stack.extend(subdirs);
        }
        Ok(())
    }

    /// Lists up to `threads` directories at once.
    async fn scan_parallel(
        &self,
        target: &ScanTarget,
        root: DirJob,
        stats: &mut ScanStats,
    ) -> Result<(), SyncError> {
        let mut pending = VecDeque::from([root]);
        let mut running: JoinSet<Result<Listing, SyncError>> = JoinSet::new();

        loop {
            while running.len() < self.threads {
                let Some(job) = pending.pop_front() else {
                    break;
                };
                let folder = Arc::clone(&target.folder);
                let filter = Arc::clone(&self.filter);
                running.spawn(async move { read_directory(&folder, &filter, &job).await });
            }

            let Some(joined) = running.join_next().await else {
                return Ok(());
            };
            if self.token.is_cancelled() {
                running.abort_all();
                return Err(SyncError::Stopped);
            }
            let listing = match joined {
                Ok(Ok(listing)) => listing,
                Ok(Err(e)) => {
                    running.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    running.abort_all();
                    return Err(e.into());
                }
            };
            pending.extend(self.record(target, listing, stats).await?);
        }
    }

    /// Writes one directory's nodes and duplicates and returns its
    /// subdirectories.
    async fn record(
        &self,
        target: &ScanTarget,
        listing: Listing,
        stats: &mut ScanStats,
    ) -> Result<Vec<DirJob>, SyncError> {
        if !listing.nodes.is_empty() {
            target.filelist.insert_nodes(&listing.nodes).await?;
            stats.nodes += listing.nodes.len() as u64;
        }
        if let Some(duplist) = &target.duplist {
            for duplicate in &listing.duplicates {
                duplist.insert(duplicate).await?;
                stats.duplicates += 1;
            }
        }
        for group in listing.groups {
            warn!(
                folder = target.name(),
                path = %group.path,
                count = group.entries.len(),
                "Duplicate ciphertexts found"
            );
            self.emitter.emit(
                "duplicates_found",
                json!({ "folder": target.name(), "path": group.path, "entries": group.entries }),
            );
        }
        Ok(listing.subdirs)
    }
}

#[async_trait]
impl Worker for Scanner {
    fn name(&self) -> &str {
        "scanner"
    }

    fn stopper(&self) -> &CancellationToken {
        &self.token
    }

    async fn work(&mut self) -> Result<TaskStatus, SyncError> {
        let mut counts = StatusCounts::default();
        for report in self.run().await {
            counts.total += 1;
            counts.record(report.status);
        }
        if self.token.is_cancelled() && counts.pending == 0 && counts.failed == 0 {
            return Ok(TaskStatus::Suspended);
        }
        Ok(counts.aggregate())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use encsync_cache::{CdbRegistry, DataDir};
    use encsync_core::config::{PatternKind, PatternRule};
    use encsync_core::crypto::{encrypt_filename, Key};
    use encsync_core::domain::{FilenameEncoding, Folder};
    use encsync_storage::{LocalStorage, MemoryStorage};

    use super::*;

    // ------------------------------------------------------------------------
    // Test helpers
    // ------------------------------------------------------------------------

    fn master_key() -> Key {
        Key::new(vec![3u8; 32]).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: CdbRegistry,
        layout: DataDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataDir::new(dir.path());
        Fixture {
            _dir: dir,
            registry: CdbRegistry::default(),
            layout,
        }
    }

    async fn target(fx: &Fixture, folder: FolderStorage) -> ScanTarget {
        let f = folder.folder().clone();
        let filelist = Filelist::open(&fx.registry, &fx.layout, &f.name, &f.storage_name)
            .await
            .unwrap();
        let duplist = Duplist::open(&fx.registry, &fx.layout, &f.storage_name)
            .await
            .unwrap();
        let folder = folder.with_filelist(filelist.clone());
        ScanTarget::new(Arc::new(folder), filelist, Some(duplist))
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn paths(filelist: &Filelist) -> Vec<String> {
        filelist
            .select_all_nodes()
            .collect_all()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.path)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_serial_scan_of_local_folder() {
        let fx = fixture();
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("b")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(src.path().join("b/c.txt"), vec![0u8; 17]).unwrap();

        let storage = Arc::new(LocalStorage::new("disk", src.path()));
        let folder = FolderStorage::new(storage, Folder::new("src", "disk", "/"), None, None).unwrap();
        let target = target(&fx, folder).await;

        let scanner = Scanner::new(4, PathFilter::allow_all(), CancellationToken::new());
        let report = scanner.scan(&target).await;

        assert_eq!(report.status, TaskStatus::Finished);
        assert_eq!(report.nodes, 4);
        assert_eq!(paths(&target.filelist).await, vec!["/", "/a.txt", "/b/", "/b/c.txt"]);
        let c = target.filelist.find_node("/b/c.txt").await.unwrap().unwrap();
        assert_eq!(c.padded_size, 32);
        assert!(c.ivs.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_scan_applies_filter() {
        let fx = fixture();
        let storage = MemoryStorage::new("mem");
        storage.put_file("/data/keep.txt", b"1".to_vec(), at(5)).unwrap();
        storage.put_file("/data/skip.log", b"2".to_vec(), at(5)).unwrap();
        storage.put_file("/data/sub/deep.log", b"3".to_vec(), at(5)).unwrap();
        storage.put_file("/data/sub/x/y.txt", b"4".to_vec(), at(5)).unwrap();

        let folder = FolderStorage::new(
            Arc::new(storage),
            Folder::new("data", "mem", "/data"),
            None,
            None,
        )
        .unwrap();
        let target = target(&fx, folder).await;
        let filter = PathFilter::new(&[PatternRule {
            kind: PatternKind::Exclude,
            patterns: vec!["*.log".to_string()],
        }])
        .unwrap();

        let report = Scanner::new(4, filter, CancellationToken::new()).scan(&target).await;
        assert_eq!(report.status, TaskStatus::Finished);
        assert_eq!(
            paths(&target.filelist).await,
            vec!["/data/", "/data/keep.txt", "/data/sub/", "/data/sub/x/", "/data/sub/x/y.txt"]
        );
    }

    #[tokio::test]
    async fn test_missing_root_yields_empty_filelist() {
        let fx = fixture();
        let storage = MemoryStorage::new("mem");
        let folder = FolderStorage::new(
            Arc::new(storage),
            Folder::new("gone", "mem", "/nothing/here"),
            None,
            None,
        )
        .unwrap();
        let target = target(&fx, folder).await;
        target
            .filelist
            .insert_node(&Node::file("/nothing/here/stale", at(1), 16, Vec::new()))
            .await
            .unwrap();

        let report = Scanner::new(2, PathFilter::allow_all(), CancellationToken::new())
            .scan(&target)
            .await;
        assert_eq!(report.status, TaskStatus::Finished);
        assert!(target.filelist.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicates_keep_newest_ciphertext() {
        let fx = fixture();
        let storage = MemoryStorage::new("mem");
        let key = master_key();
        let (old, _) =
            encrypt_filename("dup.bin", &key, &[1u8; 16], FilenameEncoding::Base64).unwrap();
        let (new, _) =
            encrypt_filename("dup.bin", &key, &[2u8; 16], FilenameEncoding::Base64).unwrap();
        storage.put_file(&format!("/enc/{old}"), vec![0u8; 40], at(10)).unwrap();
        storage.put_file(&format!("/enc/{new}"), vec![0u8; 56], at(20)).unwrap();

        let folder = FolderStorage::new(
            Arc::new(storage),
            Folder::new("vault", "mem", "/enc").encrypted(FilenameEncoding::Base64),
            Some(key),
            Some(Key::new(vec![4u8; 32]).unwrap()),
        )
        .unwrap();
        let target = target(&fx, folder).await;

        let scanner = Scanner::new(4, PathFilter::allow_all(), CancellationToken::new());
        let mut events = scanner.emitter().subscribe_channel(16);
        let report = scanner.scan(&target).await;

        assert_eq!(report.status, TaskStatus::Finished);
        assert_eq!(report.duplicates, 1);
        let node = target.filelist.find_node("/enc/dup.bin").await.unwrap().unwrap();
        assert_eq!(node.modified, at(20));
        assert_eq!(node.ivs, vec![2u8; 16]);
        assert_eq!(node.padded_size, 32);

        let duplist = target.duplist.as_ref().unwrap();
        let dups = duplist.select_all().collect_all().await.unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].path, "/enc/dup.bin");
        assert_eq!(dups[0].ivs, vec![1u8; 16]);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name);
        }
        assert!(names.contains(&"duplicates_found".to_string()));
    }

    #[tokio::test]
    async fn test_stopped_scan_rolls_back() {
        let fx = fixture();
        let storage = MemoryStorage::new("mem");
        storage.put_file("/a/b.txt", b"x".to_vec(), at(1)).unwrap();
        let folder =
            FolderStorage::new(Arc::new(storage), Folder::new("a", "mem", "/a"), None, None).unwrap();
        let target = target(&fx, folder).await;
        target
            .filelist
            .insert_node(&Node::file("/a/old.txt", at(1), 16, Vec::new()))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let report = Scanner::new(1, PathFilter::allow_all(), token).scan(&target).await;

        assert_eq!(report.status, TaskStatus::Suspended);
        assert_eq!(paths(&target.filelist).await, vec!["/a/old.txt"]);
    }

    #[tokio::test]
    async fn test_fifo_of_targets() {
        let fx = fixture();
        let storage = MemoryStorage::new("mem");
        storage.put_file("/one/f", b"1".to_vec(), at(1)).unwrap();
        storage.put_file("/two/g", b"2".to_vec(), at(1)).unwrap();
        let shared: Arc<dyn encsync_core::ports::Storage> = Arc::new(storage);

        let mut scanner = Scanner::new(2, PathFilter::allow_all(), CancellationToken::new());
        for name in ["one", "two"] {
            let folder =
                FolderStorage::new(Arc::clone(&shared), Folder::new(name, "mem", name), None, None)
                    .unwrap();
            scanner.add_target(target(&fx, folder).await);
        }
        assert_eq!(scanner.pending(), 2);

        let status = crate::worker::run_worker(&mut scanner).await;
        assert_eq!(status, TaskStatus::Finished);
        let folders: Vec<_> = scanner.reports().iter().map(|r| r.folder.clone()).collect();
        assert_eq!(folders, vec!["one", "two"]);
        assert_eq!(scanner.pending(), 0);
    }
}
