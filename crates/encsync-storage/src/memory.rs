//! In-process object store
//!
//! Behaves like a remote storage (parallelizable, remote chunk size) while
//! keeping everything in memory. Tests use it in place of cloud backends;
//! it can be made case-insensitive, given explicit modification times and
//! told to fail the next calls with temporary errors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encsync_core::domain::{path, NodeType, StorageKind};
use encsync_core::ports::{BoxedReader, ChunkSink, Meta, Storage, StorageError, TransferController};
use tokio::sync::watch;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
struct Entry {
    /// Full path with the case it was created with
    path: String,
    kind: NodeType,
    data: Arc<Vec<u8>>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    failures: usize,
}

#[derive(Debug)]
struct Inner {
    name: String,
    case_sensitive: bool,
    tree: Mutex<Tree>,
    /// Bytes received by uploads, finished or not
    received: watch::Sender<u64>,
}

/// Shared in-memory storage; clones see the same tree
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_case_sensitivity(name, true)
    }

    pub fn with_case_sensitivity(name: impl Into<String>, case_sensitive: bool) -> Self {
        let mut tree = Tree::default();
        tree.entries.insert(
            "/".to_string(),
            Entry {
                path: "/".to_string(),
                kind: NodeType::Dir,
                data: Arc::new(Vec::new()),
                modified: DateTime::<Utc>::UNIX_EPOCH,
            },
        );
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                case_sensitive,
                tree: Mutex::new(tree),
                received: watch::channel(0).0,
            }),
        }
    }

    fn tree(&self) -> Result<MutexGuard<'_, Tree>, StorageError> {
        self.inner
            .tree
            .lock()
            .map_err(|_| StorageError::Permanent("memory storage lock poisoned".to_string()))
    }

    /// Lookup key of a path: no trailing separator, folded when the storage
    /// is case-insensitive.
    fn key(&self, storage_path: &str) -> String {
        let normalized = path::join_properly("/", storage_path);
        if self.inner.case_sensitive {
            normalized
        } else {
            normalized.to_lowercase()
        }
    }

    fn parent_key(&self, key: &str) -> String {
        path::dirname(key).to_string()
    }

    /// Consumes one injected failure, if any.
    fn check_failure(&self, op: &str, storage_path: &str) -> Result<(), StorageError> {
        let mut tree = self.tree()?;
        if tree.failures > 0 {
            tree.failures -= 1;
            return Err(StorageError::Temporary(format!(
                "injected failure: {op} {storage_path}"
            )));
        }
        Ok(())
    }

    /// Observes the bytes received by uploads, updated on every chunk.
    pub fn watch_received(&self) -> watch::Receiver<u64> {
        self.inner.received.subscribe()
    }

    /// Makes the next `n` calls fail with a temporary error.
    pub fn fail_next(&self, n: usize) {
        if let Ok(mut tree) = self.inner.tree.lock() {
            tree.failures = n;
        }
    }

    /// Creates a directory and its missing parents.
    pub fn put_dir(&self, storage_path: &str, modified: DateTime<Utc>) -> Result<(), StorageError> {
        let mut tree = self.tree()?;
        self.insert_parents(&mut tree, storage_path, modified);
        let key = self.key(storage_path);
        tree.entries.entry(key).or_insert_with(|| Entry {
            path: path::join_properly("/", storage_path),
            kind: NodeType::Dir,
            data: Arc::new(Vec::new()),
            modified,
        });
        Ok(())
    }

    /// Writes a file, creating missing parents.
    pub fn put_file(
        &self,
        storage_path: &str,
        data: impl Into<Vec<u8>>,
        modified: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tree = self.tree()?;
        self.insert_parents(&mut tree, storage_path, modified);
        let key = self.key(storage_path);
        let display = tree
            .entries
            .get(&key)
            .map(|e| e.path.clone())
            .unwrap_or_else(|| path::join_properly("/", storage_path));
        tree.entries.insert(
            key,
            Entry {
                path: display,
                kind: NodeType::File,
                data: Arc::new(data.into()),
                modified,
            },
        );
        Ok(())
    }

    /// Changes the modification time of an existing entry.
    pub fn set_modified(&self, storage_path: &str, modified: DateTime<Utc>) -> Result<(), StorageError> {
        let mut tree = self.tree()?;
        let key = self.key(storage_path);
        match tree.entries.get_mut(&key) {
            Some(entry) => {
                entry.modified = modified;
                Ok(())
            }
            None => Err(StorageError::NotFound(storage_path.to_string())),
        }
    }

    pub fn read_file(&self, storage_path: &str) -> Option<Vec<u8>> {
        let tree = self.inner.tree.lock().ok()?;
        tree.entries
            .get(&self.key(storage_path))
            .filter(|e| e.kind == NodeType::File)
            .map(|e| e.data.as_ref().clone())
    }

    /// Every path in the store, directories with a trailing `/`, sorted.
    pub fn paths(&self) -> Vec<String> {
        let Ok(tree) = self.inner.tree.lock() else {
            return Vec::new();
        };
        let mut paths: Vec<String> = tree
            .entries
            .values()
            .filter(|e| e.path != "/")
            .map(|e| match e.kind {
                NodeType::Dir => path::normalize_dir(&e.path),
                NodeType::File => e.path.clone(),
            })
            .collect();
        paths.sort();
        paths
    }

    fn insert_parents(&self, tree: &mut Tree, storage_path: &str, modified: DateTime<Utc>) {
        let full = path::join_properly("/", storage_path);
        let mut current = String::new();
        let segments: Vec<&str> = path::Separator::SLASH.segments(&full).collect();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            current = format!("{current}/{segment}");
            let key = self.key(&current);
            tree.entries.entry(key).or_insert_with(|| Entry {
                path: current.clone(),
                kind: NodeType::Dir,
                data: Arc::new(Vec::new()),
                modified,
            });
        }
    }

    fn meta_of(entry: &Entry) -> Meta {
        let name = path::basename(&entry.path).to_string();
        match entry.kind {
            NodeType::Dir => Meta::dir(name, entry.modified),
            NodeType::File => Meta::file(name, entry.modified, entry.data.len() as u64),
        }
    }

    fn require_dir(tree: &Tree, key: &str, shown: &str) -> Result<(), StorageError> {
        match tree.entries.get(key) {
            Some(entry) if entry.kind == NodeType::Dir => Ok(()),
            Some(_) => Err(StorageError::Permanent(format!("not a directory: {shown}"))),
            None => Err(StorageError::NotFound(shown.to_string())),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Remote
    }

    fn case_sensitive(&self) -> bool {
        self.inner.case_sensitive
    }

    fn parallelizable(&self) -> bool {
        true
    }

    async fn get_meta(&self, storage_path: &str) -> Result<Meta, StorageError> {
        self.check_failure("get_meta", storage_path)?;
        let tree = self.tree()?;
        Ok(tree
            .entries
            .get(&self.key(storage_path))
            .map(Self::meta_of)
            .unwrap_or_else(|| Meta::missing(path::basename(storage_path))))
    }

    #[instrument(skip(self), fields(storage = %self.inner.name))]
    async fn listdir(&self, storage_path: &str) -> Result<Vec<Meta>, StorageError> {
        self.check_failure("listdir", storage_path)?;
        let tree = self.tree()?;
        let key = self.key(storage_path);
        Self::require_dir(&tree, &key, storage_path)?;

        Ok(tree
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != key && self.parent_key(k) == key)
            .map(|(_, entry)| Self::meta_of(entry))
            .collect())
    }

    #[instrument(skip(self), fields(storage = %self.inner.name))]
    async fn mkdir(&self, storage_path: &str) -> Result<(), StorageError> {
        self.check_failure("mkdir", storage_path)?;
        let mut tree = self.tree()?;
        let key = self.key(storage_path);
        if tree.entries.contains_key(&key) {
            return Err(StorageError::AlreadyExists(storage_path.to_string()));
        }
        Self::require_dir(&tree, &self.parent_key(&key), path::dirname(storage_path))?;
        tree.entries.insert(
            key,
            Entry {
                path: path::join_properly("/", storage_path),
                kind: NodeType::Dir,
                data: Arc::new(Vec::new()),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    #[instrument(skip(self), fields(storage = %self.inner.name))]
    async fn remove(&self, storage_path: &str) -> Result<(), StorageError> {
        self.check_failure("remove", storage_path)?;
        let mut tree = self.tree()?;
        let key = self.key(storage_path);
        if key == "/" {
            return Err(StorageError::Permanent("cannot remove the root".to_string()));
        }
        if tree.entries.remove(&key).is_none() {
            return Err(StorageError::NotFound(storage_path.to_string()));
        }
        let children = path::normalize_dir(&key);
        tree.entries.retain(|k, _| !k.starts_with(&children));
        debug!(path = storage_path, "Removed");
        Ok(())
    }

    #[instrument(skip(self, reader), fields(storage = %self.inner.name))]
    async fn upload(
        &self,
        reader: BoxedReader,
        size: u64,
        storage_path: &str,
    ) -> Result<TransferController, StorageError> {
        self.check_failure("upload", storage_path)?;
        {
            let tree = self.tree()?;
            let key = self.key(storage_path);
            Self::require_dir(&tree, &self.parent_key(&key), path::dirname(storage_path))?;
            if matches!(tree.entries.get(&key), Some(e) if e.kind == NodeType::Dir) {
                return Err(StorageError::AlreadyExists(storage_path.to_string()));
            }
        }
        let sink = MemorySink {
            storage: self.clone(),
            path: storage_path.to_string(),
            data: Vec::with_capacity(size.min(64 * 1024 * 1024) as usize),
        };
        Ok(TransferController::new(reader, Box::new(sink), self.chunk_size()).with_size(size))
    }

    #[instrument(skip(self, sink), fields(storage = %self.inner.name))]
    async fn download(
        &self,
        storage_path: &str,
        sink: Box<dyn ChunkSink>,
    ) -> Result<TransferController, StorageError> {
        self.check_failure("download", storage_path)?;
        let data = {
            let tree = self.tree()?;
            match tree.entries.get(&self.key(storage_path)) {
                Some(entry) if entry.kind == NodeType::File => Arc::clone(&entry.data),
                _ => return Err(StorageError::NotFound(storage_path.to_string())),
            }
        };
        let size = data.len() as u64;
        let reader = std::io::Cursor::new(data.as_ref().clone());
        Ok(TransferController::new(Box::new(reader), sink, self.chunk_size()).with_size(size))
    }
}

/// Collects an upload and publishes it on `finish`
struct MemorySink {
    storage: MemoryStorage,
    path: String,
    data: Vec<u8>,
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.data.extend_from_slice(chunk);
        self.storage
            .inner
            .received
            .send_modify(|n| *n += chunk.len() as u64);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        let mut tree = self.storage.tree()?;
        let key = self.storage.key(&self.path);
        Self::ensure_parent(&self.storage, &tree, &key, &self.path)?;
        // Case-insensitive stores keep the name an entry was created with.
        let display = tree
            .entries
            .get(&key)
            .map(|e| e.path.clone())
            .unwrap_or_else(|| path::join_properly("/", &self.path));
        tree.entries.insert(
            key,
            Entry {
                path: display,
                kind: NodeType::File,
                data: Arc::new(std::mem::take(&mut self.data)),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort(&mut self) {
        self.data = Vec::new();
    }
}

impl MemorySink {
    fn ensure_parent(
        storage: &MemoryStorage,
        tree: &Tree,
        key: &str,
        shown: &str,
    ) -> Result<(), StorageError> {
        MemoryStorage::require_dir(tree, &storage.parent_key(key), path::dirname(shown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_tree_operations() {
        let s = MemoryStorage::new("mem");
        s.mkdir("/a").await.unwrap();
        s.mkdir("/a/b/").await.unwrap();
        assert!(matches!(s.mkdir("/a").await, Err(StorageError::AlreadyExists(_))));
        assert!(matches!(s.mkdir("/x/y").await, Err(StorageError::NotFound(_))));

        s.put_file("/a/b/f.txt", b"data".to_vec(), Utc::now()).unwrap();
        let names: Vec<String> = s.listdir("/a").await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["b"]);

        s.remove("/a").await.unwrap();
        assert_eq!(s.paths(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_case_insensitive_store_merges_names() {
        let s = MemoryStorage::with_case_sensitivity("mem", false);
        s.put_file("/Foo.txt", b"1".to_vec(), Utc::now()).unwrap();
        s.put_file("/foo.txt", b"22".to_vec(), Utc::now()).unwrap();

        assert_eq!(s.paths(), vec!["/Foo.txt"]);
        assert_eq!(s.read_file("/FOO.TXT").unwrap(), b"22");
    }

    #[tokio::test]
    async fn test_explicit_modification_times() {
        let s = MemoryStorage::new("mem");
        let t = Utc.timestamp_opt(1000, 0).unwrap();
        s.put_file("/d/f", b"x".to_vec(), t).unwrap();
        let meta = s.get_meta("/d/f").await.unwrap();
        assert_eq!(meta.modified, t);
        assert!(s.get_meta("/d").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_received_bytes_count_unfinished_uploads() {
        let s = MemoryStorage::new("mem");
        let received = s.watch_received();
        let data = vec![9u8; 1000];
        let ctl = s
            .upload(Box::new(std::io::Cursor::new(data)), 1000, "/f")
            .await
            .unwrap();
        ctl.stop();
        assert!(ctl.work().await.unwrap_err().is_interrupted());
        assert_eq!(*received.borrow(), 0);
        assert!(s.read_file("/f").is_none());

        let ctl = s
            .upload(Box::new(std::io::Cursor::new(vec![1u8; 10])), 10, "/g")
            .await
            .unwrap();
        ctl.work().await.unwrap();
        assert_eq!(*received.borrow(), 10);
    }

    #[tokio::test]
    async fn test_injected_failures_are_temporary() {
        let s = MemoryStorage::new("mem");
        s.fail_next(2);
        assert!(s.get_meta("/").await.unwrap_err().is_transient());
        assert!(s.listdir("/").await.unwrap_err().is_transient());
        assert!(s.listdir("/").await.is_ok());
    }
}
