//! Folder storage
//!
//! A [`FolderStorage`] binds a storage to a folder prefix and its
//! encryption policy. Every path it accepts is folder-relative plaintext
//! (`""` is the folder root, directories may end with `/`).
//!
//! ## Design Decisions
//!
//! - **Plaintext prefix**: only the segments below the prefix are encrypted.
//! - **Deterministic names**: before encrypting a path the IVs recorded in
//!   the folder's filelist are reused. A known node gives all of its IVs; a
//!   new path reuses the IVs of its closest recorded ancestor and gets fresh
//!   random IVs for the remaining segments.
//! - **Two-step readers**: [`FolderStorage::get_file`] and
//!   [`FolderStorage::get_encrypted_file`] return a [`PendingTransfer`], so
//!   the caller can set a speed limit or keep a stop handle before any byte
//!   moves, then await the buffered result.

use std::sync::Arc;

use encsync_cache::{CacheError, Filelist};
use encsync_core::crypto::{decrypt_filename, decrypt_path, encrypt_path, Key, BLOCK_SIZE};
use encsync_core::domain::{path, Folder};
use encsync_core::ports::{BoxedReader, ChunkSink, Meta, Storage, StorageError, TransferController};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::buffer::{DecryptingSink, EncryptingSink, SpillBuffer};

fn cache_error(e: CacheError) -> StorageError {
    StorageError::Permanent(format!("filelist lookup failed: {e}"))
}

/// One child returned by [`FolderStorage::list_storage_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Metadata with the plaintext name
    pub meta: Meta,
    /// Name of the entry as stored by the backend
    pub storage_name: String,
    /// IV of this segment; empty on plaintext folders
    pub iv: Vec<u8>,
}

/// A download whose result is buffered
///
/// Configure [`PendingTransfer::controller`] first, then call
/// [`PendingTransfer::complete`].
pub struct PendingTransfer {
    controller: TransferController,
    done: oneshot::Receiver<SpillBuffer>,
}

impl std::fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl PendingTransfer {
    pub fn controller(&mut self) -> &mut TransferController {
        &mut self.controller
    }

    /// Runs the transfer and returns the buffered bytes.
    pub async fn complete(self) -> Result<SpillBuffer, StorageError> {
        self.controller.work().await?;
        self.done
            .await
            .map_err(|_| StorageError::Permanent("transfer finished without data".to_string()))
    }
}

/// Plaintext, folder-relative view of a folder
pub struct FolderStorage {
    storage: Arc<dyn Storage>,
    folder: Folder,
    master_key: Option<Key>,
    data_key: Option<Key>,
    filelist: Option<Filelist>,
}

impl std::fmt::Debug for FolderStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderStorage")
            .field("storage", &self.storage.name())
            .field("folder", &self.folder)
            .finish()
    }
}

impl FolderStorage {
    /// Binds `storage` to `folder`. Encrypted folders need the master key
    /// for names and the data key for contents.
    pub fn new(
        storage: Arc<dyn Storage>,
        folder: Folder,
        master_key: Option<Key>,
        data_key: Option<Key>,
    ) -> Result<Self, StorageError> {
        if folder.encrypted && (master_key.is_none() || data_key.is_none()) {
            return Err(StorageError::Permanent(format!(
                "folder {} is encrypted but no keys were provided",
                folder.name
            )));
        }
        Ok(Self {
            storage,
            folder,
            master_key,
            data_key,
            filelist: None,
        })
    }

    /// Uses `filelist` for IV lookups.
    #[must_use]
    pub fn with_filelist(mut self, filelist: Filelist) -> Self {
        self.filelist = Some(filelist);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn folder(&self) -> &Folder {
        &self.folder
    }

    pub fn encrypted(&self) -> bool {
        self.folder.encrypted
    }

    pub fn parallelizable(&self) -> bool {
        self.storage.parallelizable()
    }

    fn master_key(&self) -> Result<&Key, StorageError> {
        self.master_key
            .as_ref()
            .ok_or_else(|| StorageError::Permanent("missing master key".to_string()))
    }

    fn data_key(&self) -> Result<&Key, StorageError> {
        self.data_key
            .as_ref()
            .ok_or_else(|| StorageError::Permanent("missing data key".to_string()))
    }

    // ========================================================================
    // Path encoding
    // ========================================================================

    /// IVs already assigned to `rel` or to its closest recorded ancestor.
    async fn lookup_ivs(&self, rel: &str) -> Result<Vec<u8>, StorageError> {
        let Some(filelist) = &self.filelist else {
            return Ok(Vec::new());
        };
        let depth = path::depth(rel);
        if depth == 0 {
            return Ok(Vec::new());
        }
        let absolute = self.folder.absolute(rel);

        if let Some(node) = filelist.find_node(&absolute).await.map_err(cache_error)? {
            if node.ivs.len() == depth * BLOCK_SIZE {
                return Ok(node.ivs);
            }
        }

        let ancestor = filelist
            .find_closest_ancestor(&absolute)
            .await
            .map_err(cache_error)?;
        if let Some(node) = ancestor {
            if let Ok(ancestor_rel) = self.folder.relative(&node.path) {
                let ancestor_depth = path::depth(&ancestor_rel);
                if ancestor_depth < depth && node.ivs.len() == ancestor_depth * BLOCK_SIZE {
                    return Ok(node.ivs);
                }
            }
        }
        Ok(Vec::new())
    }

    /// Storage path and IVs of a folder-relative path.
    pub async fn encode_path(&self, rel: &str) -> Result<(String, Vec<u8>), StorageError> {
        let rel = rel.trim_start_matches(path::SEP);
        if !self.folder.encrypted {
            return Ok((self.folder.absolute(rel), Vec::new()));
        }
        let ivs = self.lookup_ivs(rel).await?;
        self.encode_with_ivs(rel, &ivs)
    }

    /// Storage path of `rel` using exactly the given IVs (random ones for
    /// the segments they do not cover).
    pub fn encode_with_ivs(&self, rel: &str, ivs: &[u8]) -> Result<(String, Vec<u8>), StorageError> {
        let rel = rel.trim_start_matches(path::SEP);
        if !self.folder.encrypted {
            return Ok((self.folder.absolute(rel), Vec::new()));
        }
        let (encrypted, used) = encrypt_path(
            rel,
            self.master_key()?,
            Some(ivs),
            self.folder.filename_encoding,
        )?;
        Ok((path::join(&self.folder.prefix, &encrypted), used))
    }

    /// Folder-relative plaintext path and IVs of a storage path.
    pub fn decode_path(&self, storage_path: &str) -> Result<(String, Vec<u8>), StorageError> {
        let rel = self
            .folder
            .relative(storage_path)
            .map_err(|e| StorageError::Permanent(e.to_string()))?;
        if !self.folder.encrypted {
            return Ok((rel, Vec::new()));
        }
        Ok(decrypt_path(
            &rel,
            self.master_key()?,
            self.folder.filename_encoding,
        )?)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub async fn get_meta(&self, rel: &str) -> Result<Meta, StorageError> {
        let (storage_path, _) = self.encode_path(rel).await?;
        let mut meta = self.storage.get_meta(&storage_path).await?;
        if self.folder.encrypted {
            meta.name = path::basename(rel).to_string();
        }
        Ok(meta)
    }

    pub async fn exists(&self, rel: &str) -> Result<bool, StorageError> {
        Ok(self.get_meta(rel).await?.exists())
    }

    /// Children of a storage directory with decrypted names.
    ///
    /// Names that fail to decrypt are skipped with a warning.
    pub async fn list_storage_dir(&self, storage_path: &str) -> Result<Vec<ListedEntry>, StorageError> {
        let children = self.storage.listdir(storage_path).await?;
        if !self.folder.encrypted {
            return Ok(children
                .into_iter()
                .map(|meta| ListedEntry {
                    storage_name: meta.name.clone(),
                    meta,
                    iv: Vec::new(),
                })
                .collect());
        }

        let key = self.master_key()?;
        let mut entries = Vec::with_capacity(children.len());
        for mut meta in children {
            match decrypt_filename(&meta.name, key, self.folder.filename_encoding) {
                Ok((name, iv)) => {
                    let storage_name = std::mem::replace(&mut meta.name, name);
                    entries.push(ListedEntry {
                        meta,
                        storage_name,
                        iv,
                    });
                }
                Err(e) => {
                    warn!(
                        folder = %self.folder.name,
                        dir = storage_path,
                        name = %meta.name,
                        error = %e,
                        "Skipping entry with undecryptable name"
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Children of a folder-relative directory with plaintext names.
    pub async fn listdir(&self, rel: &str) -> Result<Vec<Meta>, StorageError> {
        let (storage_path, _) = self.encode_path(rel).await?;
        Ok(self
            .list_storage_dir(&storage_path)
            .await?
            .into_iter()
            .map(|entry| entry.meta)
            .collect())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Creates a directory and returns its IVs.
    pub async fn mkdir(&self, rel: &str) -> Result<Vec<u8>, StorageError> {
        let (storage_path, ivs) = self.encode_path(rel).await?;
        self.storage.mkdir(&storage_path).await?;
        debug!(folder = %self.folder.name, path = rel, "Created directory");
        Ok(ivs)
    }

    pub async fn remove(&self, rel: &str) -> Result<(), StorageError> {
        let (storage_path, _) = self.encode_path(rel).await?;
        self.storage.remove(&storage_path).await
    }

    /// Removes the entry that `rel` encrypts to with exactly `ivs`.
    pub async fn remove_with_ivs(&self, rel: &str, ivs: &[u8]) -> Result<(), StorageError> {
        let (storage_path, _) = self.encode_with_ivs(rel, ivs)?;
        self.storage.remove(&storage_path).await
    }

    /// Prepares an upload of `size` bytes, already in the form the folder
    /// stores them, and returns the IVs of the target path.
    pub async fn upload(
        &self,
        reader: BoxedReader,
        size: u64,
        rel: &str,
    ) -> Result<(TransferController, Vec<u8>), StorageError> {
        let (storage_path, ivs) = self.encode_path(rel).await?;
        let controller = self.storage.upload(reader, size, &storage_path).await?;
        Ok((controller, ivs))
    }

    // ========================================================================
    // Readers
    // ========================================================================

    async fn download_into(
        &self,
        storage_path: &str,
        sink: Box<dyn ChunkSink>,
        done: oneshot::Receiver<SpillBuffer>,
    ) -> Result<PendingTransfer, StorageError> {
        let controller = self.storage.download(storage_path, sink).await?;
        Ok(PendingTransfer { controller, done })
    }

    async fn reader(&self, storage_path: &str, encrypted_output: bool) -> Result<PendingTransfer, StorageError> {
        let (sink, done) = SpillBuffer::new().into_sink();
        let sink: Box<dyn ChunkSink> = match (self.folder.encrypted, encrypted_output) {
            (true, false) => Box::new(DecryptingSink::new(sink, self.data_key()?)),
            (false, true) => {
                let meta = self.storage.get_meta(storage_path).await?;
                if !meta.is_file() {
                    return Err(StorageError::NotFound(storage_path.to_string()));
                }
                Box::new(EncryptingSink::new(sink, self.data_key()?, meta.size)?)
            }
            _ => Box::new(sink),
        };
        self.download_into(storage_path, sink, done).await
    }

    /// Plaintext contents of a file.
    pub async fn get_file(&self, rel: &str) -> Result<PendingTransfer, StorageError> {
        let (storage_path, _) = self.encode_path(rel).await?;
        self.reader(&storage_path, false).await
    }

    /// Contents of a file in the encrypted form.
    pub async fn get_encrypted_file(&self, rel: &str) -> Result<PendingTransfer, StorageError> {
        let (storage_path, _) = self.encode_path(rel).await?;
        self.reader(&storage_path, true).await
    }

    /// Like [`FolderStorage::get_file`] for a path whose IVs are known.
    pub async fn get_file_with_ivs(&self, rel: &str, ivs: &[u8]) -> Result<PendingTransfer, StorageError> {
        let (storage_path, _) = self.encode_with_ivs(rel, ivs)?;
        self.reader(&storage_path, false).await
    }

    /// Like [`FolderStorage::get_encrypted_file`] for a path whose IVs are
    /// known.
    pub async fn get_encrypted_file_with_ivs(
        &self,
        rel: &str,
        ivs: &[u8],
    ) -> Result<PendingTransfer, StorageError> {
        let (storage_path, _) = self.encode_with_ivs(rel, ivs)?;
        self.reader(&storage_path, true).await
    }
}
