//! Environment
//!
//! Builds the objects of a run from a [`Config`] and keeps one instance of
//! each shared resource:
//!
//! - one storage per configured storage name
//! - one filelist connection per folder, shared by the scanner, the
//!   synchronizer and the folder's [`FolderStorage`] IV lookups
//! - one duplist per storage
//! - one difflist for all targets
//!
//! Sharing matters because a CDB defers the statements of every other
//! connection while one connection holds a transaction.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use encsync_cache::{CdbOptions, CdbRegistry, DataDir, DiffSummary, Difflist, Duplist, Filelist};
use encsync_core::config::Config;
use encsync_core::crypto::Key;
use encsync_core::domain::{Folder, TargetSpec};
use encsync_core::ports::Storage;
use encsync_storage::{build_storage, FolderStorage};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::diff::DiffBuilder;
use crate::filter::PathFilter;
use crate::registry::TargetRegistry;
use crate::rmdup::DuplicateRemover;
use crate::scanner::{ScanReport, Scanner};
use crate::synchronizer::{SyncContext, SyncOptions, SyncSide, Synchronizer};

pub struct Environment {
    config: Config,
    cdb: Arc<CdbRegistry>,
    layout: DataDir,
    registry: Arc<TargetRegistry>,
    filter: Arc<PathFilter>,
    master_key: Option<Key>,
    data_key: Option<Key>,
    options: SyncOptions,
    storages: Mutex<HashMap<String, Arc<dyn Storage>>>,
    folders: Mutex<HashMap<String, SyncSide>>,
    duplists: Mutex<HashMap<String, Duplist>>,
    difflist: OnceCell<Difflist>,
}

impl Environment {
    /// Prepares the data directory and the keys. Keys are required only
    /// when some folder is encrypted.
    pub fn new(config: Config) -> Result<Self> {
        let layout = DataDir::new(&config.data_dir);
        layout
            .ensure()
            .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

        let (master_key, data_key) = if config.uses_encryption() {
            (
                Some(config.master_key().context("Encrypted folders need a master key")?),
                Some(config.data_key().context("Encrypted folders need a data key")?),
            )
        } else {
            (config.master_key().ok(), config.data_key().ok())
        };
        let filter = PathFilter::new(&config.include_exclude).context("Invalid include/exclude rules")?;

        Ok(Self {
            cdb: Arc::new(CdbRegistry::new(CdbOptions::from(&config.database))),
            layout,
            registry: Arc::new(TargetRegistry::default()),
            filter: Arc::new(filter),
            master_key,
            data_key,
            options: SyncOptions::from_config(&config),
            config,
            storages: Mutex::new(HashMap::new()),
            folders: Mutex::new(HashMap::new()),
            duplists: Mutex::new(HashMap::new()),
            difflist: OnceCell::new(),
        })
    }

    /// Uses `storage` instead of building the configured one.
    #[must_use]
    pub fn with_storage(mut self, name: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        self.storages.get_mut().insert(name.into(), storage);
        self
    }

    /// Replaces the run options derived from the config.
    #[must_use]
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &DataDir {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Token cancelling every scan and target of this environment.
    pub fn root_token(&self) -> &CancellationToken {
        self.registry.root()
    }

    // ========================================================================
    // Shared resources
    // ========================================================================

    pub async fn storage(&self, name: &str) -> Result<Arc<dyn Storage>> {
        let mut storages = self.storages.lock().await;
        if let Some(storage) = storages.get(name) {
            return Ok(Arc::clone(storage));
        }
        let storage_config = self.config.storage(name)?;
        let storage = build_storage(name, storage_config, &self.config)
            .await
            .with_context(|| format!("Failed to open storage {name}"))?;
        storages.insert(name.to_string(), Arc::clone(&storage));
        Ok(storage)
    }

    pub async fn duplist(&self, storage_name: &str) -> Result<Duplist> {
        let mut duplists = self.duplists.lock().await;
        if let Some(duplist) = duplists.get(storage_name) {
            return Ok(duplist.clone());
        }
        let duplist = Duplist::open(&self.cdb, &self.layout, storage_name)
            .await
            .with_context(|| format!("Failed to open duplist of {storage_name}"))?;
        duplists.insert(storage_name.to_string(), duplist.clone());
        Ok(duplist)
    }

    pub async fn difflist(&self) -> Result<Difflist> {
        let difflist = self
            .difflist
            .get_or_try_init(|| Difflist::open(&self.cdb, &self.layout))
            .await
            .context("Failed to open difflist")?;
        Ok(difflist.clone())
    }

    /// A folder with its storage view and inventories.
    pub async fn side(&self, folder_name: &str) -> Result<SyncSide> {
        let mut folders = self.folders.lock().await;
        if let Some(side) = folders.get(folder_name) {
            return Ok(side.clone());
        }

        let folder = self.config.folder(folder_name)?;
        let storage = self.storage(&folder.storage_name).await?;
        let filelist = Filelist::open(&self.cdb, &self.layout, &folder.name, &folder.storage_name)
            .await
            .with_context(|| format!("Failed to open filelist of {folder_name}"))?;
        let duplist = self.duplist(&folder.storage_name).await?;
        let folder_storage = FolderStorage::new(
            storage,
            folder,
            self.master_key.clone(),
            self.data_key.clone(),
        )?
        .with_filelist(filelist.clone());

        let side = SyncSide::new(Arc::new(folder_storage), filelist, Some(duplist));
        debug!(folder = folder_name, "Opened folder");
        folders.insert(folder_name.to_string(), side.clone());
        Ok(side)
    }

    pub async fn folder_storage(&self, folder_name: &str) -> Result<Arc<FolderStorage>> {
        Ok(self.side(folder_name).await?.folder)
    }

    pub async fn filelist(&self, folder_name: &str) -> Result<Filelist> {
        Ok(self.side(folder_name).await?.filelist)
    }

    // ========================================================================
    // Workers
    // ========================================================================

    pub fn scanner(&self) -> Scanner {
        Scanner::new(
            self.options.scan_threads,
            (*self.filter).clone(),
            self.registry.root().child_token(),
        )
    }

    /// Scans the folders in order.
    pub async fn scan_folders(&self, names: &[String]) -> Result<Vec<ScanReport>> {
        let mut scanner = self.scanner();
        for name in names {
            let side = self.side(name).await?;
            scanner.add_target(crate::scanner::ScanTarget::new(
                side.folder,
                side.filelist,
                side.duplist,
            ));
        }
        Ok(scanner.run().await)
    }

    /// Rebuilds the difflist of a target from the current filelists.
    pub async fn build_diff(&self, spec: &TargetSpec) -> Result<DiffSummary> {
        let src = self.side(&spec.src.name).await?;
        let dst = self.side(&spec.dst.name).await?;
        let difflist = self.difflist().await?;
        let builder = DiffBuilder {
            src: &spec.src,
            dst: &spec.dst,
            src_filelist: &src.filelist,
            dst_filelist: &dst.filelist,
            dst_duplist: dst.duplist.as_ref(),
            filter: self.filter.as_ref(),
        };
        Ok(builder.build(&difflist).await?)
    }

    pub async fn duplicate_remover(&self, folder_name: &str) -> Result<DuplicateRemover> {
        let side = self.side(folder_name).await?;
        let folder: &Folder = side.folder.folder();
        let duplist = self.duplist(&folder.storage_name).await?;
        Ok(DuplicateRemover::new(
            Arc::clone(&side.folder),
            duplist,
            Arc::clone(&self.cdb),
            self.layout.clone(),
            self.options.sync_threads,
            self.registry.root().child_token(),
        ))
    }

    /// Resolves a configured target.
    pub fn target(&self, name: &str) -> Result<TargetSpec> {
        Ok(self.config.target(name)?)
    }

    /// Prepares a run of `spec`. The target is registered right away, so
    /// its token is stopped by [`TargetRegistry::stop_all`] from then on.
    pub async fn synchronizer(&self, spec: TargetSpec) -> Result<Synchronizer> {
        let src = self.side(&spec.src.name).await?;
        let dst = self.side(&spec.dst.name).await?;
        let ctx = SyncContext {
            registry: Arc::clone(&self.registry),
            cdb: Arc::clone(&self.cdb),
            layout: self.layout.clone(),
            difflist: self.difflist().await?,
            filter: Arc::clone(&self.filter),
            options: self.options.clone(),
        };
        info!(target_name = %spec.name, src = %spec.src.name, dst = %spec.dst.name, "Prepared target");
        Ok(Synchronizer::new(spec, src, dst, ctx))
    }
}
