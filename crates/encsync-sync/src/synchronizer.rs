//! Staged synchronizer
//!
//! A [`Synchronizer`] makes the destination folder of one target mirror its
//! source folder. It runs six stages in order:
//!
//! 1. `scan`: refreshes both filelists and rebuilds the target's difflist
//! 2. `rmdup`: removes duplicate ciphertexts on each encrypted side
//! 3. `rm`: removes destination entries the source no longer has
//! 4. `dirs`: creates missing destination directories, parents first
//! 5. `files`: uploads new and changed files through a task pool
//! 6. `check`: rescans the destination and fails if anything still differs
//!
//! ## Design Decisions
//!
//! - **Stages share inventories**: the filelist a stage writes is the one the
//!   destination [`FolderStorage`] reads IVs from, so paths created by the
//!   `dirs` stage are reused by the `files` stage.
//! - **One transaction per stage**: `rm`, `dirs` and `files` write the
//!   destination filelist inside a transaction that is committed seamlessly
//!   every autocommit interval. A stop rolls the open part back; the next
//!   run rescans and plans again.
//! - **Difflist rows are the progress record**: a task deletes its row once
//!   the storage and the filelist agree, so an interrupted run resumes from
//!   the rows that remain.
//! - **Whole-transfer retries**: a transfer consumes its reader, so a
//!   transient failure restarts the whole copy after the upload backoff.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use encsync_cache::{CacheError, CdbRegistry, DataDir, DiffSummary, Difflist, Duplist, Filelist};
use encsync_core::config::Config;
use encsync_core::crypto::{padded_size, padded_size_of_encrypted};
use encsync_core::domain::{path, DiffType, Difference, Node, NodeType, StatusCounts, TargetSpec, TaskStatus};
use encsync_core::ports::StorageError;
use encsync_storage::{FolderStorage, RetryPolicy};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::diff::DiffBuilder;
use crate::filter::PathFilter;
use crate::registry::{StageReporter, TargetId, TargetRegistry};
use crate::rmdup::DuplicateRemover;
use crate::scanner::{ScanTarget, Scanner, SCANNER_EVENTS};
use crate::worker::{cursor_stream, run_pool, run_stages, run_worker, StagedWorker, Worker};
use crate::SyncError;

// ============================================================================
// Stages and reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scan,
    Rmdup,
    Rm,
    Dirs,
    Files,
    Check,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Scan,
        Stage::Rmdup,
        Stage::Rm,
        Stage::Dirs,
        Stage::Files,
        Stage::Check,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Rmdup => "rmdup",
            Stage::Rm => "rm",
            Stage::Dirs => "dirs",
            Stage::Files => "files",
            Stage::Check => "check",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: TaskStatus,
    pub counts: StatusCounts,
}

/// Outcome of one synchronizer run
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub status: TaskStatus,
    pub stages: Vec<StageReport>,
    /// Differences planned by the scan stage
    pub summary: DiffSummary,
}

impl TargetReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

// ============================================================================
// Options and wiring
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sync_threads: usize,
    pub scan_threads: usize,
    /// Attempts per transfer; 0 behaves like 1
    pub n_retries: u32,
    pub upload_backoff: Duration,
    pub autocommit_interval: Duration,
    /// Bytes per second, overridden by the target flags
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        let policy = RetryPolicy::from_config(config);
        Self {
            sync_threads: config.sync_threads.max(1) as usize,
            scan_threads: config.scan_threads.max(1) as usize,
            n_retries: config.n_retries,
            upload_backoff: policy.upload_backoff,
            autocommit_interval: Duration::from_secs(config.database.autocommit_interval),
            upload_limit: config.upload_limit,
            download_limit: config.download_limit,
        }
    }

    fn attempts(&self) -> u32 {
        self.n_retries.max(1)
    }
}

/// One folder of a target with its inventories
#[derive(Debug, Clone)]
pub struct SyncSide {
    pub folder: Arc<FolderStorage>,
    pub filelist: Filelist,
    /// Duplist of the folder's storage
    pub duplist: Option<Duplist>,
}

impl SyncSide {
    pub fn new(folder: Arc<FolderStorage>, filelist: Filelist, duplist: Option<Duplist>) -> Self {
        Self {
            folder,
            filelist,
            duplist,
        }
    }

    fn scan_target(&self) -> ScanTarget {
        ScanTarget::new(
            Arc::clone(&self.folder),
            self.filelist.clone(),
            self.duplist.clone(),
        )
    }
}

/// Shared services a synchronizer runs against
#[derive(Clone)]
pub struct SyncContext {
    pub registry: Arc<TargetRegistry>,
    pub cdb: Arc<CdbRegistry>,
    pub layout: DataDir,
    pub difflist: Difflist,
    pub filter: Arc<PathFilter>,
    pub options: SyncOptions,
}

/// Commits a stage transaction seamlessly once per interval
struct Autocommit {
    interval: Duration,
    last: Mutex<Instant>,
}

impl Autocommit {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(Instant::now()),
        }
    }

    async fn tick(&self, filelist: &Filelist) -> Result<(), CacheError> {
        let due = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() >= self.interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            filelist.seamless_commit().await?;
            debug!("Autocommitted filelist");
        }
        Ok(())
    }
}

enum CopyOutcome {
    Copied(Node),
    SourceMissing,
}

// ============================================================================
// Synchronizer
// ============================================================================

pub struct Synchronizer {
    spec: TargetSpec,
    src: SyncSide,
    dst: SyncSide,
    ctx: SyncContext,
    id: TargetId,
    token: CancellationToken,
    summary: DiffSummary,
    stages: Vec<StageReport>,
}

impl Synchronizer {
    /// Registers the target and prepares a run. The run stops when the
    /// registry's token for the target is cancelled.
    pub fn new(spec: TargetSpec, src: SyncSide, dst: SyncSide, ctx: SyncContext) -> Self {
        let id = ctx.registry.register(&spec);
        let token = ctx.registry.token(id);
        Self {
            spec,
            src,
            dst,
            ctx,
            id,
            token,
            summary: DiffSummary::default(),
            stages: Vec::new(),
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn spec(&self) -> &TargetSpec {
        &self.spec
    }

    pub fn summary(&self) -> DiffSummary {
        self.summary
    }

    /// Runs every stage and returns the outcome.
    #[instrument(skip(self), fields(target_name = %self.spec.name))]
    pub async fn run(&mut self) -> TargetReport {
        self.stages.clear();
        self.summary = DiffSummary::default();
        self.ctx.registry.set_status(self.id, TaskStatus::Pending);
        let status = run_worker(self).await;
        self.ctx.registry.set_status(self.id, status);
        info!(status = %status, "Target done");

        TargetReport {
            target: self.spec.name.clone(),
            status,
            stages: self.stages.clone(),
            summary: self.summary,
        }
    }

    fn reporter(&self, stage: Stage) -> StageReporter {
        StageReporter::new(Arc::clone(&self.ctx.registry), self.id, stage.as_str())
    }

    fn pool_threads(&self) -> usize {
        if self.dst.folder.parallelizable() {
            self.ctx.options.sync_threads
        } else {
            1
        }
    }

    fn upload_limit(&self) -> Option<u64> {
        self.spec.flags.upload_limit.or(self.ctx.options.upload_limit)
    }

    fn download_limit(&self) -> Option<u64> {
        self.spec.flags.download_limit.or(self.ctx.options.download_limit)
    }

    /// Without fresh inventories the difflist cannot be trusted.
    fn scan_failed(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.stage == Stage::Scan && s.status == TaskStatus::Failed)
    }

    fn failed_before(&self) -> bool {
        self.stages.iter().any(|s| s.status == TaskStatus::Failed)
    }

    fn differences(&self, types: &[DiffType], node_type: Option<NodeType>) -> encsync_cache::Cursor<Difference> {
        self.ctx
            .difflist
            .select(&self.spec.src.name, &self.spec.dst.name, types, node_type)
    }

    async fn remove_row(&self, difference: &Difference) -> Result<(), CacheError> {
        if let Some(id) = difference.id {
            self.ctx.difflist.remove(id).await?;
        }
        Ok(())
    }

    /// Commits or rolls back the destination filelist after a stage body.
    async fn close_stage(
        &self,
        stage: Stage,
        outcome: Result<StatusCounts, SyncError>,
    ) -> Result<TaskStatus, SyncError> {
        let filelist = &self.dst.filelist;
        let keep = outcome.is_ok() && !self.token.is_cancelled();
        if keep {
            filelist.commit().await?;
        } else if let Err(e) = filelist.rollback().await {
            warn!(stage = %stage, error = %e, "Filelist rollback failed");
        }

        let counts = outcome?;
        debug!(
            stage = %stage,
            total = counts.total,
            finished = counts.finished,
            failed = counts.failed,
            skipped = counts.skipped,
            "Stage tasks done"
        );
        Ok(self.stage_status(&counts))
    }

    fn stage_status(&self, counts: &StatusCounts) -> TaskStatus {
        if self.token.is_cancelled() {
            return TaskStatus::Suspended;
        }
        if counts.total == 0 {
            return TaskStatus::Finished;
        }
        match counts.aggregate() {
            TaskStatus::Pending => TaskStatus::Failed,
            status => status,
        }
    }

    // ========================================================================
    // scan
    // ========================================================================

    async fn scan_stage(&mut self) -> Result<TaskStatus, SyncError> {
        let reporter = self.reporter(Stage::Scan);
        let scanner = self.scanner();

        let mut scanned = 0;
        if self.spec.flags.enable_scan {
            let sides = [
                (&self.src, self.spec.avoid_src_rescan()),
                (&self.dst, self.spec.avoid_dst_rescan()),
            ];
            for (side, avoid_rescan) in sides {
                let folder = side.folder.folder();
                if avoid_rescan && side.filelist.has_nodes_under(&folder.prefix).await? {
                    debug!(folder = %folder.name, "Reusing filelist without rescan");
                    continue;
                }
                let report = scanner.scan(&side.scan_target()).await;
                reporter.task(&folder.name, report.status);
                scanned += 1;
                match report.status {
                    TaskStatus::Finished => {}
                    TaskStatus::Suspended => return Ok(TaskStatus::Suspended),
                    _ => {
                        let message = report.error.unwrap_or_else(|| "scan failed".to_string());
                        reporter.error(&folder.name, &message);
                        return Ok(TaskStatus::Failed);
                    }
                }
            }
        }

        self.summary = self.build_diff().await?;
        info!(
            scanned,
            new = self.summary.new,
            update = self.summary.update,
            rm = self.summary.rm,
            rmdup = self.summary.rmdup,
            "Planned differences"
        );
        if scanned == 0 && !self.spec.flags.enable_scan {
            return Ok(TaskStatus::Skipped);
        }
        Ok(TaskStatus::Finished)
    }

    /// A scanner whose duplicate reports reach the target registry.
    fn scanner(&self) -> Scanner {
        let scanner = Scanner::new(
            self.ctx.options.scan_threads,
            (*self.ctx.filter).clone(),
            self.token.child_token(),
        )
        .with_emitter(encsync_core::events::Emitter::new(
            format!("scanner:{}", self.spec.name),
            SCANNER_EVENTS.iter().copied(),
        ));
        let forward = self.ctx.registry.emitter().clone();
        let target = self.spec.name.clone();
        let subscribed = scanner.emitter().subscribe("duplicates_found", move |event| {
            let mut args = event.args.clone();
            if let Some(map) = args.as_object_mut() {
                map.insert("target".to_string(), target.clone().into());
            }
            forward.emit("duplicates_found", args);
            true
        });
        if let Err(e) = subscribed {
            warn!(error = %e, "Could not forward duplicate reports");
        }
        scanner
    }

    async fn build_diff(&self) -> Result<DiffSummary, SyncError> {
        let builder = DiffBuilder {
            src: &self.spec.src,
            dst: &self.spec.dst,
            src_filelist: &self.src.filelist,
            dst_filelist: &self.dst.filelist,
            dst_duplist: self.dst.duplist.as_ref(),
            filter: self.ctx.filter.as_ref(),
        };
        builder.build(&self.ctx.difflist).await
    }

    // ========================================================================
    // rmdup
    // ========================================================================

    async fn rmdup_stage(&self) -> Result<TaskStatus, SyncError> {
        let mut counts = StatusCounts::default();
        for side in [&self.src, &self.dst] {
            let Some(duplist) = &side.duplist else {
                continue;
            };
            if !side.folder.encrypted() {
                continue;
            }
            let remover = DuplicateRemover::new(
                Arc::clone(&side.folder),
                duplist.clone(),
                Arc::clone(&self.ctx.cdb),
                self.ctx.layout.clone(),
                self.ctx.options.sync_threads,
                self.token.child_token(),
            )
            .with_reporter(self.reporter(Stage::Rmdup));
            counts.merge(&remover.run().await?);
        }

        // Remaining duplicates are found again by the next scan.
        if !self.token.is_cancelled() {
            let mut rows = self.differences(&[DiffType::Rmdup], None);
            while let Some(difference) = rows.next().await? {
                self.remove_row(&difference).await?;
            }
        }
        Ok(self.stage_status(&counts))
    }

    // ========================================================================
    // rm
    // ========================================================================

    async fn rm_stage(&self) -> Result<TaskStatus, SyncError> {
        if self.spec.flags.no_remove {
            info!("Removal disabled for this run");
            return Ok(TaskStatus::Skipped);
        }

        let reporter = self.reporter(Stage::Rm);
        let autocommit = Autocommit::new(self.ctx.options.autocommit_interval);
        self.dst.filelist.begin().await?;
        let tasks = cursor_stream(self.differences(&[DiffType::Rm], None));
        let outcome = run_pool(tasks, self.pool_threads(), &self.token, |difference| {
            self.rm_task(difference, &reporter, &autocommit)
        })
        .await;
        let status = self.close_stage(Stage::Rm, outcome).await?;
        self.dst.filelist.clear_deleted().await?;
        Ok(status)
    }

    async fn rm_task(
        &self,
        difference: Difference,
        reporter: &StageReporter,
        autocommit: &Autocommit,
    ) -> TaskStatus {
        let status = self.try_rm(&difference, reporter, autocommit).await;
        reporter.task(&difference.path, status);
        status
    }

    async fn try_rm(
        &self,
        difference: &Difference,
        reporter: &StageReporter,
        autocommit: &Autocommit,
    ) -> TaskStatus {
        if self.token.is_cancelled() {
            return TaskStatus::Suspended;
        }
        let rel = &difference.path;
        match self.dst.folder.remove_with_ivs(rel, &difference.ivs).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(path = %rel, "Already removed"),
            Err(e) if e.is_interrupted() => return TaskStatus::Suspended,
            Err(e) => {
                reporter.error(rel, &e);
                return TaskStatus::Failed;
            }
        }

        let abs = self.spec.dst.absolute(rel);
        let recorded = async {
            if difference.node_type == NodeType::Dir {
                self.dst.filelist.remove_node_children(&abs).await?;
            }
            self.dst.filelist.remove_node(&abs).await?;
            self.remove_row(difference).await?;
            autocommit.tick(&self.dst.filelist).await
        }
        .await;
        match recorded {
            Ok(()) => {
                debug!(path = %rel, "Removed");
                TaskStatus::Finished
            }
            Err(e) => {
                reporter.error(rel, &e);
                TaskStatus::Failed
            }
        }
    }

    // ========================================================================
    // dirs
    // ========================================================================

    /// Creates directories one at a time so parents exist before children.
    async fn dirs_stage(&self) -> Result<TaskStatus, SyncError> {
        let reporter = self.reporter(Stage::Dirs);
        let autocommit = Autocommit::new(self.ctx.options.autocommit_interval);
        self.dst.filelist.begin().await?;
        let outcome = match self.ensure_root().await {
            Ok(()) => self.create_dirs(&reporter, &autocommit).await,
            Err(e) => Err(e),
        };
        self.close_stage(Stage::Dirs, outcome).await
    }

    /// Creates the destination root and its missing ancestors.
    async fn ensure_root(&self) -> Result<(), SyncError> {
        let prefix = &self.spec.dst.prefix;
        if self.dst.filelist.find_node(prefix).await?.is_some() {
            return Ok(());
        }
        let storage = self.dst.folder.storage();
        let mut current = String::new();
        for segment in prefix.split(path::SEP).filter(|s| !s.is_empty()) {
            current = format!("{current}{}{segment}", path::SEP);
            match storage.mkdir(&current).await {
                Ok(()) => debug!(path = %current, "Created destination root"),
                Err(StorageError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.dst
            .filelist
            .insert_node(&Node::dir(prefix, Utc::now(), Vec::new()))
            .await?;
        Ok(())
    }

    async fn create_dirs(
        &self,
        reporter: &StageReporter,
        autocommit: &Autocommit,
    ) -> Result<StatusCounts, SyncError> {
        let mut counts = StatusCounts::default();
        let mut rows = self.differences(&[DiffType::New], Some(NodeType::Dir));
        while let Some(difference) = rows.next().await? {
            if self.token.is_cancelled() {
                break;
            }
            let status = self.try_mkdir(&difference, reporter, autocommit).await;
            reporter.task(&difference.path, status);
            counts.total += 1;
            counts.record(status);
            if status == TaskStatus::Suspended {
                break;
            }
        }
        Ok(counts)
    }

    async fn try_mkdir(
        &self,
        difference: &Difference,
        reporter: &StageReporter,
        autocommit: &Autocommit,
    ) -> TaskStatus {
        let rel = &difference.path;
        let created = async {
            let (storage_path, ivs) = self.dst.folder.encode_path(rel).await?;
            match self.dst.folder.storage().mkdir(&storage_path).await {
                Ok(()) => {}
                Err(StorageError::AlreadyExists(_)) => debug!(path = %rel, "Directory exists"),
                Err(e) => return Err(e),
            }
            Ok::<_, StorageError>(ivs)
        }
        .await;
        let ivs = match created {
            Ok(ivs) => ivs,
            Err(e) if e.is_interrupted() => return TaskStatus::Suspended,
            Err(e) => {
                reporter.error(rel, &e);
                return TaskStatus::Failed;
            }
        };

        let node = Node::dir(self.spec.dst.absolute(rel), Utc::now(), ivs);
        let recorded = async {
            self.dst.filelist.insert_node(&node).await?;
            self.remove_row(difference).await?;
            autocommit.tick(&self.dst.filelist).await
        }
        .await;
        match recorded {
            Ok(()) => {
                debug!(path = %rel, "Created directory");
                TaskStatus::Finished
            }
            Err(e) => {
                reporter.error(rel, &e);
                TaskStatus::Failed
            }
        }
    }

    // ========================================================================
    // files
    // ========================================================================

    async fn files_stage(&self) -> Result<TaskStatus, SyncError> {
        let reporter = self.reporter(Stage::Files);
        let autocommit = Autocommit::new(self.ctx.options.autocommit_interval);
        self.dst.filelist.begin().await?;
        let tasks = cursor_stream(self.differences(&[DiffType::New, DiffType::Update], Some(NodeType::File)));
        let outcome = run_pool(tasks, self.pool_threads(), &self.token, |difference| {
            self.file_task(difference, &reporter, &autocommit)
        })
        .await;
        self.close_stage(Stage::Files, outcome).await
    }

    async fn file_task(
        &self,
        difference: Difference,
        reporter: &StageReporter,
        autocommit: &Autocommit,
    ) -> TaskStatus {
        let status = self.try_file(&difference, reporter, autocommit).await;
        reporter.task(&difference.path, status);
        status
    }

    async fn try_file(
        &self,
        difference: &Difference,
        reporter: &StageReporter,
        autocommit: &Autocommit,
    ) -> TaskStatus {
        if self.token.is_cancelled() {
            return TaskStatus::Suspended;
        }
        let rel = &difference.path;
        let src_abs = self.spec.src.absolute(rel);
        let source = match self.src.filelist.find_node(&src_abs).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(path = %rel, "Source left the filelist");
                if let Err(e) = self.remove_row(difference).await {
                    warn!(path = %rel, error = %e, "Could not drop difference");
                }
                return TaskStatus::Skipped;
            }
            Err(e) => {
                reporter.error(rel, &e);
                return TaskStatus::Failed;
            }
        };

        let mut attempt = 1;
        let node = loop {
            match self.copy_file(difference, &source).await {
                Ok(CopyOutcome::Copied(node)) => break node,
                Ok(CopyOutcome::SourceMissing) => {
                    info!(path = %rel, "Source vanished before upload");
                    let forgotten = async {
                        self.src.filelist.remove_node(&src_abs).await?;
                        self.remove_row(difference).await
                    }
                    .await;
                    if let Err(e) = forgotten {
                        warn!(path = %rel, error = %e, "Could not forget vanished source");
                    }
                    return TaskStatus::Skipped;
                }
                Err(e) if e.is_interrupted() => return TaskStatus::Suspended,
                Err(e) if e.is_transient() && attempt < self.ctx.options.attempts() => {
                    warn!(path = %rel, attempt, error = %e, "Transfer failed, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = self.token.cancelled() => return TaskStatus::Suspended,
                        _ = tokio::time::sleep(self.ctx.options.upload_backoff) => {}
                    }
                }
                Err(e) => {
                    reporter.error(rel, &e);
                    return TaskStatus::Failed;
                }
            }
        };

        let recorded = async {
            self.dst.filelist.insert_node(&node).await?;
            self.remove_row(difference).await?;
            autocommit.tick(&self.dst.filelist).await
        }
        .await;
        match recorded {
            Ok(()) => {
                debug!(path = %rel, size = node.padded_size, "Uploaded");
                TaskStatus::Finished
            }
            Err(e) => {
                reporter.error(rel, &e);
                TaskStatus::Failed
            }
        }
    }

    /// Reads the source file in the form the destination stores and uploads
    /// it. A missing source is reported separately from other failures.
    async fn copy_file(&self, difference: &Difference, source: &Node) -> Result<CopyOutcome, StorageError> {
        let rel = &difference.path;
        let encrypted_output = self.dst.folder.encrypted();
        let reading = if encrypted_output {
            self.src.folder.get_encrypted_file_with_ivs(rel, &difference.ivs).await
        } else {
            self.src.folder.get_file_with_ivs(rel, &difference.ivs).await
        };
        let mut pending = match reading {
            Ok(pending) => pending,
            Err(e) if e.is_not_found() => return Ok(CopyOutcome::SourceMissing),
            Err(e) => return Err(e),
        };
        pending.controller().set_limit(self.download_limit());
        pending.controller().link(&self.token);
        let buffer = match pending.complete().await {
            Ok(buffer) => buffer,
            Err(e) if e.is_not_found() => return Ok(CopyOutcome::SourceMissing),
            Err(e) => return Err(e),
        };

        let size = buffer.len();
        let reader = buffer
            .into_reader()
            .await
            .map_err(|e| StorageError::from_io(e, rel))?;
        let (mut controller, ivs) = self.dst.folder.upload(reader, size, rel).await?;
        controller.set_limit(self.upload_limit());
        controller.link(&self.token);
        controller.work().await?;

        let padded = if encrypted_output {
            padded_size_of_encrypted(size)
        } else {
            padded_size(size)
        };
        Ok(CopyOutcome::Copied(Node::file(
            self.spec.dst.absolute(rel),
            source.modified,
            padded,
            ivs,
        )))
    }

    // ========================================================================
    // check
    // ========================================================================

    async fn check_stage(&mut self) -> Result<TaskStatus, SyncError> {
        if self.spec.flags.skip_integrity_check {
            return Ok(TaskStatus::Skipped);
        }
        if self.failed_before() {
            info!("Integrity check skipped after a failed stage");
            return Ok(TaskStatus::Skipped);
        }

        let reporter = self.reporter(Stage::Check);
        let report = self.scanner().scan(&self.dst.scan_target()).await;
        match report.status {
            TaskStatus::Finished => {}
            TaskStatus::Suspended => return Ok(TaskStatus::Suspended),
            _ => {
                let message = report.error.unwrap_or_else(|| "rescan failed".to_string());
                reporter.error(&self.spec.dst.name, &message);
                return Ok(TaskStatus::Failed);
            }
        }

        let remaining = self.build_diff().await?;
        let mut left = remaining.total();
        if self.spec.flags.no_remove {
            left -= remaining.rm;
        }
        if left > 0 {
            let error = SyncError::Integrity(left);
            reporter.error(&self.spec.dst.name, &error);
            warn!(
                new = remaining.new,
                update = remaining.update,
                rm = remaining.rm,
                rmdup = remaining.rmdup,
                "Destination differs after sync"
            );
            return Ok(TaskStatus::Failed);
        }
        info!("Integrity check passed");
        Ok(TaskStatus::Finished)
    }
}

// ============================================================================
// Worker implementation
// ============================================================================

#[async_trait]
impl Worker for Synchronizer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn stopper(&self) -> &CancellationToken {
        &self.token
    }

    async fn work(&mut self) -> Result<TaskStatus, SyncError> {
        let done = run_stages(self).await?;
        let mut counts = StatusCounts::default();
        for (_, status) in &done {
            counts.total += 1;
            counts.record(*status);
        }
        if self.token.is_cancelled() && counts.suspended == 0 && done.len() < Stage::ALL.len() {
            return Ok(TaskStatus::Suspended);
        }
        Ok(match counts.aggregate() {
            TaskStatus::Pending => TaskStatus::Failed,
            status => status,
        })
    }

    async fn after_work(&mut self, status: TaskStatus) {
        if status != TaskStatus::Finished {
            return;
        }
        match self
            .ctx
            .difflist
            .clear_target(&self.spec.src.name, &self.spec.dst.name)
            .await
        {
            Ok(removed) if removed > 0 => debug!(removed, "Cleared leftover differences"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not clear differences"),
        }
    }
}

#[async_trait]
impl StagedWorker for Synchronizer {
    type Stage = Stage;

    fn stages(&self) -> Vec<Stage> {
        Stage::ALL.to_vec()
    }

    async fn on_enter(&mut self, stage: Stage) -> Result<(), SyncError> {
        info!(stage = %stage, "Stage started");
        self.ctx
            .registry
            .set_stage_status(self.id, stage.as_str(), TaskStatus::Pending, None);
        Ok(())
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<TaskStatus, SyncError> {
        if stage != Stage::Scan && self.scan_failed() {
            return Ok(TaskStatus::Skipped);
        }
        match stage {
            Stage::Scan => self.scan_stage().await,
            Stage::Rmdup => self.rmdup_stage().await,
            Stage::Rm => self.rm_stage().await,
            Stage::Dirs => self.dirs_stage().await,
            Stage::Files => self.files_stage().await,
            Stage::Check => self.check_stage().await,
        }
    }

    async fn on_exit(&mut self, stage: Stage, status: TaskStatus) -> Result<(), SyncError> {
        self.ctx
            .registry
            .set_stage_status(self.id, stage.as_str(), status, None);
        let counts = self
            .ctx
            .registry
            .snapshot(self.id)
            .and_then(|snapshot| {
                snapshot
                    .stages
                    .into_iter()
                    .find(|s| s.name == stage.as_str())
                    .map(|s| s.counts)
            })
            .unwrap_or_default();
        info!(stage = %stage, status = %status, done = counts.done(), total = counts.total, "Stage done");
        self.stages.push(StageReport {
            stage,
            status,
            counts,
        });
        Ok(())
    }
}
