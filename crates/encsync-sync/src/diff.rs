//! Diff engine
//!
//! Merges the sorted source and destination inventories of a target into a
//! plan of [`Difference`]s. Paths are folder-relative, so the folders of a
//! target may have different prefixes.
//!
//! | Condition                                   | Emits                 |
//! |---------------------------------------------|-----------------------|
//! | only in source (and included by the filter) | `new`                 |
//! | only in destination                         | `rm`                  |
//! | both, different kinds                       | `rm` then `new`       |
//! | both files, newer or different padded size  | `update`              |
//!
//! Once an `rm` of a directory has been emitted, `rm`s of anything below it
//! are dropped. Duplicates recorded for an encrypted destination follow the
//! merge as `rmdup` differences.
//!
//! `new` and `update` differences carry the source IVs (needed to read an
//! encrypted source); `rm` and `rmdup` carry the destination IVs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encsync_cache::{DiffSummary, Difflist, Duplist, Filelist, NodeCursor};
use encsync_core::domain::{path, DiffType, Difference, Folder, Node, NodeType};
use tracing::{debug, info, warn};

use crate::filter::PathFilter;
use crate::SyncError;

// ============================================================================
// Merge inputs and outputs
// ============================================================================

/// An inventory entry as seen by the merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub node_type: NodeType,
    /// Folder-relative; directories end in `/`
    pub path: String,
    pub modified: DateTime<Utc>,
    pub padded_size: u64,
    pub ivs: Vec<u8>,
}

impl DiffEntry {
    /// Entry of a filelist node, `None` for the folder root.
    pub fn from_node(node: Node, folder: &Folder) -> Result<Option<Self>, SyncError> {
        let rel = folder.relative(&node.path)?;
        if rel.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            node_type: node.node_type,
            path: rel,
            modified: node.modified,
            padded_size: node.padded_size,
            ivs: node.ivs,
        }))
    }
}

/// Sorted stream of inventory entries
#[async_trait]
pub trait NodeSource: Send {
    async fn next_entry(&mut self) -> Result<Option<DiffEntry>, SyncError>;
}

#[async_trait]
impl NodeSource for std::vec::IntoIter<DiffEntry> {
    async fn next_entry(&mut self) -> Result<Option<DiffEntry>, SyncError> {
        Ok(self.next())
    }
}

/// The nodes of a filelist, in path order, relative to their folder
pub struct FilelistSource {
    cursor: NodeCursor,
    folder: Folder,
}

impl FilelistSource {
    pub fn new(filelist: &Filelist, folder: Folder) -> Self {
        Self {
            cursor: filelist.select_all_nodes(),
            folder,
        }
    }
}

#[async_trait]
impl NodeSource for FilelistSource {
    async fn next_entry(&mut self) -> Result<Option<DiffEntry>, SyncError> {
        while let Some(node) = self.cursor.next().await? {
            let path = node.path.clone();
            match DiffEntry::from_node(node, &self.folder) {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(folder = %self.folder.name, path = %path, error = %e, "Skipping node outside folder");
                }
            }
        }
        Ok(None)
    }
}

/// Receiver of merge output
#[async_trait]
pub trait DiffSink: Send {
    async fn push(&mut self, difference: Difference) -> Result<(), SyncError>;
}

#[async_trait]
impl DiffSink for Vec<Difference> {
    async fn push(&mut self, difference: Difference) -> Result<(), SyncError> {
        Vec::push(self, difference);
        Ok(())
    }
}

/// Writes differences of one target to the difflist
struct DifflistSink<'a> {
    difflist: &'a Difflist,
    src: &'a str,
    dst: &'a str,
}

#[async_trait]
impl<'a> DiffSink for DifflistSink<'a> {
    async fn push(&mut self, difference: Difference) -> Result<(), SyncError> {
        let difference = difference.for_target(self.src, self.dst);
        self.difflist.insert(&difference).await?;
        Ok(())
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Merges two sorted sources and returns the number of emitted differences.
pub async fn merge<A, B, S>(
    src: &mut A,
    dst: &mut B,
    filter: &PathFilter,
    sink: &mut S,
) -> Result<u64, SyncError>
where
    A: NodeSource + ?Sized,
    B: NodeSource + ?Sized,
    S: DiffSink + ?Sized,
{
    let mut a = src.next_entry().await?;
    let mut b = dst.next_entry().await?;
    let mut last_rm: Option<String> = None;
    let mut emitted = 0u64;

    loop {
        let order = match (&a, &b) {
            (None, None) => break,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.path.cmp(&y.path),
        };

        match order {
            std::cmp::Ordering::Less => {
                if let Some(x) = a.take() {
                    emitted += emit_new(&x, filter, sink).await?;
                }
                a = src.next_entry().await?;
            }
            std::cmp::Ordering::Greater => {
                if let Some(y) = b.take() {
                    emitted += emit_rm(&y, &mut last_rm, sink).await?;
                }
                b = dst.next_entry().await?;
            }
            std::cmp::Ordering::Equal => {
                // Directory paths end with the separator, so equal paths
                // always have the same kind.
                if let (Some(x), Some(y)) = (a.take(), b.take()) {
                    if x.node_type == NodeType::File
                        && (x.modified > y.modified || x.padded_size != y.padded_size)
                    {
                        sink.push(Difference::new(DiffType::Update, NodeType::File, x.path, x.ivs))
                            .await?;
                        emitted += 1;
                    }
                }
                a = src.next_entry().await?;
                b = dst.next_entry().await?;
            }
        }
    }
    Ok(emitted)
}

async fn emit_new<S: DiffSink + ?Sized>(
    entry: &DiffEntry,
    filter: &PathFilter,
    sink: &mut S,
) -> Result<u64, SyncError> {
    if !filter.includes(&entry.path) {
        return Ok(0);
    }
    sink.push(Difference::new(
        DiffType::New,
        entry.node_type,
        entry.path.clone(),
        entry.ivs.clone(),
    ))
    .await?;
    Ok(1)
}

async fn emit_rm<S: DiffSink + ?Sized>(
    entry: &DiffEntry,
    last_rm: &mut Option<String>,
    sink: &mut S,
) -> Result<u64, SyncError> {
    if let Some(dir) = last_rm {
        if path::contains(dir, &entry.path) {
            return Ok(0);
        }
    }
    sink.push(Difference::new(
        DiffType::Rm,
        entry.node_type,
        entry.path.clone(),
        entry.ivs.clone(),
    ))
    .await?;
    if entry.node_type == NodeType::Dir {
        *last_rm = Some(entry.path.clone());
    }
    Ok(1)
}

// ============================================================================
// Diff builder
// ============================================================================

/// Rebuilds the difflist rows of one target from its inventories
pub struct DiffBuilder<'a> {
    pub src: &'a Folder,
    pub dst: &'a Folder,
    pub src_filelist: &'a Filelist,
    pub dst_filelist: &'a Filelist,
    /// Duplist of the destination storage, used when it is encrypted
    pub dst_duplist: Option<&'a Duplist>,
    pub filter: &'a PathFilter,
}

impl DiffBuilder<'_> {
    /// Replaces the target's rows in one transaction and returns the new
    /// per-type counts.
    pub async fn build(&self, difflist: &Difflist) -> Result<DiffSummary, SyncError> {
        difflist.begin().await?;
        match self.build_rows(difflist).await {
            Ok(emitted) => {
                difflist.commit().await?;
                let summary = difflist.summary(&self.src.name, &self.dst.name).await?;
                info!(
                    src = %self.src.name,
                    dst = %self.dst.name,
                    emitted,
                    new = summary.new,
                    update = summary.update,
                    rm = summary.rm,
                    rmdup = summary.rmdup,
                    "Built difference list"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(rollback) = difflist.rollback().await {
                    warn!(error = %rollback, "Difflist rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn build_rows(&self, difflist: &Difflist) -> Result<u64, SyncError> {
        let removed = difflist.clear_target(&self.src.name, &self.dst.name).await?;
        debug!(removed, "Cleared previous differences");

        let mut sink = DifflistSink {
            difflist,
            src: &self.src.name,
            dst: &self.dst.name,
        };
        let mut src = FilelistSource::new(self.src_filelist, self.src.clone());
        let mut dst = FilelistSource::new(self.dst_filelist, self.dst.clone());
        let mut emitted = merge(&mut src, &mut dst, self.filter, &mut sink).await?;

        if let (true, Some(duplist)) = (self.dst.encrypted, self.dst_duplist) {
            let mut cursor = duplist.select_children(&self.dst.prefix);
            while let Some(duplicate) = cursor.next().await? {
                let Ok(rel) = self.dst.relative(&duplicate.path) else {
                    continue;
                };
                sink.push(Difference::new(
                    DiffType::Rmdup,
                    duplicate.node_type,
                    rel,
                    duplicate.ivs,
                ))
                .await?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }
}
