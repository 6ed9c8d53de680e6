//! Target registry
//!
//! Targets live in an arena owned by the registry. Synchronizers, stages and
//! workers refer to their target by [`TargetId`] and report status changes
//! and task outcomes through the registry, which keeps the per-stage
//! counters and raises the corresponding events.
//!
//! ## Events
//!
//! | Name               | Arguments                                   |
//! |--------------------|---------------------------------------------|
//! | `status_changed`   | `target`, `from`, `to`                      |
//! | `stage_changed`    | `target`, `stage`, `status`, `counts`       |
//! | `task_status`      | `target`, `stage`, `path`, `status`         |
//! | `error`            | `target`, `stage`, `path`, `error`          |
//! | `duplicates_found` | `folder`, `path`, `entries`                 |
//! | `progress`         | `target`, `stage`, `done`, `total`          |

use std::sync::{Arc, Mutex, MutexGuard};

use encsync_core::domain::{StatusCounts, TargetSpec, TaskStatus};
use encsync_core::events::Emitter;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Names of the events raised by the registry
pub const EVENTS: &[&str] = &[
    "status_changed",
    "stage_changed",
    "task_status",
    "error",
    "duplicates_found",
    "progress",
];

/// Index of a target in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TargetId(usize);

#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub name: String,
    pub status: TaskStatus,
    pub counts: StatusCounts,
}

/// Point-in-time view of a target
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub name: String,
    pub src: String,
    pub dst: String,
    pub status: TaskStatus,
    pub stages: Vec<StageSnapshot>,
}

impl TargetSnapshot {
    /// Counters summed over every stage.
    pub fn totals(&self) -> StatusCounts {
        let mut totals = StatusCounts::default();
        for stage in &self.stages {
            totals.merge(&stage.counts);
        }
        totals
    }
}

struct TargetRecord {
    snapshot: TargetSnapshot,
    token: CancellationToken,
}

impl TargetRecord {
    fn stage_mut(&mut self, stage: &str) -> &mut StageSnapshot {
        let idx = match self.snapshot.stages.iter().position(|s| s.name == stage) {
            Some(idx) => idx,
            None => {
                self.snapshot.stages.push(StageSnapshot {
                    name: stage.to_string(),
                    status: TaskStatus::New,
                    counts: StatusCounts::default(),
                });
                self.snapshot.stages.len() - 1
            }
        };
        &mut self.snapshot.stages[idx]
    }
}

/// Arena of the targets of one process
pub struct TargetRegistry {
    records: Mutex<Vec<TargetRecord>>,
    emitter: Emitter,
    root: CancellationToken,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.records().len())
            .finish()
    }
}

impl TargetRegistry {
    /// Creates a registry whose targets stop when `root` is cancelled.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            emitter: Emitter::new("targets", EVENTS.iter().copied()),
            root,
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<TargetRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    pub fn register(&self, spec: &TargetSpec) -> TargetId {
        let mut records = self.records();
        records.push(TargetRecord {
            snapshot: TargetSnapshot {
                name: spec.name.clone(),
                src: spec.src.name.clone(),
                dst: spec.dst.name.clone(),
                status: TaskStatus::New,
                stages: Vec::new(),
            },
            token: self.root.child_token(),
        });
        let id = TargetId(records.len() - 1);
        debug!(target_name = %spec.name, ?id, "Registered target");
        id
    }

    /// Cancellation token of a target, a child of the registry root.
    pub fn token(&self, id: TargetId) -> CancellationToken {
        self.records()
            .get(id.0)
            .map(|r| r.token.clone())
            .unwrap_or_else(|| self.root.child_token())
    }

    pub fn status(&self, id: TargetId) -> TaskStatus {
        self.records()
            .get(id.0)
            .map(|r| r.snapshot.status)
            .unwrap_or_default()
    }

    pub fn snapshot(&self, id: TargetId) -> Option<TargetSnapshot> {
        self.records().get(id.0).map(|r| r.snapshot.clone())
    }

    pub fn snapshots(&self) -> Vec<TargetSnapshot> {
        self.records().iter().map(|r| r.snapshot.clone()).collect()
    }

    /// Moves a target to `status`. Invalid transitions are logged and
    /// ignored.
    pub fn set_status(&self, id: TargetId, status: TaskStatus) {
        let (name, from) = {
            let mut records = self.records();
            let Some(record) = records.get_mut(id.0) else {
                return;
            };
            let from = record.snapshot.status;
            if from == status {
                return;
            }
            if let Err(e) = from.transition(status) {
                warn!(target_name = %record.snapshot.name, error = %e, "Ignoring status change");
                return;
            }
            record.snapshot.status = status;
            (record.snapshot.name.clone(), from)
        };
        self.emitter.emit(
            "status_changed",
            json!({ "target": name, "from": from.as_str(), "to": status.as_str() }),
        );
    }

    /// Stops a target: every controller it issued observes the stop.
    pub fn stop(&self, id: TargetId) {
        if let Some(record) = self.records().get(id.0) {
            record.token.cancel();
        }
    }

    pub fn stop_all(&self) {
        self.root.cancel();
    }

    // ========================================================================
    // Stages and tasks
    // ========================================================================

    /// Records the status of a stage; `counts` replaces the stage counters
    /// when given.
    pub fn set_stage_status(
        &self,
        id: TargetId,
        stage: &str,
        status: TaskStatus,
        counts: Option<StatusCounts>,
    ) {
        let (name, counts) = {
            let mut records = self.records();
            let Some(record) = records.get_mut(id.0) else {
                return;
            };
            let name = record.snapshot.name.clone();
            let entry = record.stage_mut(stage);
            entry.status = status;
            if let Some(counts) = counts {
                entry.counts = counts;
            }
            (name, entry.counts)
        };
        self.emitter.emit(
            "stage_changed",
            json!({ "target": name, "stage": stage, "status": status.as_str(), "counts": counts }),
        );
    }

    /// Counts a task that entered `status` and reports it.
    pub fn task_status(&self, id: TargetId, stage: &str, path: &str, status: TaskStatus) {
        let (name, counts) = {
            let mut records = self.records();
            let Some(record) = records.get_mut(id.0) else {
                return;
            };
            let name = record.snapshot.name.clone();
            let entry = record.stage_mut(stage);
            entry.counts.total += 1;
            entry.counts.record(status);
            (name, entry.counts)
        };
        self.emitter.emit(
            "task_status",
            json!({ "target": name, "stage": stage, "path": path, "status": status.as_str() }),
        );
        self.emitter.emit(
            "progress",
            json!({ "target": name, "stage": stage, "done": counts.done(), "total": counts.total }),
        );
    }

    /// Reports a task failure.
    pub fn task_error(&self, id: TargetId, stage: &str, path: &str, error: &dyn std::fmt::Display) {
        let name = self
            .records()
            .get(id.0)
            .map(|r| r.snapshot.name.clone())
            .unwrap_or_default();
        warn!(target_name = %name, stage, path, error = %error, "Task failed");
        self.emitter.emit(
            "error",
            json!({ "target": name, "stage": stage, "path": path, "error": error.to_string() }),
        );
    }
}

// ============================================================================
// Stage reporter
// ============================================================================

/// Handle a worker uses to report the tasks of one stage of one target
#[derive(Clone)]
pub struct StageReporter {
    registry: Arc<TargetRegistry>,
    id: TargetId,
    stage: &'static str,
}

impl StageReporter {
    pub fn new(registry: Arc<TargetRegistry>, id: TargetId, stage: &'static str) -> Self {
        Self {
            registry,
            id,
            stage,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn task(&self, path: &str, status: TaskStatus) {
        self.registry.task_status(self.id, self.stage, path, status);
    }

    pub fn error(&self, path: &str, error: &dyn std::fmt::Display) {
        self.registry.task_error(self.id, self.stage, path, error);
    }
}

#[cfg(test)]
mod tests {
    use encsync_core::domain::Folder;

    use super::*;

    fn spec(name: &str) -> TargetSpec {
        TargetSpec::new(name, Folder::new("a", "local", "/"), Folder::new("b", "mem", "/"))
    }

    #[test]
    fn test_status_transitions_emit_events() {
        let registry = TargetRegistry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .emitter()
            .subscribe("status_changed", move |event| {
                sink.lock().unwrap().push(event.args["to"].as_str().unwrap().to_string());
                true
            })
            .unwrap();

        let id = registry.register(&spec("t"));
        registry.set_status(id, TaskStatus::Pending);
        registry.set_status(id, TaskStatus::Finished);
        // Not allowed: terminal states only restart as pending.
        registry.set_status(id, TaskStatus::Failed);

        assert_eq!(registry.status(id), TaskStatus::Finished);
        assert_eq!(*seen.lock().unwrap(), vec!["pending", "finished"]);
    }

    #[test]
    fn test_task_counters_per_stage() {
        let registry = TargetRegistry::default();
        let id = registry.register(&spec("t"));
        registry.task_status(id, "files", "a", TaskStatus::Finished);
        registry.task_status(id, "files", "b", TaskStatus::Failed);
        registry.task_status(id, "rm", "c", TaskStatus::Finished);

        let snapshot = registry.snapshot(id).unwrap();
        assert_eq!(snapshot.stages.len(), 2);
        assert_eq!(snapshot.stages[0].name, "files");
        assert_eq!(snapshot.stages[0].counts.failed, 1);
        assert_eq!(snapshot.totals().total, 3);
        assert_eq!(snapshot.totals().finished, 2);
    }

    #[test]
    fn test_stop_reaches_target_tokens() {
        let registry = TargetRegistry::default();
        let a = registry.register(&spec("a"));
        let b = registry.register(&spec("b"));

        registry.stop(a);
        assert!(registry.token(a).is_cancelled());
        assert!(!registry.token(b).is_cancelled());

        registry.stop_all();
        assert!(registry.token(b).is_cancelled());
    }
}
