//! Sync command - Run targets through the staged pipeline
//!
//! Targets run one after another in the order given. Ctrl-C stops the
//! running target cooperatively: its current stage is rolled back and the
//! pending differences are kept for the next run.

use anyhow::{bail, Result};
use clap::Args;
use encsync_core::domain::{TargetFlags, TaskStatus};
use encsync_core::events::Event;
use encsync_sync::{Environment, TargetReport};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::GlobalArgs;
use crate::output::OutputFormatter;

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Targets to run, in order; every configured target when omitted
    pub targets: Vec<String>,

    /// Plan from the current filelists without scanning
    #[arg(long)]
    pub no_scan: bool,

    /// Keep destination entries that have no source counterpart
    #[arg(long)]
    pub no_remove: bool,

    /// Do not rescan the destination after copying
    #[arg(long)]
    pub skip_integrity_check: bool,

    /// Reuse the source filelist when it already holds nodes
    #[arg(long)]
    pub avoid_src_rescan: bool,

    /// Reuse the destination filelist when it already holds nodes
    #[arg(long)]
    pub avoid_dst_rescan: bool,

    /// Upload limit in bytes per second
    #[arg(long, value_name = "BYTES")]
    pub upload_limit: Option<u64>,

    /// Download limit in bytes per second
    #[arg(long, value_name = "BYTES")]
    pub download_limit: Option<u64>,
}

impl SyncCommand {
    pub async fn execute(&self, global: &GlobalArgs) -> Result<()> {
        let formatter = global.format.formatter();
        let env = global.environment()?;

        let names: Vec<String> = if self.targets.is_empty() {
            env.config().targets.keys().cloned().collect()
        } else {
            self.targets.clone()
        };
        if names.is_empty() {
            formatter.warn("No targets configured");
            return Ok(());
        }
        // Resolve every name before the first target starts.
        let mut specs = Vec::with_capacity(names.len());
        for name in &names {
            let mut spec = env.target(name)?;
            self.apply(&mut spec.flags);
            specs.push(spec);
        }

        let root = env.root_token().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping");
                root.cancel();
            }
        });

        let printer = (global.human() && !global.quiet).then(|| {
            let events = env.registry().emitter().subscribe_channel(1024);
            tokio::spawn(print_events(events))
        });

        let reports = run_targets(&env, specs).await;

        if let Some(printer) = printer {
            printer.abort();
        }
        print_reports(formatter.as_ref(), global, &reports)?;

        let incomplete = names.len()
            - reports
                .iter()
                .filter(|r| matches!(r.status, TaskStatus::Finished | TaskStatus::Skipped))
                .count();
        if incomplete > 0 {
            bail!("{incomplete} of {} target(s) did not finish", names.len());
        }
        Ok(())
    }

    /// Command-line switches only ever tighten the configured flags.
    fn apply(&self, flags: &mut TargetFlags) {
        if self.no_scan {
            flags.enable_scan = false;
        }
        if self.no_remove {
            flags.no_remove = true;
        }
        if self.skip_integrity_check {
            flags.skip_integrity_check = true;
        }
        if self.avoid_src_rescan {
            flags.avoid_src_rescan = Some(true);
        }
        if self.avoid_dst_rescan {
            flags.avoid_dst_rescan = Some(true);
        }
        if self.upload_limit.is_some() {
            flags.upload_limit = self.upload_limit;
        }
        if self.download_limit.is_some() {
            flags.download_limit = self.download_limit;
        }
    }
}

async fn run_targets(
    env: &Environment,
    specs: Vec<encsync_core::domain::TargetSpec>,
) -> Vec<TargetReport> {
    let mut reports = Vec::with_capacity(specs.len());
    for spec in specs {
        if env.root_token().is_cancelled() {
            info!(target_name = %spec.name, "Not started, run was stopped");
            break;
        }
        let name = spec.name.clone();
        match env.synchronizer(spec).await {
            Ok(mut synchronizer) => reports.push(synchronizer.run().await),
            Err(e) => warn!(target_name = %name, error = %format!("{e:#}"), "Could not prepare target"),
        }
    }
    reports
}

fn print_reports(
    formatter: &dyn OutputFormatter,
    global: &GlobalArgs,
    reports: &[TargetReport],
) -> Result<()> {
    if !global.human() {
        formatter.print_json(&serde_json::to_value(reports)?);
        return Ok(());
    }

    for report in reports {
        let line = format!(
            "{}: {} (planned new {}, update {}, rm {}, rmdup {})",
            report.target,
            report.status,
            report.summary.new,
            report.summary.update,
            report.summary.rm,
            report.summary.rmdup,
        );
        match report.status {
            TaskStatus::Finished | TaskStatus::Skipped => formatter.success(&line),
            TaskStatus::Suspended => formatter.warn(&line),
            _ => formatter.error(&line),
        }
        for stage in &report.stages {
            formatter.info(&format!(
                "{:<6} {:<9} {} done, {} failed",
                stage.stage.as_str(),
                stage.status.as_str(),
                stage.counts.done(),
                stage.counts.failed,
            ));
        }
    }
    Ok(())
}

/// Prints task transitions and errors as they happen.
async fn print_events(mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        let field = |key: &str| {
            event
                .args
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match event.name.as_str() {
            "task_status" => {
                let status = field("status");
                if status != TaskStatus::Pending.as_str() {
                    println!("  [{}] {} {} {}", field("target"), field("stage"), status, field("path"));
                }
            }
            "error" => eprintln!(
                "  [{}] {} error {}: {}",
                field("target"),
                field("stage"),
                field("path"),
                field("error")
            ),
            "duplicates_found" => println!(
                "  [{}] duplicates of {} in {}",
                field("target"),
                field("path"),
                field("folder")
            ),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> SyncCommand {
        SyncCommand {
            targets: Vec::new(),
            no_scan: false,
            no_remove: false,
            skip_integrity_check: false,
            avoid_src_rescan: false,
            avoid_dst_rescan: false,
            upload_limit: None,
            download_limit: None,
        }
    }

    #[test]
    fn test_switches_override_configured_flags() {
        let mut cmd = command();
        cmd.no_scan = true;
        cmd.no_remove = true;
        cmd.upload_limit = Some(1024);

        let mut flags = TargetFlags::default();
        cmd.apply(&mut flags);
        assert!(!flags.enable_scan);
        assert!(flags.no_remove);
        assert!(!flags.skip_integrity_check);
        assert_eq!(flags.upload_limit, Some(1024));
        assert_eq!(flags.avoid_src_rescan, None);
    }

    #[test]
    fn test_absent_switches_keep_configured_flags() {
        let mut flags = TargetFlags {
            no_remove: true,
            download_limit: Some(10),
            ..TargetFlags::default()
        };
        command().apply(&mut flags);
        assert!(flags.no_remove);
        assert!(flags.enable_scan);
        assert_eq!(flags.download_limit, Some(10));
    }
}
