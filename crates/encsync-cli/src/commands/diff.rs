//! Diff command - Plan the differences of a target without applying them

use anyhow::{bail, Result};
use clap::Args;
use encsync_core::domain::TaskStatus;
use serde_json::json;

use super::GlobalArgs;

#[derive(Debug, Args)]
pub struct DiffCommand {
    /// Target to plan
    pub target: String,

    /// Plan from the current filelists without scanning
    #[arg(long)]
    pub no_scan: bool,

    /// Print every planned difference
    #[arg(long, short)]
    pub list: bool,
}

impl DiffCommand {
    pub async fn execute(&self, global: &GlobalArgs) -> Result<()> {
        let formatter = global.format.formatter();
        let env = global.environment()?;
        let spec = env.target(&self.target)?;

        if !self.no_scan {
            let folders = vec![spec.src.name.clone(), spec.dst.name.clone()];
            let reports = env.scan_folders(&folders).await?;
            if let Some(report) = reports.iter().find(|r| r.status != TaskStatus::Finished) {
                bail!(
                    "Scan of {} ended {}: {}",
                    report.folder,
                    report.status,
                    report.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }

        let summary = env.build_diff(&spec).await?;
        let differences = if self.list {
            env.difflist()
                .await?
                .select(&spec.src.name, &spec.dst.name, &[], None)
                .collect_all()
                .await?
        } else {
            Vec::new()
        };

        if !global.human() {
            let mut value = json!({ "target": spec.name, "summary": summary, "total": summary.total() });
            if self.list {
                value["differences"] = serde_json::to_value(&differences)?;
            }
            formatter.print_json(&value);
            return Ok(());
        }

        formatter.success(&format!(
            "{}: {} difference(s) from {} to {}",
            spec.name,
            summary.total(),
            spec.src.name,
            spec.dst.name
        ));
        formatter.info(&format!("new:    {}", summary.new));
        formatter.info(&format!("update: {}", summary.update));
        formatter.info(&format!("rm:     {}", summary.rm));
        formatter.info(&format!("rmdup:  {}", summary.rmdup));
        for difference in &differences {
            formatter.info(&difference.to_string());
        }
        Ok(())
    }
}
