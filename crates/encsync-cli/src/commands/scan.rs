//! Scan command - Refresh folder filelists from their storages

use anyhow::{bail, Result};
use clap::Args;
use encsync_core::domain::TaskStatus;

use super::GlobalArgs;

#[derive(Debug, Args)]
pub struct ScanCommand {
    /// Folders to scan, in order
    #[arg(required = true)]
    pub folders: Vec<String>,
}

impl ScanCommand {
    pub async fn execute(&self, global: &GlobalArgs) -> Result<()> {
        let formatter = global.format.formatter();
        let env = global.environment()?;

        let root = env.root_token().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                root.cancel();
            }
        });

        let reports = env.scan_folders(&self.folders).await?;

        if !global.human() {
            formatter.print_json(&serde_json::to_value(&reports)?);
        } else {
            for report in &reports {
                let line = format!(
                    "{}: {} ({} nodes, {} duplicates)",
                    report.folder, report.status, report.nodes, report.duplicates
                );
                match (&report.error, report.status) {
                    (_, TaskStatus::Finished) => formatter.success(&line),
                    (Some(error), _) => formatter.error(&format!("{line}: {error}")),
                    (None, _) => formatter.warn(&line),
                }
            }
        }

        let failed = reports
            .iter()
            .filter(|r| r.status != TaskStatus::Finished)
            .count();
        if failed > 0 {
            bail!("{failed} folder(s) were not scanned completely");
        }
        Ok(())
    }
}
