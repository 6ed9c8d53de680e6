//! Rmdup command - Delete the duplicate ciphertexts recorded by scans

use anyhow::{bail, Result};
use clap::Args;
use encsync_core::domain::TaskStatus;
use encsync_sync::run_worker;

use super::GlobalArgs;

#[derive(Debug, Args)]
pub struct RmdupCommand {
    /// Encrypted folder to clean up
    pub folder: String,

    /// Scan the folder first to record its current duplicates
    #[arg(long)]
    pub scan: bool,
}

impl RmdupCommand {
    pub async fn execute(&self, global: &GlobalArgs) -> Result<()> {
        let formatter = global.format.formatter();
        let env = global.environment()?;

        let folder = env.config().folder(&self.folder)?;
        if !folder.encrypted {
            formatter.warn(&format!("{} is not encrypted, nothing to do", self.folder));
            return Ok(());
        }

        if self.scan {
            let reports = env.scan_folders(std::slice::from_ref(&self.folder)).await?;
            if reports.iter().any(|r| r.status != TaskStatus::Finished) {
                bail!("Scan of {} did not finish", self.folder);
            }
        }

        let root = env.root_token().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                root.cancel();
            }
        });

        let mut remover = env.duplicate_remover(&self.folder).await?;
        let status = run_worker(&mut remover).await;

        if !global.human() {
            formatter.print_json(&serde_json::json!({ "folder": self.folder, "status": status }));
        } else if status == TaskStatus::Finished {
            formatter.success(&format!("{}: duplicates removed", self.folder));
        }

        if status != TaskStatus::Finished {
            bail!("Duplicate removal of {} ended {}", self.folder, status);
        }
        Ok(())
    }
}
