//! CLI command implementations

pub mod config;
pub mod diff;
pub mod rmdup;
pub mod scan;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use encsync_core::config::Config;
use encsync_sync::Environment;

use crate::output::OutputFormat;

/// Options shared by every command
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config_path: PathBuf,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl GlobalArgs {
    /// Loads and validates the configuration file.
    pub fn load_config(&self) -> Result<Config> {
        let config = Config::load(&self.config_path).with_context(|| {
            format!("Failed to load configuration {}", self.config_path.display())
        })?;
        Ok(config.validated()?)
    }

    pub fn environment(&self) -> Result<Environment> {
        Environment::new(self.load_config()?)
    }

    pub fn human(&self) -> bool {
        self.format == OutputFormat::Human
    }
}
