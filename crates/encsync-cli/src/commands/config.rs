//! Config command - Show, validate and generate configuration values

use anyhow::{bail, Result};
use clap::Subcommand;
use encsync_core::crypto::Key;
use serde_json::json;

use super::GlobalArgs;

/// AES-256
const KEY_LEN: usize = 32;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Check the configuration file and list every problem
    Validate,
    /// Generate a fresh master key and data key
    Keygen,
}

impl ConfigCommand {
    pub fn execute(&self, global: &GlobalArgs) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(global),
            ConfigCommand::Validate => execute_validate(global),
            ConfigCommand::Keygen => execute_keygen(global),
        }
    }
}

fn execute_show(global: &GlobalArgs) -> Result<()> {
    let formatter = global.format.formatter();
    let config = global.load_config()?;

    if global.human() {
        print!("{}", config.to_yaml()?);
    } else {
        formatter.print_json(&serde_json::to_value(&config)?);
    }
    Ok(())
}

fn execute_validate(global: &GlobalArgs) -> Result<()> {
    let formatter = global.format.formatter();
    let config = encsync_core::config::Config::load(&global.config_path)?;
    let errors = config.validate();

    if !global.human() {
        let list: Vec<_> = errors
            .iter()
            .map(|e| json!({ "field": e.field, "message": e.message }))
            .collect();
        formatter.print_json(&json!({ "valid": errors.is_empty(), "errors": list }));
    } else if errors.is_empty() {
        formatter.success(&format!(
            "Configuration {} is valid",
            global.config_path.display()
        ));
    } else {
        for error in &errors {
            formatter.error(&error.to_string());
        }
    }

    if !errors.is_empty() {
        bail!("{} configuration error(s)", errors.len());
    }
    Ok(())
}

fn execute_keygen(global: &GlobalArgs) -> Result<()> {
    let formatter = global.format.formatter();
    let master = Key::generate(KEY_LEN)?.to_base64();
    let data = Key::generate(KEY_LEN)?.to_base64();

    if global.human() {
        formatter.success("Generated keys; add them to the configuration");
        println!("master_key: {master}");
        println!("data_key: {data}");
    } else {
        formatter.print_json(&json!({ "master_key": master, "data_key": data }));
    }
    Ok(())
}
