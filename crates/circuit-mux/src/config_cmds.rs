use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

use cmx_config::{SchedulerConfig, validate_config};
use cmx_core::OutputFormat;

fn user_path_or(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => SchedulerConfig::user_config_path()
            .context("Cannot determine config directory; pass an explicit path"),
    }
}

/// Config from `path`, else the user config, else built-in defaults.
pub(crate) fn load_effective(path: Option<&Path>) -> Result<SchedulerConfig> {
    match path {
        Some(path) => SchedulerConfig::load(path),
        None => SchedulerConfig::load_or_default(),
    }
}

pub(crate) fn handle_config_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = user_path_or(path)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, SchedulerConfig::default_template())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("Wrote default scheduler config to: {}", path.display());
    Ok(())
}

pub(crate) fn handle_config_validate(path: Option<PathBuf>) -> Result<()> {
    let path = user_path_or(path)?;
    if !path.exists() {
        warn!(path = %path.display(), "Config file does not exist, nothing to validate");
        anyhow::bail!("No config file at {}", path.display());
    }
    let config = SchedulerConfig::load(&path)?;
    validate_config(&config).with_context(|| format!("Invalid config: {}", path.display()))?;
    eprintln!("Configuration is valid: {}", path.display());
    Ok(())
}

pub(crate) fn handle_config_show(path: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let config = load_effective(path.as_deref())?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Text => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
