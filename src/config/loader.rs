// Configuration loader
// Loads a run from an explicit TOML path or ~/.embeddings/config.toml

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::RunConfig;
use crate::errors::config_parse_error;
use crate::models::DevicePreference;

/// Load a run configuration.
///
/// `EMBEDDINGS_DEVICE` overrides `model.device` when set.
pub fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        bail!(
            "No configuration found at {}.\n\n\
            Pass one explicitly:\n\n\
            \x1b[1;36membeddings train --config run.toml\x1b[0m",
            config_path.display()
        );
    }

    let contents = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;

    let mut config = parse_config(&contents)?;

    if let Ok(device) = std::env::var("EMBEDDINGS_DEVICE") {
        if !device.is_empty() {
            config.model.device = device.parse::<DevicePreference>()?;
            tracing::debug!(device = %device, "Device overridden from environment");
        }
    }

    tracing::info!(path = %config_path.display(), "Loaded configuration");
    Ok(config)
}

/// Parse a TOML document into a run configuration
pub fn parse_config(contents: &str) -> Result<RunConfig> {
    toml::from_str(contents).map_err(|e| anyhow!(config_parse_error(&e.to_string())))
}

fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".embeddings/config.toml"))
}
