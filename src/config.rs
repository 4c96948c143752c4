//! Configuration loading for dutctl.
//!
//! Two TOML documents drive an executor: the fleet configuration
//! (`dutctl.toml`) and the machine inventory it points at
//! (`machines.toml`). The inventory is re-read periodically, so it is loaded
//! separately.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads the fleet configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match the schema.
///
/// # Example
///
/// ```no_run
/// use dutctl::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("dutctl.toml"))?;
/// println!("Listening on {}", config.executor.listen);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads the fleet configuration from a TOML string.
///
/// ```
/// use dutctl::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [executor]
///     listen = "0.0.0.0:8100"
///
///     [[pdus]]
///     name = "bench"
///     driver = "dummy"
/// "#)?;
///
/// assert_eq!(config.pdus.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the machine inventory.
pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read inventory: {}", path.display()))?;

    toml::from_str(&content).with_context(|| format!("Failed to parse inventory: {}", path.display()))
}
