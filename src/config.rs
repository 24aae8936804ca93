//! Configuration loading and schema definitions for cvrun.
//!
//! The harness configuration is a TOML file (by default `automation.toml`)
//! holding the process-wide defaults a manifest does not carry: worker
//! counts, log and report locations, the commands used to reach the
//! commcell and to send mail, and command-backed test case registrations.
//!
//! The run manifest itself is JSON and lives in [`crate::manifest`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Default configuration file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "automation.toml";

/// Loads harness configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use cvrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("automation.toml"))?;
/// println!("Testset threads: {}", config.harness.testset_threads);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads harness configuration from a TOML string.
///
/// # Example
///
/// ```
/// use cvrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [harness]
///     testset_threads = 4
/// "#)?;
///
/// assert_eq!(config.harness.testset_threads, 4);
/// assert_eq!(config.harness.testcase_threads, 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the configuration at `path`, falling back to defaults when the
/// file is absent and was not explicitly requested.
///
/// An explicitly requested file that does not exist is an error.
pub fn load_config_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        debug!(
            "No configuration file at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    load_config(path)
}
