pub mod check;
pub mod enqueue;
pub mod jobs;
pub mod run_once;
pub mod serve;

use std::path::Path;

use anyhow::{anyhow, Context};
use followup_core::config::{Config, WarnLevel};

/// Load the config file and refuse to continue on error-level findings.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    let mut errors = Vec::new();
    for warning in config.validate() {
        match warning.level {
            WarnLevel::Warning => tracing::warn!("{}", warning.message),
            WarnLevel::Error => errors.push(warning.message),
        }
    }
    if !errors.is_empty() {
        return Err(anyhow!(
            "invalid configuration in {}:\n  {}",
            path.display(),
            errors.join("\n  ")
        ));
    }
    Ok(config)
}
