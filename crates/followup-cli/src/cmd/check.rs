use std::path::Path;

use anyhow::bail;
use followup_core::config::{Config, WarnLevel};

use crate::output::{print_json, print_table};

pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let warnings = config.validate();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({
            "path": path.display().to_string(),
            "found": path.exists(),
            "warnings": warnings,
        }))?;
    } else if warnings.is_empty() {
        println!("{}: ok", path.display());
    } else {
        let rows = warnings
            .iter()
            .map(|w| {
                let level = match w.level {
                    WarnLevel::Warning => "warning",
                    WarnLevel::Error => "error",
                };
                vec![level.to_string(), w.message.clone()]
            })
            .collect();
        print_table(&["LEVEL", "MESSAGE"], rows);
    }

    if errors > 0 {
        bail!("{errors} configuration error(s) in {}", path.display());
    }
    Ok(())
}
