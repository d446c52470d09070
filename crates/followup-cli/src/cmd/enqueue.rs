use std::path::Path;

use chrono::Utc;
use followup_core::orchestrator::PROCESS_FOLLOW_UPS;

use crate::output::{print_json, print_pairs};

pub fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let queue = followup_server::runtime::open_queue(&config)?;
    let now = Utc::now();
    let job = queue.enqueue(
        PROCESS_FOLLOW_UPS,
        serde_json::json!({ "triggered_at": now, "source": "cli" }),
        config.queue.job_options(),
        now,
    )?;
    queue.close();

    if json {
        print_json(&job)?;
    } else {
        print_pairs(&[
            ("job", job.id.to_string()),
            ("name", job.name.clone()),
            ("queue", queue.name().to_string()),
            ("attempts", job.options.attempts.to_string()),
        ]);
    }
    Ok(())
}
