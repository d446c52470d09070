use std::path::Path;

use anyhow::anyhow;
use followup_core::queue::JobState;

use crate::output::{print_json, print_table};

fn parse_state(raw: &str) -> anyhow::Result<JobState> {
    match raw {
        "waiting" => Ok(JobState::Waiting),
        "active" => Ok(JobState::Active),
        "completed" => Ok(JobState::Completed),
        "failed" => Ok(JobState::Failed),
        other => Err(anyhow!(
            "unknown job state '{other}' (expected waiting, active, completed or failed)"
        )),
    }
}

pub fn run(config_path: &Path, state: Option<&str>, json: bool) -> anyhow::Result<()> {
    let filter = state.map(parse_state).transpose()?;
    let config = super::load_config(config_path)?;
    let queue = followup_server::runtime::open_queue(&config)?;
    let counts = queue.counts()?;
    let jobs: Vec<_> = queue
        .list()?
        .into_iter()
        .filter(|j| filter.map_or(true, |s| j.state == s))
        .collect();
    queue.close();

    if json {
        return print_json(&serde_json::json!({ "counts": counts, "jobs": jobs }));
    }

    if jobs.is_empty() {
        println!("No jobs.");
    } else {
        let rows = jobs
            .iter()
            .map(|j| {
                vec![
                    j.id.to_string(),
                    j.name.clone(),
                    j.state.to_string(),
                    format!("{}/{}", j.attempts_made, j.options.attempts),
                    j.run_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    j.last_error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["ID", "NAME", "STATE", "TRIES", "RUN AT", "LAST ERROR"], rows);
    }
    println!(
        "\nwaiting {}  active {}  completed {}  failed {}",
        counts.waiting, counts.active, counts.completed, counts.failed
    );
    Ok(())
}
