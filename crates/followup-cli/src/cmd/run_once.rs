use std::path::Path;

use chrono::Utc;
use followup_providers::Secrets;

use crate::output::{print_json, print_pairs};

pub fn run(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let secrets = Secrets::from_env();
    tracing::debug!(?secrets, "provider secrets");

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let store = followup_server::runtime::open_store(&config)?;
        let orchestrator = followup_server::runtime::build_orchestrator(
            &config,
            &secrets,
            store.clone(),
            store,
        )?;
        anyhow::Ok(orchestrator.run(Utc::now()).await?)
    })?;

    if json {
        return print_json(&report);
    }
    print_pairs(&[
        ("tenants", report.tenants_seen.to_string()),
        ("not connected", report.tenants_not_connected.to_string()),
        ("tenants failed", report.tenants_failed.to_string()),
        ("leads", report.leads_seen.to_string()),
        ("sent", report.sent.to_string()),
        ("skipped", report.skipped.to_string()),
        ("content unavailable", report.content_unavailable.to_string()),
        ("lead failures", report.lead_failures.to_string()),
    ]);
    Ok(())
}
