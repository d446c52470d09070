use std::path::Path;

use followup_providers::Secrets;
use followup_server::runtime::Runtime;

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let secrets = Secrets::from_env();
    tracing::debug!(?secrets, "provider secrets");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let service = Runtime::start(&config, &secrets).await?;
        println!(
            "followupd listening on http://localhost:{}  (schedule {})",
            service.local_addr().port(),
            if config.schedule.enabled {
                format!("daily at {:02}:{:02}", config.schedule.hour, config.schedule.minute)
            } else {
                "disabled".to_string()
            }
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        service.stop().await;
        anyhow::Ok(())
    })
}
