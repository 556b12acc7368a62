use location_sync::telemetry::{init_tracing, shutdown_signal};
use location_sync::{LocationSyncConfig, LocationSyncService, SyncScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = LocationSyncConfig::load()?;
    info!(
        mode = ?config.update_mode,
        providers = config.enabled_providers().count(),
        "Location sync configured"
    );

    let service = LocationSyncService::from_config(&config).await?;

    let Some(interval) = config.sync_interval() else {
        let report = service.run_pass().await?;
        info!(
            inserted = report.inserted(),
            updated = report.updated(),
            uploaded = report.uploaded,
            "Location sync finished"
        );
        return Ok(());
    };

    let mut scheduler = SyncScheduler::new(service, interval).await?;
    scheduler.start().await?;
    shutdown_signal().await;
    scheduler.stop().await?;

    Ok(())
}
