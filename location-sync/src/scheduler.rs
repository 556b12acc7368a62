use crate::error::{LocationSyncError, LocationSyncResult};
use crate::sync::{LocationSyncService, SyncReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Six-field cron expression firing every `interval`, rounded to whole
/// seconds, minutes or hours.
pub fn cron_expression(interval: Duration) -> String {
    let seconds = interval.as_secs().max(1);
    if seconds < 60 {
        format!("*/{seconds} * * * * *")
    } else if seconds < 3600 {
        format!("0 */{} * * * *", seconds / 60)
    } else {
        format!("0 0 */{} * * *", (seconds / 3600).min(23))
    }
}

pub struct SyncScheduler {
    scheduler: JobScheduler,
    sync_service: Arc<LocationSyncService>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
    running: Arc<Mutex<()>>
}

impl SyncScheduler {
    pub async fn new(
        sync_service: LocationSyncService,
        interval: Duration
    ) -> LocationSyncResult<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| LocationSyncError::Scheduler(e.to_string()))?;

        let sync_service = Arc::new(sync_service);
        let last_report = Arc::new(RwLock::new(None));
        let running = Arc::new(Mutex::new(()));

        let cron = cron_expression(interval);
        info!(cron = %cron, "Scheduling location sync");

        let service_clone = sync_service.clone();
        let report_clone = last_report.clone();
        let running_clone = running.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let service = service_clone.clone();
            let report = report_clone.clone();
            let running = running_clone.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("Previous location sync still running, skipping tick");
                    return;
                };

                info!("Starting scheduled location sync");
                match service.run_pass().await {
                    Ok(sync_report) => {
                        info!(
                            inserted = sync_report.inserted(),
                            updated = sync_report.updated(),
                            uploaded = sync_report.uploaded,
                            "Scheduled sync completed"
                        );
                        *report.write().await = Some(sync_report);
                    }
                    Err(e) => {
                        error!(error = %e, "Scheduled sync failed");
                    }
                }
            })
        })
        .map_err(|e| LocationSyncError::Scheduler(e.to_string()))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| LocationSyncError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            sync_service,
            last_report,
            running
        })
    }

    pub async fn start(&self) -> LocationSyncResult<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| LocationSyncError::Scheduler(e.to_string()))?;
        info!("Location sync scheduler started");
        Ok(())
    }

    pub async fn stop(&mut self) -> LocationSyncResult<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| LocationSyncError::Scheduler(e.to_string()))?;
        info!("Location sync scheduler stopped");
        Ok(())
    }

    /// Runs a pass right away, waiting for a scheduled one to finish first.
    pub async fn run_now(&self) -> LocationSyncResult<SyncReport> {
        let _guard = self.running.lock().await;
        let report = self.sync_service.run_pass().await?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().await.clone()
    }
}
