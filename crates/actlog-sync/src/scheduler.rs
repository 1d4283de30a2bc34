//! Periodic execution of the delivery reconciler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::recovery::{DeliveryReconciler, ReconcileError};

/// Fires a reconciliation pass every `interval`. Ticks that land while a pass is
/// still running are dropped by the reconciler's running flag.
pub struct RecoveryScheduler {
    scheduler: JobScheduler,
}

impl RecoveryScheduler {
    pub async fn start(reconciler: Arc<DeliveryReconciler>, interval: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let reconciler = Arc::clone(&reconciler);
            Box::pin(async move {
                match reconciler.run_once().await {
                    Ok(_) => {}
                    Err(ReconcileError::AlreadyRunning) => {
                        warn!("previous recovery run still in progress; skipping tick");
                    }
                }
            })
        })
        .with_context(|| format!("creating recovery job every {interval:?}"))?;
        scheduler.add(job).await.context("adding recovery job")?;
        scheduler.start().await.context("starting scheduler")?;
        info!(?interval, "recovery scheduler started");
        Ok(Self { scheduler })
    }

    pub async fn stop(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        info!("recovery scheduler stopped");
        Ok(())
    }
}
