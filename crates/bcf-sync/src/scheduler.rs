use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::SyncPipeline;
use crate::worker::WakeSignal;

/// Periodic full recompute. The cron job only enqueues and wakes the worker; the queue
/// keeps it serialized with webhook-triggered syncs.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    wake: WakeSignal,
) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().full_recompute_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let wake = Arc::clone(&wake);
        Box::pin(async move {
            match pipeline.enqueue_full_recompute("schedule").await {
                Ok(job) => {
                    info!(job_id = %job.id, "scheduled full recompute enqueued");
                    wake.notify_one();
                }
                Err(err) => error!(error = %err, "failed to enqueue scheduled full recompute"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
