use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::sleep,
};
use tracing::{error, info};

use super::{ClaimedJob, PgTaskQueue};
use crate::{config::WorkerSettings, pipeline::Pipeline};

// Long enough for a slow model call plus the PDF read.
const JOB_LEASE: Duration = Duration::from_secs(15 * 60);

/// Polls for due descriptor jobs until `shutdown` resolves, running at most
/// `settings.concurrency` of them at a time. In-flight jobs are awaited
/// before returning.
pub async fn run_until<F>(
    pipeline: Arc<Pipeline>,
    queue: PgTaskQueue,
    settings: WorkerSettings,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    tokio::pin!(shutdown);

    info!(
        concurrency = settings.concurrency,
        poll_secs = settings.poll_interval.as_secs(),
        "descriptor worker started"
    );

    loop {
        let available = semaphore.available_permits();
        if available > 0 {
            match queue.claim(available as i64, JOB_LEASE).await {
                Ok(jobs) => {
                    for job in jobs {
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(err) => {
                                error!(?err, "worker semaphore closed");
                                return;
                            }
                        };
                        spawn_job(pipeline.clone(), queue.clone(), permit, job);
                    }
                }
                Err(err) => error!(?err, "failed to claim descriptor jobs"),
            }
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = sleep(settings.poll_interval) => {}
        }
    }

    info!("descriptor worker stopping, waiting for running jobs");
    let all = u32::try_from(settings.concurrency).unwrap_or(u32::MAX);
    if let Err(err) = semaphore.acquire_many(all).await {
        error!(?err, "failed to wait for running descriptor jobs");
    }
}

fn spawn_job(
    pipeline: Arc<Pipeline>,
    queue: PgTaskQueue,
    permit: OwnedSemaphorePermit,
    job: ClaimedJob,
) {
    tokio::spawn(async move {
        let _permit = permit;
        let descriptor_id = job.descriptor_id;

        let result = if job.strict {
            pipeline.process_strict(descriptor_id).await
        } else {
            pipeline.process(descriptor_id).await
        };
        match result {
            Ok(outcome) => info!(%descriptor_id, ?outcome, strict = job.strict, "descriptor job finished"),
            Err(err) => error!(?err, %descriptor_id, "descriptor job failed"),
        }

        if let Err(err) = queue.complete(&job).await {
            error!(?err, %descriptor_id, "failed to complete descriptor job");
        }
    });
}
