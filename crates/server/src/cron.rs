use std::time::Duration;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::AppState;

pub type Scheduler = JobScheduler;

pub async fn create(state: AppState, retention: Duration) -> Result<Scheduler> {
    let sched = JobScheduler::new().await?;

    // Every hour: Drop finished tasks and builds past the retention period
    sched
        .add(Job::new_async("every 1 hour", move |_uuid, _l| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = state.tasks.prune_finished(retention).await {
                    tracing::error!("Failed to prune finished tasks: {:?}", e);
                }
                if let Err(e) = state.builds.prune_finished(retention).await {
                    tracing::error!("Failed to prune finished builds: {:?}", e);
                }
            })
        })?)
        .await?;

    sched.start().await?;
    Ok(sched)
}
