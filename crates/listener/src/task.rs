use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use commit_status_core::models::{Event, WorkItem};
use commit_status_jobs::{TaskHandle, TaskHandler};
use commit_status_publisher::{PublishRequest, PublisherRegistry};
use futures_util::future::BoxFuture;

use crate::{build_store::BuildStore, problems::ProblemAggregator};

/// Executes publish tasks: one work item per task, for every event type.
pub struct PublishTaskHandler {
    builds: Arc<dyn BuildStore>,
    registry: Arc<PublisherRegistry>,
    problems: ProblemAggregator,
}

impl PublishTaskHandler {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        registry: Arc<PublisherRegistry>,
        problems: ProblemAggregator,
    ) -> Self {
        Self { builds, registry, problems }
    }

    async fn publish(&self, item: &WorkItem) -> Result<()> {
        let build = match self.builds.build(item.promotion_id).await {
            Ok(Some(build)) => build,
            Ok(None) => {
                let error = anyhow!("Build with promotion {} not found", item.promotion_id);
                self.problems.report_publish_failure_without_build(item, &error).await;
                return Err(error);
            }
            Err(e) => {
                self.problems.report_publish_failure_without_build(item, &e).await;
                return Err(e);
            }
        };
        let Some(descriptor) = self.registry.feature(&item.build_type_id, &item.feature_id).await
        else {
            let error = anyhow!("Feature {} not found in {}", item.feature_id, item.build_type_id);
            self.problems.report_publish_failure(item, &build, &error).await;
            return Err(error);
        };

        let result = async {
            let publisher = self.registry.publisher(&descriptor).await?;
            publisher
                .publish(PublishRequest {
                    event: item.event,
                    build: &build,
                    root: item.root.as_ref(),
                    revision: item.revision.as_deref(),
                    comment: item.comment.as_ref(),
                })
                .await
        }
        .await;

        match result {
            Ok(true) => {
                tracing::info!(
                    feature = %item.feature_id,
                    revision = item.revision.as_deref().unwrap_or("-"),
                    "Published {} for {}",
                    item.event,
                    build.describe()
                );
                Ok(())
            }
            Ok(false) => {
                tracing::debug!(feature = %item.feature_id, "{} not applicable", item.event);
                Ok(())
            }
            Err(e) => {
                self.problems.report_publish_failure(item, &build, &e).await;
                Err(e)
            }
        }
    }
}

impl TaskHandler for PublishTaskHandler {
    fn task_types(&self) -> Vec<String> {
        Event::variants().iter().map(|event| event.name().to_string()).collect()
    }

    fn run<'a>(&'a self, task: TaskHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let item: WorkItem = serde_json::from_str(&task.payload).with_context(|| {
                format!("Invalid payload for {} task {}", task.task_type, task.id)
            })?;
            self.publish(&item).await
        })
    }
}
