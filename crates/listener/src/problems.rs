use std::sync::Arc;

use anyhow::Result;
use commit_status_core::models::{BuildRef, ProblemRecord, WorkItem};
use commit_status_db::Database;

const PROBLEM_PREFIX: &str = "Commit Status Publisher";

/// Publishing problems attached to build configurations.
///
/// Problems are keyed by build configuration and feature id; identical
/// descriptions are stored once.
#[derive(Clone)]
pub struct ProblemAggregator {
    db: Arc<Database>,
}

impl ProblemAggregator {
    pub fn new(db: Arc<Database>) -> Self { Self { db } }

    pub async fn report_problem(
        &self,
        entity_id: &str,
        publisher_id: &str,
        description: &str,
    ) -> Result<()> {
        if self.db.report_problem(entity_id, publisher_id, description).await? {
            tracing::warn!(entity = entity_id, publisher = publisher_id, "{description}");
        } else {
            tracing::debug!(
                entity = entity_id,
                publisher = publisher_id,
                "Problem already reported"
            );
        }
        Ok(())
    }

    pub async fn get_problems(&self, entity_id: &str) -> Result<Vec<ProblemRecord>> {
        self.db.get_problems(entity_id).await
    }

    pub async fn clear_problems(&self, entity_id: &str, publisher_id: &str) -> Result<()> {
        let cleared = self.db.clear_problems(entity_id, publisher_id).await?;
        if cleared > 0 {
            tracing::info!(
                entity = entity_id,
                publisher = publisher_id,
                "Cleared {cleared} problems"
            );
        }
        Ok(())
    }

    /// Records a failed publish. Store failures are logged, never propagated.
    pub async fn report_publish_failure(
        &self,
        item: &WorkItem,
        build: &BuildRef,
        error: &anyhow::Error,
    ) {
        self.report_item_problem(item, publish_failure_description(item, build, error)).await;
    }

    /// Records a task that ran without its build snapshot at hand.
    pub async fn report_publish_failure_without_build(
        &self,
        item: &WorkItem,
        error: &anyhow::Error,
    ) {
        let build = format!("{} (promotion {})", item.build_type_id, item.promotion_id);
        self.report_item_problem(item, failure_description(item, &build, error)).await;
    }

    /// Records a task that could not be scheduled.
    pub async fn report_scheduling_failure(
        &self,
        item: &WorkItem,
        build: &BuildRef,
        error: &anyhow::Error,
    ) {
        let description = format!(
            "{PROBLEM_PREFIX} could not schedule publishing. Publisher: {} (feature {}), method: {}, build: {}: {error:#}",
            item.publisher_id,
            item.feature_id,
            item.event.name(),
            build.describe(),
        );
        self.report_item_problem(item, description).await;
    }

    async fn report_item_problem(&self, item: &WorkItem, description: String) {
        let result =
            self.report_problem(&item.build_type_id, &item.feature_id, &description).await;
        if let Err(e) = result {
            tracing::error!(
                "Failed to record problem for {}: {e:?}\n{description}",
                item.feature_id
            );
        }
    }
}

pub fn publish_failure_description(
    item: &WorkItem,
    build: &BuildRef,
    error: &anyhow::Error,
) -> String {
    failure_description(item, &build.describe(), error)
}

fn failure_description(item: &WorkItem, build: &str, error: &anyhow::Error) -> String {
    format!(
        "{PROBLEM_PREFIX} has failed to publish status. Publisher: {} (feature {}), method: {}, build: {build}, revision: {}: {error:#}",
        item.publisher_id,
        item.feature_id,
        item.event.name(),
        item.revision.as_deref().unwrap_or("none"),
    )
}
