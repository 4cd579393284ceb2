use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use commit_status_core::{
    config::PublishingConfig,
    models::{BuildEvent, BuildRef, BuildStatus, Comment, Event, PromotionId, WorkItem},
    settings,
};
use commit_status_jobs::MultiNodeTasks;
use commit_status_publisher::PublisherRegistry;

use crate::{build_store::BuildStore, gate, problems::ProblemAggregator};

/// Receives build lifecycle hooks and schedules publish tasks for them.
///
/// Hooks never block on publishing and never fail: every hook returns the
/// number of tasks it submitted.
pub struct CommitStatusPublisherListener {
    builds: Arc<dyn BuildStore>,
    registry: Arc<PublisherRegistry>,
    tasks: MultiNodeTasks,
    problems: ProblemAggregator,
    publishing_enabled: bool,
}

impl CommitStatusPublisherListener {
    pub fn new(
        config: &PublishingConfig,
        builds: Arc<dyn BuildStore>,
        registry: Arc<PublisherRegistry>,
        tasks: MultiNodeTasks,
        problems: ProblemAggregator,
    ) -> Self {
        Self { builds, registry, tasks, problems, publishing_enabled: config.enabled }
    }

    pub async fn build_type_added_to_queue(&self, promotion_id: PromotionId) -> usize {
        self.on_event(promotion_id, BuildEvent::Queued).await
    }

    pub async fn build_removed_from_queue(
        &self,
        promotion_id: PromotionId,
        comment: Option<Comment>,
    ) -> usize {
        self.on_event(promotion_id, BuildEvent::RemovedFromQueue { comment }).await
    }

    pub async fn changes_loaded(&self, promotion_id: PromotionId) -> usize {
        self.on_event(promotion_id, BuildEvent::Started).await
    }

    pub async fn build_commented(&self, promotion_id: PromotionId, comment: Comment) -> usize {
        self.on_event(promotion_id, BuildEvent::Commented { comment }).await
    }

    pub async fn build_changed_status(
        &self,
        promotion_id: PromotionId,
        old: BuildStatus,
        new: BuildStatus,
    ) -> usize {
        self.on_event(promotion_id, BuildEvent::StatusChanged { old, new }).await
    }

    pub async fn build_interrupted(&self, promotion_id: PromotionId) -> usize {
        self.on_event(promotion_id, BuildEvent::Interrupted).await
    }

    pub async fn build_finished(&self, promotion_id: PromotionId) -> usize {
        self.on_event(promotion_id, BuildEvent::Finished).await
    }

    /// Runs the gate for one event and submits the resulting tasks.
    pub async fn on_event(&self, promotion_id: PromotionId, event: BuildEvent) -> usize {
        let build = match self.builds.build(promotion_id).await {
            Ok(Some(build)) => build,
            Ok(None) => {
                tracing::debug!("Unknown build with promotion {promotion_id}, ignoring {event:?}");
                return 0;
            }
            Err(e) => {
                tracing::error!("Failed to look up build with promotion {promotion_id}: {e:?}");
                return 0;
            }
        };
        let enabled = settings::publishing_enabled(&build.parameters, self.publishing_enabled);
        let publishers = self.registry.features(&build.build_type_id).await;
        let items = match gate::evaluate(&event, &build, enabled, &publishers) {
            Ok(items) => items,
            Err(rejection) => {
                tracing::debug!("Not publishing {event:?} for {}: {rejection}", build.describe());
                return 0;
            }
        };
        if items.is_empty() {
            return 0;
        }

        let items = if event == BuildEvent::Finished {
            self.start_finished_cycle(&build, items).await
        } else {
            items
        };

        let mut submitted = 0;
        for item in &items {
            let dedup_key = item.dedup_key();
            match self.tasks.submit(item.event.name(), item, dedup_key.as_deref()).await {
                Ok(result) if result.deduplicated => {}
                Ok(_) => submitted += 1,
                Err(e) => {
                    let error = anyhow::Error::from(e);
                    tracing::error!(
                        "Failed to schedule {} for {}: {error:?}",
                        item.event,
                        build.describe()
                    );
                    self.problems.report_scheduling_failure(item, &build, &error).await;
                }
            }
        }
        if submitted > 0 {
            tracing::info!("Scheduled {submitted} {event:?} tasks for {}", build.describe());
        }
        submitted
    }

    /// Drops items already published for this build and clears the previous
    /// cycle's problems of the remaining features.
    async fn start_finished_cycle(&self, build: &BuildRef, items: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            match self.already_submitted(&item).await {
                Ok(true) => tracing::debug!(
                    feature = %item.feature_id,
                    "{} already scheduled for {}",
                    Event::Finished,
                    build.describe()
                ),
                Ok(false) => fresh.push(item),
                Err(e) => {
                    tracing::warn!("Failed to look up existing tasks: {e:?}");
                    fresh.push(item);
                }
            }
        }
        let features = fresh.iter().map(|item| item.feature_id.as_str()).collect::<BTreeSet<_>>();
        for feature_id in features {
            if let Err(e) = self.problems.clear_problems(&build.build_type_id, feature_id).await {
                tracing::warn!("Failed to clear problems of {feature_id}: {e:?}");
            }
        }
        fresh
    }

    async fn already_submitted(&self, item: &WorkItem) -> Result<bool> {
        match item.dedup_key() {
            Some(key) => self.tasks.is_submitted(item.event.name(), &key).await,
            None => Ok(false),
        }
    }
}
