//! Decides which notifications a lifecycle event produces.

use commit_status_core::models::{
    BuildEvent, BuildRef, Event, PublisherDescriptor, RootRevision, WorkItem,
};

/// Why an event produced no work at all. Not an error: the event simply doesn't apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateRejection {
    #[error("publishing is disabled")]
    Disabled,
    #[error("personal builds are not published")]
    PersonalBuild,
    #[error("status change is not a new failure")]
    NotAFailure,
    #[error("event does not apply to a build in this state")]
    WrongBuildState,
    #[error("build has already finished")]
    AlreadyFinished,
}

/// Turns one lifecycle event into the work items to publish.
///
/// `enabled` is the resolved publishing flag for the build and `publishers` the
/// features of its build configuration.
pub fn evaluate(
    event: &BuildEvent,
    build: &BuildRef,
    enabled: bool,
    publishers: &[PublisherDescriptor],
) -> Result<Vec<WorkItem>, GateRejection> {
    if !enabled {
        return Err(GateRejection::Disabled);
    }
    if build.personal {
        return Err(GateRejection::PersonalBuild);
    }
    let Some(kind) = event.classify() else {
        return Err(GateRejection::NotAFailure);
    };
    if kind.is_queue_event() != build.is_queued() {
        return Err(GateRejection::WrongBuildState);
    }
    if build.is_finished() && matches!(kind, Event::Started | Event::FailureDetected) {
        return Err(GateRejection::AlreadyFinished);
    }

    let mut items = Vec::new();
    for publisher in publishers.iter().filter(|p| p.build_type_id == build.build_type_id) {
        let mut targets = build.roots.iter().filter(|r| publisher.applies_to(&r.root));
        if kind.is_queue_event() {
            // Queued builds have no revisions yet: one item per publisher, not per root
            let target = targets.next();
            if target.is_none() && publisher.is_restricted() {
                continue;
            }
            items.push(work_item(kind, event, build, publisher, target));
            continue;
        }
        for target in targets {
            if target.revision.is_none() {
                tracing::debug!(
                    "No revision for root {} of {}, skipping {}",
                    target.root.external_id,
                    build.describe(),
                    kind
                );
                continue;
            }
            if kind == Event::FailureDetected && target.collect_changes_error.is_some() {
                tracing::debug!(
                    "Failed to collect changes for root {} of {}, skipping {}",
                    target.root.external_id,
                    build.describe(),
                    kind
                );
                continue;
            }
            items.push(work_item(kind, event, build, publisher, Some(target)));
        }
    }
    Ok(items)
}

fn work_item(
    kind: Event,
    event: &BuildEvent,
    build: &BuildRef,
    publisher: &PublisherDescriptor,
    target: Option<&RootRevision>,
) -> WorkItem {
    WorkItem {
        event: kind,
        feature_id: publisher.id.clone(),
        publisher_id: publisher.publisher_id.clone(),
        build_type_id: build.build_type_id.clone(),
        promotion_id: build.promotion_id,
        root: target.map(|t| t.root.clone()),
        revision: target.and_then(|t| t.revision.clone()),
        comment: event.comment().cloned(),
    }
}
