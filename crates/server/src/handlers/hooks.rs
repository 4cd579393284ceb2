use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use commit_status_core::models::{BuildRef, BuildStatus, Comment};
use commit_status_listener::{CommitStatusPublisherListener, SharedBuildStore};
use serde::{Deserialize, Serialize};

use super::AppError;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Hook {
    Queued,
    RemovedFromQueue,
    ChangesLoaded,
    Commented,
    StatusChanged,
    Interrupted,
    Finished,
}

/// Current build snapshot plus the fields specific to the hook.
#[derive(Debug, Deserialize)]
pub struct HookRequest {
    build: BuildRef,
    #[serde(default)]
    comment: Option<Comment>,
    #[serde(default)]
    old_status: Option<BuildStatus>,
    #[serde(default)]
    new_status: Option<BuildStatus>,
}

#[derive(Debug, Serialize)]
pub struct HookResponse {
    scheduled: usize,
}

pub async fn post_hook(
    State(builds): State<Arc<SharedBuildStore>>,
    State(listener): State<Arc<CommitStatusPublisherListener>>,
    Path(hook): Path<Hook>,
    Json(request): Json<HookRequest>,
) -> Result<Json<HookResponse>, AppError> {
    let HookRequest { build, comment, old_status, new_status } = request;
    let promotion_id = build.promotion_id;
    let statuses = match (hook, old_status, new_status) {
        (Hook::StatusChanged, Some(old), Some(new)) => Some((old, new)),
        (Hook::StatusChanged, _, _) => {
            return Err(bad_request("status-changed requires old_status and new_status"));
        }
        _ => None,
    };
    if matches!(hook, Hook::Commented) && comment.is_none() {
        return Err(bad_request("commented requires a comment"));
    }

    builds.upsert(&build).await?;
    let scheduled = match hook {
        Hook::Queued => listener.build_type_added_to_queue(promotion_id).await,
        Hook::RemovedFromQueue => listener.build_removed_from_queue(promotion_id, comment).await,
        Hook::ChangesLoaded => listener.changes_loaded(promotion_id).await,
        Hook::Commented => match comment {
            Some(comment) => listener.build_commented(promotion_id, comment).await,
            None => 0,
        },
        Hook::StatusChanged => match statuses {
            Some((old, new)) => listener.build_changed_status(promotion_id, old, new).await,
            None => 0,
        },
        Hook::Interrupted => listener.build_interrupted(promotion_id).await,
        Hook::Finished => listener.build_finished(promotion_id).await,
    };
    Ok(Json(HookResponse { scheduled }))
}

fn bad_request(message: &str) -> AppError {
    AppError::Status(StatusCode::BAD_REQUEST, message.to_string())
}
