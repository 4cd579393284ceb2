use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::AppState;

mod hooks;
mod problems;
mod tasks;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(tasks::get_health))
        .route("/api/hooks/{hook}", post(hooks::post_hook))
        .route("/api/problems/{entity}", get(problems::get_problems))
        .route("/api/tasks", get(tasks::get_tasks))
}

pub enum AppError {
    Status(StatusCode, String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Status(status, message) => {
                (status, Json(json!({ "error": message }))).into_response()
            }
            Self::Internal(err) => {
                tracing::error!("{:?}", err);
                let message = format!("Something went wrong: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message })))
                    .into_response()
            }
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self { Self::Internal(err.into()) }
}
