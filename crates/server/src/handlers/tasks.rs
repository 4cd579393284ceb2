use axum::{
    Json,
    extract::{Query, State},
};
use commit_status_core::models::Event;
use commit_status_jobs::{MultiNodeTasks, TaskHandle};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppError;

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    /// Comma-separated task types; all event types if absent.
    #[serde(rename = "type")]
    task_type: Option<String>,
}

pub async fn get_tasks(
    State(tasks): State<MultiNodeTasks>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<TaskHandle>>, AppError> {
    let types: Vec<&str> = match &query.task_type {
        Some(types) => types.split(',').map(str::trim).filter(|t| !t.is_empty()).collect(),
        None => Event::variants().iter().map(|event| event.name()).collect(),
    };
    Ok(Json(tasks.find_tasks(&types).await?))
}

pub async fn get_health(State(tasks): State<MultiNodeTasks>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node": tasks.node_id(),
        "processes_tasks": tasks.processes_tasks(),
    }))
}
