use axum::{
    Json,
    extract::{Path, State},
};
use commit_status_core::models::ProblemRecord;
use commit_status_listener::ProblemAggregator;

use super::AppError;

pub async fn get_problems(
    State(problems): State<ProblemAggregator>,
    Path(entity): Path<String>,
) -> Result<Json<Vec<ProblemRecord>>, AppError> {
    Ok(Json(problems.get_problems(&entity).await?))
}
