use anyhow::Result;
use commit_status_core::models::TaskState;
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use time::OffsetDateTime;

use crate::{Database, from_millis, now_millis, to_millis};

const TASK_COLUMNS: &str = "id, task_type, payload, dedup_key, state, submitted_by, node_id, \
                            error, created_at, claimed_at, finished_at";

/// A task row as stored in the shared task table.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub task_type: String,
    /// JSON-encoded payload.
    pub payload: String,
    pub dedup_key: Option<String>,
    pub state: TaskState,
    /// Node that submitted the task.
    pub submitted_by: String,
    /// Node that claimed the task, once claimed.
    pub node_id: Option<String>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Task {
    pub fn is_finished(&self) -> bool { self.state == TaskState::Finished }
}

pub struct NewTask<'a> {
    pub task_type: &'a str,
    pub payload: &'a str,
    pub dedup_key: Option<&'a str>,
    pub submitted_by: &'a str,
}

fn task_from_row(row: &SqliteRow) -> sqlx::Result<Task> {
    let state: String = row.try_get("state")?;
    let state = state
        .parse::<TaskState>()
        .map_err(|_| sqlx::Error::Protocol(format!("Unknown task state: {state}")))?;
    Ok(Task {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        payload: row.try_get("payload")?,
        dedup_key: row.try_get("dedup_key")?,
        state,
        submitted_by: row.try_get("submitted_by")?,
        node_id: row.try_get("node_id")?,
        error: row.try_get("error")?,
        created_at: from_millis(row.try_get("created_at")?),
        claimed_at: row.try_get::<Option<i64>, _>("claimed_at")?.map(from_millis),
        finished_at: row.try_get::<Option<i64>, _>("finished_at")?.map(from_millis),
    })
}

fn push_type_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, task_types: &'a [&'a str]) {
    builder.push(" WHERE task_type IN (");
    let mut separated = builder.separated(", ");
    for task_type in task_types {
        separated.push_bind(*task_type);
    }
    separated.push_unseparated(")");
}

impl Database {
    /// Records a new pending task.
    ///
    /// Returns `None` if a task with the same type and dedup key already exists.
    pub async fn insert_task(&self, task: NewTask<'_>) -> sqlx::Result<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (task_type, payload, dedup_key, state, submitted_by, created_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            ON CONFLICT (task_type, dedup_key) DO NOTHING
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.task_type)
        .bind(task.payload)
        .bind(task.dedup_key)
        .bind(task.submitted_by)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    pub async fn get_task_by_dedup_key(
        &self,
        task_type: &str,
        dedup_key: &str,
    ) -> sqlx::Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_type = ? AND dedup_key = ?"
        ))
        .bind(task_type)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Tasks of the given types in any state, oldest first.
    pub async fn find_tasks(&self, task_types: &[&str]) -> Result<Vec<Task>> {
        if task_types.is_empty() {
            return Ok(vec![]);
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        push_type_filter(&mut builder, task_types);
        builder.push(" ORDER BY id");
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(task_from_row).collect::<sqlx::Result<_>>()?)
    }

    /// Finished tasks of the given types that finished at or after `since`.
    pub async fn find_finished_tasks(
        &self,
        task_types: &[&str],
        since: OffsetDateTime,
    ) -> Result<Vec<Task>> {
        if task_types.is_empty() {
            return Ok(vec![]);
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        push_type_filter(&mut builder, task_types);
        builder
            .push(" AND state = 'finished' AND finished_at >= ")
            .push_bind(to_millis(since))
            .push(" ORDER BY id");
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(task_from_row).collect::<sqlx::Result<_>>()?)
    }

    /// Number of tasks of the given types that are not finished yet.
    pub async fn count_unfinished_tasks(&self, task_types: &[&str]) -> Result<i64> {
        if task_types.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tasks");
        push_type_filter(&mut builder, task_types);
        builder.push(" AND state != 'finished'");
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    /// Oldest pending tasks of the given types.
    pub async fn pending_tasks(&self, task_types: &[&str], limit: usize) -> Result<Vec<Task>> {
        if task_types.is_empty() || limit == 0 {
            return Ok(vec![]);
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        push_type_filter(&mut builder, task_types);
        builder.push(" AND state = 'pending' ORDER BY id LIMIT ").push_bind(limit as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(task_from_row).collect::<sqlx::Result<_>>()?)
    }

    /// Atomically moves a pending task to running on behalf of `node_id`.
    ///
    /// Exactly one caller wins; every other node (or worker) gets `false`.
    pub async fn claim_task(&self, id: i64, node_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'running', node_id = ?, claimed_at = ?
            WHERE id = ? AND state = 'pending'
            "#,
        )
        .bind(node_id)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Marks a task claimed by `node_id` as finished, recording the error if any.
    pub async fn finish_task(&self, id: i64, node_id: &str, error: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'finished', error = ?, finished_at = ?
            WHERE id = ? AND node_id = ? AND state = 'running'
            "#,
        )
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes finished tasks that finished before `before`.
    pub async fn prune_finished_tasks(&self, before: OffsetDateTime) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM tasks WHERE state = 'finished' AND finished_at < ?")
                .bind(to_millis(before))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
