mod worker;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use commit_status_core::config::NodeConfig;
pub use commit_status_db::Task as TaskHandle;
use commit_status_db::{Database, NewTask};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::Notify, time::sleep};
pub use worker::{TaskHandler, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Failed to encode {task_type} task payload")]
    Payload {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Task store unavailable while submitting {task_type} task")]
    Store {
        task_type: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Result of [`MultiNodeTasks::submit`].
#[derive(Debug, Clone)]
pub struct Submitted {
    pub task: TaskHandle,
    /// The task already existed under the same dedup key; nothing was added.
    pub deduplicated: bool,
}

/// Cluster-wide task queue backed by the shared database.
///
/// Any node may submit tasks. Nodes with `process_tasks` enabled run a
/// [`WorkerPool`] that claims pending tasks; a claim is a conditional update
/// on the task row, so each task runs on exactly one node.
#[derive(Clone)]
pub struct MultiNodeTasks {
    db: Arc<Database>,
    node_id: Arc<str>,
    process_tasks: bool,
    wakeup: Arc<Notify>,
}

impl MultiNodeTasks {
    pub fn new(db: Arc<Database>, node: &NodeConfig) -> Self {
        Self {
            db,
            node_id: node.id.as_str().into(),
            process_tasks: node.process_tasks,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn node_id(&self) -> &str { &self.node_id }

    pub fn processes_tasks(&self) -> bool { self.process_tasks }

    /// Durably records a pending task.
    ///
    /// When `dedup_key` is set and a task of the same type with that key exists
    /// (in any state), the existing task is returned instead.
    pub async fn submit<T: Serialize>(
        &self,
        task_type: &str,
        payload: &T,
        dedup_key: Option<&str>,
    ) -> Result<Submitted, SchedulingError> {
        let payload = serde_json::to_string(payload).map_err(|source| {
            SchedulingError::Payload { task_type: task_type.to_string(), source }
        })?;
        let store_error = |source: sqlx::Error| SchedulingError::Store {
            task_type: task_type.to_string(),
            source,
        };
        let inserted = self
            .db
            .insert_task(NewTask {
                task_type,
                payload: &payload,
                dedup_key,
                submitted_by: &self.node_id,
            })
            .await
            .map_err(store_error)?;
        if let Some(task) = inserted {
            tracing::debug!(id = task.id, task_type, node = %self.node_id, "Submitted task");
            self.wakeup.notify_one();
            return Ok(Submitted { task, deduplicated: false });
        }
        // Conflict: only possible with a dedup key
        let key = dedup_key.unwrap_or_default();
        let existing = self
            .db
            .get_task_by_dedup_key(task_type, key)
            .await
            .map_err(store_error)?
            .ok_or_else(|| store_error(sqlx::Error::RowNotFound))?;
        tracing::debug!(
            id = existing.id,
            task_type,
            dedup_key = key,
            "Task already submitted, skipping"
        );
        Ok(Submitted { task: existing, deduplicated: true })
    }

    /// Whether a task of this type was already submitted under `dedup_key`.
    pub async fn is_submitted(&self, task_type: &str, dedup_key: &str) -> Result<bool> {
        Ok(self.db.get_task_by_dedup_key(task_type, dedup_key).await?.is_some())
    }

    /// All tasks of the given types, in any state.
    pub async fn find_tasks(&self, task_types: &[&str]) -> Result<Vec<TaskHandle>> {
        self.db.find_tasks(task_types).await
    }

    /// Finished tasks of the given types that finished within `max_age`.
    pub async fn find_finished_tasks(
        &self,
        task_types: &[&str],
        max_age: Duration,
    ) -> Result<Vec<TaskHandle>> {
        self.db.find_finished_tasks(task_types, OffsetDateTime::now_utc() - max_age).await
    }

    /// Waits until at least one task of the given types exists and all of them have finished.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_for_finished(&self, task_types: &[&str], timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(10);
        loop {
            if self.db.count_unfinished_tasks(task_types).await? == 0
                && !self.db.find_tasks(task_types).await?.is_empty()
            {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(250));
        }
    }

    /// Deletes finished tasks older than `older_than`.
    pub async fn prune_finished(&self, older_than: Duration) -> Result<u64> {
        let pruned = self.db.prune_finished_tasks(OffsetDateTime::now_utc() - older_than).await?;
        if pruned > 0 {
            tracing::info!("Pruned {} finished tasks", pruned);
        }
        Ok(pruned)
    }
}
