use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::Result;
use commit_status_core::{config::WorkerConfig, models::TaskState};
use futures_util::{FutureExt, future::BoxFuture};
use tokio::{
    sync::{Semaphore, watch},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tracing::Instrument;

use crate::{MultiNodeTasks, TaskHandle};

/// Executes claimed tasks.
pub trait TaskHandler: Send + Sync + 'static {
    /// Task types this handler is responsible for.
    fn task_types(&self) -> Vec<String>;

    /// Runs one task. Errors are recorded on the task row; there are no retries.
    fn run<'a>(&'a self, task: TaskHandle) -> BoxFuture<'a, Result<()>>;
}

/// Background loop polling the shared store and executing tasks on this node.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        tasks: MultiNodeTasks,
        handler: Arc<dyn TaskHandler>,
        config: &WorkerConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        if !tasks.processes_tasks() {
            tracing::info!(node = %tasks.node_id(), "Task processing disabled on this node");
            return Self { shutdown, handle: None };
        }
        let concurrency = config.concurrency.max(1);
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(10));
        tracing::info!(
            node = %tasks.node_id(),
            concurrency,
            "Starting task workers for {:?}",
            handler.task_types()
        );
        let handle =
            tokio::spawn(run_loop(tasks, handler, concurrency, poll_interval, shutdown_rx));
        Self { shutdown, handle: Some(handle) }
    }

    /// Stops polling and waits for running tasks to complete.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle {
            if let Err(e) = handle.await {
                tracing::error!("Task worker loop failed: {e}");
            }
        }
        tracing::info!("Task workers stopped");
    }
}

async fn run_loop(
    tasks: MultiNodeTasks,
    handler: Arc<dyn TaskHandler>,
    concurrency: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let task_types = handler.task_types();
    let mut running = JoinSet::new();
    loop {
        while let Some(result) = running.try_join_next() {
            log_join_result(result);
        }
        if semaphore.available_permits() > 0 {
            if let Err(e) = poll(&tasks, &handler, &task_types, &semaphore, &mut running).await {
                tracing::warn!("Failed to poll tasks: {e:?}");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tasks.wakeup.notified() => {}
            _ = sleep(poll_interval) => {}
            Some(result) = running.join_next(), if !running.is_empty() => log_join_result(result),
        }
    }
    while let Some(result) = running.join_next().await {
        log_join_result(result);
    }
}

/// Claims as many pending tasks as there are free permits and spawns them.
async fn poll(
    tasks: &MultiNodeTasks,
    handler: &Arc<dyn TaskHandler>,
    task_types: &[String],
    semaphore: &Arc<Semaphore>,
    running: &mut JoinSet<()>,
) -> Result<()> {
    let types = task_types.iter().map(String::as_str).collect::<Vec<_>>();
    let pending = tasks.db.pending_tasks(&types, semaphore.available_permits()).await?;
    for mut task in pending {
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            break;
        };
        if !tasks.db.claim_task(task.id, tasks.node_id()).await? {
            tracing::debug!(id = task.id, "Task claimed by another worker");
            continue;
        }
        task.state = TaskState::Running;
        task.node_id = Some(tasks.node_id().to_string());
        let tasks = tasks.clone();
        let handler = handler.clone();
        running.spawn(async move {
            execute(&tasks, handler.as_ref(), task).await;
            drop(permit);
        });
    }
    Ok(())
}

async fn execute(tasks: &MultiNodeTasks, handler: &dyn TaskHandler, task: TaskHandle) {
    let id = task.id;
    let span =
        tracing::info_span!("task", id, task_type = %task.task_type, node = %tasks.node_id());
    let result = AssertUnwindSafe(handler.run(task)).catch_unwind().instrument(span.clone()).await;
    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            span.in_scope(|| tracing::warn!("Task failed: {e:#}"));
            Some(format!("{e:#}"))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            span.in_scope(|| tracing::error!("Task panicked: {message}"));
            Some(format!("Task panicked: {message}"))
        }
    };
    match tasks.db.finish_task(id, tasks.node_id(), error.as_deref()).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(id, "Task was no longer running on this node"),
        Err(e) => tracing::error!(id, "Failed to mark task finished: {e:?}"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Task execution aborted: {e}");
    }
}
