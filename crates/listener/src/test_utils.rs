use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use commit_status_core::{
    config::{DbConfig, NodeConfig, PublishingConfig, WorkerConfig},
    models::{
        BuildRef, BuildState, BuildStatus, Event, ParameterScopes, ProblemRecord, PromotionId,
        PublisherDescriptor, RootRevision, VcsRootInstance,
    },
};
use commit_status_db::Database;
use commit_status_jobs::{MultiNodeTasks, WorkerPool};
use commit_status_publisher::{
    PublishRequest, PublisherFactory, PublisherRegistry, StatusPublisher,
};
use futures_util::future::BoxFuture;
use tempfile::TempDir;

use crate::{
    CommitStatusPublisherListener, ProblemAggregator, PublishTaskHandler, SharedBuildStore,
};

pub const MOCK_PUBLISHER_ID: &str = "mockPublisher";
pub const PUBLISHER_ERROR: &str = "Simulated publisher exception";
pub const BUILD_TYPE_ID: &str = "Project_Build";
pub const FEATURE_ID: &str = "BUILD_EXT_1";

const TIMEOUT: Duration = Duration::from_secs(5);

pub async fn open_database() -> (TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("publisher.db").display());
    let db = Database::new(&DbConfig { url }).await.unwrap();
    (dir, Arc::new(db))
}

#[derive(Debug, Clone)]
pub struct Received {
    pub event: Event,
    pub revision: Option<String>,
    pub success: bool,
    pub comment: Option<String>,
}

/// Records what it was asked to publish, or fails every request.
#[derive(Default)]
pub struct MockPublisher {
    received: Mutex<Vec<Received>>,
    fail: AtomicBool,
}

impl MockPublisher {
    pub fn should_fail(&self) { self.fail.store(true, Ordering::SeqCst); }

    pub fn events(&self) -> Vec<Event> {
        self.received.lock().unwrap().iter().map(|r| r.event).collect()
    }

    pub fn received(&self, event: Event) -> usize {
        self.received.lock().unwrap().iter().filter(|r| r.event == event).count()
    }

    pub fn success_received(&self) -> usize {
        let received = self.received.lock().unwrap();
        received.iter().filter(|r| r.event == Event::Finished && r.success).count()
    }

    pub fn last_comment(&self) -> Option<String> {
        self.received.lock().unwrap().iter().rev().find_map(|r| r.comment.clone())
    }

    pub fn revisions(&self, event: Event) -> Vec<String> {
        let received = self.received.lock().unwrap();
        let mut revisions = received
            .iter()
            .filter(|r| r.event == event)
            .filter_map(|r| r.revision.clone())
            .collect::<Vec<_>>();
        revisions.sort();
        revisions
    }
}

impl StatusPublisher for MockPublisher {
    fn publish<'a>(&'a self, request: PublishRequest<'a>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                bail!("{PUBLISHER_ERROR}");
            }
            self.received.lock().unwrap().push(Received {
                event: request.event,
                revision: request.revision.map(str::to_string),
                success: request.build.status.is_successful(),
                comment: request.comment.map(|c| c.text.clone()),
            });
            Ok(true)
        })
    }
}

pub struct MockPublisherFactory(pub Arc<MockPublisher>);

impl PublisherFactory for MockPublisherFactory {
    fn id(&self) -> &str { MOCK_PUBLISHER_ID }

    fn display_name(&self) -> &str { "Mock" }

    fn create(&self, _descriptor: &PublisherDescriptor) -> Result<Arc<dyn StatusPublisher>> {
        Ok(self.0.clone())
    }
}

pub fn root(n: u64) -> RootRevision {
    RootRevision {
        root: VcsRootInstance {
            id: 100 + n,
            root_id: n,
            external_id: format!("Project_Vcs{n}"),
            name: format!("vcs{n}"),
        },
        revision: Some(format!("rev{n}_2")),
        collect_changes_error: None,
    }
}

pub fn build(promotion_id: u64, state: BuildState, roots: Vec<RootRevision>) -> BuildRef {
    BuildRef {
        promotion_id: PromotionId(promotion_id),
        build_id: (state != BuildState::Queued).then_some(promotion_id * 10),
        build_type_id: BUILD_TYPE_ID.to_string(),
        project_id: "Project".to_string(),
        state,
        status: BuildStatus::Normal,
        personal: false,
        roots,
        parameters: ParameterScopes::default(),
        web_url: None,
    }
}

/// A node with a running worker pool, a mock publisher and no builds yet.
pub struct Fixture {
    pub db: Arc<Database>,
    pub builds: Arc<SharedBuildStore>,
    pub registry: Arc<PublisherRegistry>,
    pub tasks: MultiNodeTasks,
    pub problems: ProblemAggregator,
    pub listener: CommitStatusPublisherListener,
    pub publisher: Arc<MockPublisher>,
    pool: WorkerPool,
    _dir: Option<TempDir>,
}

impl Fixture {
    pub async fn new() -> Self { Self::with_global_enabled(true).await }

    pub async fn with_global_enabled(enabled: bool) -> Self {
        let (dir, db) = open_database().await;
        let mut fixture = Self::node(db.clone(), db, "node-1", true, enabled);
        fixture._dir = Some(dir);
        fixture
    }

    /// Another node of the same cluster, with its own registry and publisher.
    pub fn join(&self, node_id: &str, process_tasks: bool) -> Self {
        Self::node(self.db.clone(), self.db.clone(), node_id, process_tasks, true)
    }

    /// Builds and problems live in `db`, tasks in `tasks_db`.
    pub fn node(
        db: Arc<Database>,
        tasks_db: Arc<Database>,
        node_id: &str,
        process_tasks: bool,
        enabled: bool,
    ) -> Self {
        let publisher = Arc::new(MockPublisher::default());
        let registry = Arc::new(
            PublisherRegistry::new().with_factory(MockPublisherFactory(publisher.clone())),
        );
        let builds = Arc::new(SharedBuildStore::new(db.clone()));
        let tasks = MultiNodeTasks::new(tasks_db, &NodeConfig {
            id: node_id.to_string(),
            process_tasks,
        });
        let problems = ProblemAggregator::new(db.clone());
        let handler = PublishTaskHandler::new(builds.clone(), registry.clone(), problems.clone());
        let pool = WorkerPool::start(tasks.clone(), Arc::new(handler), &WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 20,
            ..Default::default()
        });
        let listener = CommitStatusPublisherListener::new(
            &PublishingConfig { enabled },
            builds.clone(),
            registry.clone(),
            tasks.clone(),
            problems.clone(),
        );
        Self { db, builds, registry, tasks, problems, listener, publisher, pool, _dir: None }
    }

    /// Adds the mock publisher feature, optionally restricted to one root.
    pub async fn add_feature(&self, vcs_root_id: Option<&str>) {
        self.registry
            .add_feature(PublisherDescriptor {
                id: FEATURE_ID.to_string(),
                publisher_id: MOCK_PUBLISHER_ID.to_string(),
                build_type_id: BUILD_TYPE_ID.to_string(),
                vcs_root_id: vcs_root_id.map(str::to_string),
                params: HashMap::new(),
            })
            .await
            .unwrap();
    }

    pub async fn put(&self, build: BuildRef) -> PromotionId {
        self.builds.upsert(&build).await.unwrap();
        build.promotion_id
    }

    /// Waits until tasks of this type exist and have all finished.
    pub async fn wait_for(&self, event: Event) -> bool {
        self.tasks.wait_for_finished(&[event.name()], TIMEOUT).await.unwrap()
    }

    pub async fn task_count(&self, event: Event) -> usize {
        self.tasks.find_tasks(&[event.name()]).await.unwrap().len()
    }

    pub async fn problems(&self) -> Vec<ProblemRecord> {
        self.problems.get_problems(BUILD_TYPE_ID).await.unwrap()
    }

    pub async fn report_build_problem(&self, description: &str) {
        self.problems.report_problem(BUILD_TYPE_ID, FEATURE_ID, description).await.unwrap();
    }

    pub async fn shutdown(self) { self.pool.shutdown().await }
}
