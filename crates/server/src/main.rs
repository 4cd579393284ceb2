mod cron;
mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    extract::FromRef,
    http::{StatusCode, header},
};
use commit_status_core::config::Config;
use commit_status_db::Database;
use commit_status_jobs::{MultiNodeTasks, WorkerPool};
use commit_status_listener::{
    CommitStatusPublisherListener, ProblemAggregator, PublishTaskHandler, SharedBuildStore,
};
use commit_status_publisher::{PublisherRegistry, github::GitHubPublisherFactory};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    builds: Arc<SharedBuildStore>,
    listener: Arc<CommitStatusPublisherListener>,
    problems: ProblemAggregator,
    tasks: MultiNodeTasks,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yml".to_string());
    let config: Config = {
        let file = BufReader::new(File::open(&config_path).expect("Failed to open config file"));
        serde_yaml::from_reader(file).expect("Failed to parse config file")
    };
    let db = Arc::new(Database::new(&config.db).await.expect("Failed to open database"));
    let tasks_db = match &config.tasks_db {
        Some(tasks_db) => {
            Arc::new(Database::new(tasks_db).await.expect("Failed to open task database"))
        }
        None => db.clone(),
    };

    let mut registry = PublisherRegistry::new();
    if let Some(github) = &config.github {
        registry = registry.with_factory(
            GitHubPublisherFactory::new(github).expect("Failed to create GitHub client"),
        );
    }
    let registry = Arc::new(registry);
    for feature in &config.features {
        registry.add_feature(feature.clone()).await.expect("Invalid publisher feature");
    }
    tracing::info!("Loaded {} publisher features", config.features.len());

    let builds = Arc::new(SharedBuildStore::new(db.clone()));
    let tasks = MultiNodeTasks::new(tasks_db.clone(), &config.node);
    let problems = ProblemAggregator::new(db.clone());
    let handler = PublishTaskHandler::new(builds.clone(), registry.clone(), problems.clone());
    let pool = WorkerPool::start(tasks.clone(), Arc::new(handler), &config.worker);
    let listener = CommitStatusPublisherListener::new(
        &config.publishing,
        builds.clone(),
        registry,
        tasks.clone(),
        problems.clone(),
    );
    let state = AppState { builds, listener: Arc::new(listener), problems, tasks };

    // Start the maintenance scheduler
    let retention = Duration::from_secs(config.worker.task_retention_hours * 3600);
    let mut scheduler =
        cron::create(state.clone(), retention).await.expect("Failed to create scheduler");

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    tracing::info!(node = %config.node.id, "Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");
    let result = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server error");
    if let Err(e) = result {
        tracing::error!("{e:?}");
    }
    tracing::info!("Web server stopped");

    pool.shutdown().await;
    scheduler.shutdown().await.expect("Failed to shut down scheduler");
    tasks_db.close().await;
    db.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(vec![header::AUTHORIZATION].into())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
