use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::PublisherDescriptor;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub db: DbConfig,
    /// Separate store for the task queue. Builds and problems stay in `db`,
    /// so a task store outage can still be reported as a problem.
    #[serde(default)]
    pub tasks_db: Option<DbConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    pub github: Option<GitHubConfig>,
    /// Publisher features configured per build configuration.
    #[serde(default)]
    pub features: Vec<PublisherDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

/// Identity of this node within the cluster sharing the task store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub id: String,
    /// Whether this node claims and executes tasks. Nodes that are not
    /// responsible for publishing still accept hooks and submit tasks.
    #[serde(default = "default_true")]
    pub process_tasks: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of tasks executing at once on this node.
    pub concurrency: usize,
    /// Interval between polls of the task store when idle.
    pub poll_interval_ms: u64,
    /// Finished tasks older than this are pruned.
    pub task_retention_hours: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 4, poll_interval_ms: 500, task_retention_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishingConfig {
    /// Server-wide fallback for the `commitStatusPublisher.enabled` parameter.
    pub enabled: bool,
}

impl Default for PublishingConfig {
    fn default() -> Self { Self { enabled: true } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    pub api_url: Option<Url>,
}

fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 8080
node:
  id: node-1
db:
  url: sqlite://data/csp.db
"#,
        )
        .unwrap();
        assert!(config.node.process_tasks);
        assert!(config.publishing.enabled);
        assert_eq!(config.worker.concurrency, 4);
        assert!(config.features.is_empty());
        assert!(config.github.is_none());
        assert!(config.tasks_db.is_none());
    }

    #[test]
    fn test_parse_features() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 8080
node:
  id: node-2
  process_tasks: false
db:
  url: sqlite://data/csp.db
tasks_db:
  url: sqlite://data/tasks.db
publishing:
  enabled: false
github:
  token: ghp_example
  api_url: https://github.example.com/api/v3/
features:
  - id: BUILD_EXT_1
    publisher_id: githubStatusPublisher
    build_type_id: Project_Build
    vcs_root_id: Project_Repo
    params:
      github.owner: acme
      github.repo: widgets
"#,
        )
        .unwrap();
        assert!(!config.node.process_tasks);
        assert!(!config.publishing.enabled);
        assert_eq!(config.tasks_db.unwrap().url, "sqlite://data/tasks.db");
        let github = config.github.unwrap();
        assert_eq!(github.api_url.unwrap().host_str(), Some("github.example.com"));
        let feature = &config.features[0];
        assert_eq!(feature.vcs_root_id.as_deref(), Some("Project_Repo"));
        assert_eq!(feature.params.get("github.repo").map(String::as_str), Some("widgets"));
    }
}
