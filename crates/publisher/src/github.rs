use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use commit_status_core::{
    config::GitHubConfig,
    models::{BuildRef, Event, PublisherDescriptor},
};
use futures_util::future::BoxFuture;
use octocrab::{Octocrab, models::StatusState};

use crate::{PublishRequest, PublisherFactory, StatusPublisher};

pub const GITHUB_PUBLISHER_ID: &str = "githubStatusPublisher";

const OWNER_PARAM: &str = "github.owner";
const REPO_PARAM: &str = "github.repo";
const CONTEXT_PARAM: &str = "github.context";

// GitHub rejects longer descriptions
const MAX_DESCRIPTION_LEN: usize = 140;

/// Publishes build statuses as GitHub commit statuses.
pub struct GitHubPublisherFactory {
    client: Octocrab,
}

impl GitHubPublisherFactory {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(api_url) = &config.api_url {
            builder = builder.base_uri(api_url.as_str()).context("Invalid GitHub API URL")?;
        }
        let client = builder
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Self { client })
    }
}

impl PublisherFactory for GitHubPublisherFactory {
    fn id(&self) -> &str { GITHUB_PUBLISHER_ID }

    fn display_name(&self) -> &str { "GitHub" }

    fn create(&self, descriptor: &PublisherDescriptor) -> Result<Arc<dyn StatusPublisher>> {
        let param = |key: &str| {
            descriptor
                .param(key)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Feature {} is missing parameter {}", descriptor.id, key))
        };
        Ok(Arc::new(GitHubStatusPublisher {
            client: self.client.clone(),
            owner: param(OWNER_PARAM)?,
            repo: param(REPO_PARAM)?,
            context: param(CONTEXT_PARAM).unwrap_or_else(|_| descriptor.build_type_id.clone()),
        }))
    }
}

pub struct GitHubStatusPublisher {
    client: Octocrab,
    owner: String,
    repo: String,
    context: String,
}

impl StatusPublisher for GitHubStatusPublisher {
    fn publish<'a>(&'a self, request: PublishRequest<'a>) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some((state, description)) = status_for(request.event, request.build) else {
                return Ok(false);
            };
            let Some(sha) = request.revision else {
                tracing::debug!(
                    "No revision known for {} of {}, skipping GitHub status",
                    request.event,
                    request.build.describe()
                );
                return Ok(false);
            };
            let repos = self.client.repos(&self.owner, &self.repo);
            let mut builder = repos
                .create_status(sha.to_string(), state)
                .context(self.context.clone())
                .description(truncate(&description, MAX_DESCRIPTION_LEN));
            if let Some(url) = &request.build.web_url {
                builder = builder.target(url.clone());
            }
            builder.send().await.with_context(|| {
                format!("Failed to create commit status on {}/{}@{}", self.owner, self.repo, sha)
            })?;
            tracing::info!(
                "Published {:?} status for {} to {}/{}@{}",
                state,
                request.build.describe(),
                self.owner,
                self.repo,
                sha
            );
            Ok(true)
        })
    }
}

/// Commit status state and description for an event; `None` for events GitHub can't show.
fn status_for(event: Event, build: &BuildRef) -> Option<(StatusState, String)> {
    let name = build.describe();
    Some(match event {
        Event::Queued => (StatusState::Pending, format!("{name} is queued")),
        Event::RemovedFromQueue => (StatusState::Error, format!("{name} was removed from queue")),
        Event::Started => (StatusState::Pending, format!("{name} is running")),
        Event::FailureDetected => (StatusState::Failure, format!("{name} is failing")),
        Event::Interrupted => (StatusState::Error, format!("{name} was interrupted")),
        Event::Finished if build.status.is_successful() => {
            (StatusState::Success, format!("{name} has finished successfully"))
        }
        Event::Finished => (StatusState::Failure, format!("{name} has failed")),
        Event::Commented => return None,
    })
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out = value.chars().take(max - 1).collect::<String>();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use commit_status_core::models::{BuildState, BuildStatus, ParameterScopes, PromotionId};
    use url::Url;

    use super::*;

    fn build(status: BuildStatus) -> BuildRef {
        BuildRef {
            promotion_id: PromotionId(5),
            build_id: Some(42),
            build_type_id: "Project_Build".to_string(),
            project_id: "Project".to_string(),
            state: BuildState::Finished,
            status,
            personal: false,
            roots: vec![],
            parameters: ParameterScopes::default(),
            web_url: None,
        }
    }

    #[test]
    fn test_status_for_finished() {
        let (state, description) =
            status_for(Event::Finished, &build(BuildStatus::Normal)).unwrap();
        assert!(matches!(state, StatusState::Success));
        assert_eq!(description, "Project_Build #42 has finished successfully");
        let (state, _) = status_for(Event::Finished, &build(BuildStatus::Failure)).unwrap();
        assert!(matches!(state, StatusState::Failure));
        assert!(status_for(Event::Commented, &build(BuildStatus::Normal)).is_none());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 5), "abcd…");
    }

    #[tokio::test]
    async fn test_create_requires_owner_and_repo() {
        let factory = GitHubPublisherFactory::new(&GitHubConfig {
            token: "token".to_string(),
            api_url: Some(Url::parse("https://github.example.com/api/v3/").unwrap()),
        })
        .unwrap();
        let mut descriptor = PublisherDescriptor {
            id: "BUILD_EXT_1".to_string(),
            publisher_id: GITHUB_PUBLISHER_ID.to_string(),
            build_type_id: "Project_Build".to_string(),
            vcs_root_id: None,
            params: HashMap::from([(OWNER_PARAM.to_string(), "acme".to_string())]),
        };
        let err = factory.create(&descriptor).err().unwrap();
        assert!(err.to_string().contains(REPO_PARAM));
        descriptor.params.insert(REPO_PARAM.to_string(), "widgets".to_string());
        assert!(factory.create(&descriptor).is_ok());
    }

    #[tokio::test]
    async fn test_publish_reports_unreachable_api() {
        // Nothing listens on the discard port
        let factory = GitHubPublisherFactory::new(&GitHubConfig {
            token: "token".to_string(),
            api_url: Some(Url::parse("http://127.0.0.1:9/").unwrap()),
        })
        .unwrap();
        let publisher = factory
            .create(&PublisherDescriptor {
                id: "BUILD_EXT_1".to_string(),
                publisher_id: GITHUB_PUBLISHER_ID.to_string(),
                build_type_id: "Project_Build".to_string(),
                vcs_root_id: None,
                params: HashMap::from([
                    (OWNER_PARAM.to_string(), "acme".to_string()),
                    (REPO_PARAM.to_string(), "widgets".to_string()),
                ]),
            })
            .unwrap();
        let mut finished = build(BuildStatus::Normal);
        finished.web_url = Some("https://ci.example.com/build/42".to_string());
        let request = |revision| PublishRequest {
            event: Event::Finished,
            build: &finished,
            root: None,
            revision,
            comment: None,
        };

        assert!(!publisher.publish(request(None)).await.unwrap());
        let err = publisher.publish(request(Some("abc123"))).await.unwrap_err();
        assert!(
            err.to_string().contains("Failed to create commit status on acme/widgets@abc123"),
            "{err:#}"
        );
    }
}
