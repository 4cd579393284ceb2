use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle events that can be published to an external system.
///
/// The [`Event::name`] of each variant is stable: it is used as the task type
/// in the task store and as the operation name in problem descriptions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Queued,
    RemovedFromQueue,
    Started,
    Commented,
    FailureDetected,
    Interrupted,
    Finished,
}

impl Event {
    pub const fn variants() -> &'static [Self] {
        &[
            Self::Queued,
            Self::RemovedFromQueue,
            Self::Started,
            Self::Commented,
            Self::FailureDetected,
            Self::Interrupted,
            Self::Finished,
        ]
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued => "buildQueued",
            Self::RemovedFromQueue => "buildRemovedFromQueue",
            Self::Started => "buildStarted",
            Self::Commented => "buildCommented",
            Self::FailureDetected => "buildFailureDetected",
            Self::Interrupted => "buildInterrupted",
            Self::Finished => "buildFinished",
        }
    }

    /// Events that only make sense while the build sits in the queue.
    pub const fn is_queue_event(&self) -> bool {
        matches!(self, Self::Queued | Self::RemovedFromQueue)
    }

    /// Whether a second submission of the same work item is skipped.
    /// Comments and failure transitions can legitimately repeat within one build.
    pub const fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Commented | Self::FailureDetected)
    }
}

impl FromStr for Event {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::variants().iter().copied().find(|e| e.name() == s).ok_or(())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Identity of a build that survives the queued -> running -> finished transitions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromotionId(pub u64);

impl fmt::Display for PromotionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Queued,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    Normal,
    Warning,
    Failure,
    Error,
    Unknown,
}

impl BuildStatus {
    pub fn is_failed(&self) -> bool { matches!(self, Self::Failure | Self::Error) }

    pub fn is_successful(&self) -> bool { matches!(self, Self::Normal | Self::Warning) }
}

/// A VCS root as instantiated for a particular build configuration.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct VcsRootInstance {
    /// Id of this instance.
    pub id: u64,
    /// Internal id of the parent VCS root.
    pub root_id: u64,
    /// External id of the parent VCS root.
    pub external_id: String,
    pub name: String,
}

impl VcsRootInstance {
    /// Matches a root restriction given either as external id or as internal id.
    pub fn matches(&self, root_id: &str) -> bool {
        self.external_id == root_id || self.root_id.to_string() == root_id
    }
}

/// A root attached to a build along with the revision the build uses.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RootRevision {
    pub root: VcsRootInstance,
    /// Unknown until changes are collected, e.g. for queued builds.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub collect_changes_error: Option<String>,
}

/// Parameters visible to a build, by scope.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterScopes {
    #[serde(default)]
    pub build_type: HashMap<String, String>,
    /// Project parameters, nearest project first.
    #[serde(default)]
    pub projects: Vec<HashMap<String, String>>,
}

impl ParameterScopes {
    /// Nearest scope wins.
    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.build_type
            .get(key)
            .or_else(|| self.projects.iter().find_map(|params| params.get(key)))
            .map(String::as_str)
    }
}

/// Snapshot of a queued, running or finished build.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildRef {
    pub promotion_id: PromotionId,
    /// Assigned once the build leaves the queue.
    #[serde(default)]
    pub build_id: Option<u64>,
    pub build_type_id: String,
    pub project_id: String,
    pub state: BuildState,
    #[serde(default)]
    pub status: BuildStatus,
    #[serde(default)]
    pub personal: bool,
    #[serde(default)]
    pub roots: Vec<RootRevision>,
    #[serde(default)]
    pub parameters: ParameterScopes,
    #[serde(default)]
    pub web_url: Option<String>,
}

impl BuildRef {
    pub fn is_queued(&self) -> bool { self.state == BuildState::Queued }

    pub fn is_finished(&self) -> bool { self.state == BuildState::Finished }

    /// Short human-readable name used in logs and problem descriptions.
    pub fn describe(&self) -> String {
        match self.build_id {
            Some(build_id) => format!("{} #{}", self.build_type_id, build_id),
            None => format!("{} (queued, promotion {})", self.build_type_id, self.promotion_id),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub author: Option<String>,
    pub text: String,
}

/// Raw lifecycle notification as delivered by the build server.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildEvent {
    Queued,
    RemovedFromQueue {
        #[serde(default)]
        comment: Option<Comment>,
    },
    /// Changes were loaded for a running build, i.e. it started with known revisions.
    Started,
    Commented {
        comment: Comment,
    },
    StatusChanged {
        old: BuildStatus,
        new: BuildStatus,
    },
    Interrupted,
    Finished,
}

impl BuildEvent {
    /// Maps a raw notification to the event it publishes, if any.
    pub fn classify(&self) -> Option<Event> {
        match self {
            Self::Queued => Some(Event::Queued),
            Self::RemovedFromQueue { .. } => Some(Event::RemovedFromQueue),
            Self::Started => Some(Event::Started),
            Self::Commented { .. } => Some(Event::Commented),
            Self::StatusChanged { old, new } => {
                (!old.is_failed() && new.is_failed()).then_some(Event::FailureDetected)
            }
            Self::Interrupted => Some(Event::Interrupted),
            Self::Finished => Some(Event::Finished),
        }
    }

    pub fn comment(&self) -> Option<&Comment> {
        match self {
            Self::RemovedFromQueue { comment } => comment.as_ref(),
            Self::Commented { comment } => Some(comment),
            _ => None,
        }
    }
}

/// One configured commit status publisher feature of a build configuration.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PublisherDescriptor {
    /// Feature id, unique within the build configuration.
    pub id: String,
    /// Publisher type, e.g. `githubStatusPublisher`.
    pub publisher_id: String,
    pub build_type_id: String,
    /// Restricts publishing to one root, by external or internal id.
    #[serde(default)]
    pub vcs_root_id: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl PublisherDescriptor {
    pub fn applies_to(&self, root: &VcsRootInstance) -> bool {
        match self.vcs_root_id.as_deref() {
            Some(root_id) if !root_id.is_empty() => root.matches(root_id),
            _ => true,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.vcs_root_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn param(&self, key: &str) -> Option<&str> { self.params.get(key).map(String::as_str) }
}

/// A single notification to deliver: one event, for one publisher, build and revision.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub event: Event,
    pub feature_id: String,
    pub publisher_id: String,
    pub build_type_id: String,
    pub promotion_id: PromotionId,
    pub root: Option<VcsRootInstance>,
    pub revision: Option<String>,
    #[serde(default)]
    pub comment: Option<Comment>,
}

impl WorkItem {
    /// Key under which repeated submissions of this item collapse into one task.
    pub fn dedup_key(&self) -> Option<String> {
        if !self.event.is_idempotent() {
            return None;
        }
        Some(format!(
            "{}:{}:{}:{}",
            self.promotion_id,
            self.feature_id,
            self.root.as_ref().map_or_else(|| "-".to_string(), |root| root.id.to_string()),
            self.revision.as_deref().unwrap_or("-"),
        ))
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    /// Build configuration the problem is attached to.
    pub entity_id: String,
    pub publisher_id: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Finished,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

impl FromStr for TaskState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            _ => Err(()),
        }
    }
}
