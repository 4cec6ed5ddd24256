use std::fmt;

use crate::repo_config::RepoConfig;

/// Repository identity and metadata as delivered with every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// `owner/name`
    pub full_name: String,
    pub default_branch: String,
    pub description: Option<String>,
    pub html_url: String,
    pub vcs_url: String,
    pub topics: Vec<String>,
}

impl Repository {
    pub fn owner(&self) -> &str {
        self.full_name.split_once('/').map_or("", |(owner, _)| owner)
    }

    pub fn name(&self) -> &str {
        self.full_name
            .split_once('/')
            .map_or(self.full_name.as_str(), |(_, name)| name)
    }

    /// Tracking-backend view of this repository for one project version.
    pub fn details(&self, version: &str) -> RepositoryDetails {
        RepositoryDetails {
            name: self.name().to_string(),
            version: version.to_string(),
            description: self.description.clone(),
            website_url: self.html_url.clone(),
            vcs_url: self.vcs_url.clone(),
            topics: self.topics.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDetails {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub website_url: String,
    pub vcs_url: String,
    pub topics: Vec<String>,
}

impl RepositoryDetails {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub login: String,
    pub name: Option<String>,
    /// `User`, `Bot` or `Organization`.
    pub kind: String,
}

impl User {
    pub fn is_bot(&self) -> bool {
        let looks_like_bot = |s: &str| {
            let s = s.to_lowercase();
            s.contains("[bot]") || s.ends_with("-bot")
        };
        self.kind.eq_ignore_ascii_case("bot")
            || looks_like_bot(&self.login)
            || self.name.as_deref().is_some_and(looks_like_bot)
    }
}

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub repository: Repository,
    /// Full ref, e.g. `refs/heads/main`.
    pub git_ref: String,
    pub commit_sha: Option<String>,
    pub config: Option<RepoConfig>,
}

impl PushEvent {
    pub fn branch(&self) -> &str {
        branch_of(&self.git_ref)
    }

    pub fn is_default_branch(&self) -> bool {
        self.git_ref == format!("refs/heads/{}", self.repository.default_branch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Reopened,
    Other,
}

impl PullRequestAction {
    pub fn is_relevant(self) -> bool {
        !matches!(self, PullRequestAction::Other)
    }
}

impl From<&str> for PullRequestAction {
    fn from(action: &str) -> Self {
        match action {
            "opened" => PullRequestAction::Opened,
            "synchronize" => PullRequestAction::Synchronize,
            "reopened" => PullRequestAction::Reopened,
            _ => PullRequestAction::Other,
        }
    }
}

impl fmt::Display for PullRequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullRequestAction::Opened => write!(f, "opened"),
            PullRequestAction::Synchronize => write!(f, "synchronize"),
            PullRequestAction::Reopened => write!(f, "reopened"),
            PullRequestAction::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    pub repository: Repository,
    pub action: PullRequestAction,
    pub number: u64,
    /// Branch name of the pull request head, without `refs/heads/`.
    pub head_ref: String,
    pub head_sha: String,
    pub sender: User,
    pub author: User,
    pub config: Option<RepoConfig>,
}

impl PullRequestEvent {
    pub fn git_ref(&self) -> String {
        format!("refs/heads/{}", self.head_ref)
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseEvent {
    pub repository: Repository,
    pub action: String,
    pub tag: String,
    /// Branch the release was cut from.
    pub target_branch: String,
    pub target_commit: Option<String>,
    pub config: Option<RepoConfig>,
}

impl ReleaseEvent {
    pub fn is_released(&self) -> bool {
        self.action == "released"
    }

    /// Project version the release annotates.
    pub fn project_version(&self) -> &str {
        if self.target_branch.trim().is_empty() {
            &self.repository.default_branch
        } else {
            &self.target_branch
        }
    }
}

#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    Release(ReleaseEvent),
}

impl RepositoryEvent {
    pub fn repository(&self) -> &Repository {
        match self {
            RepositoryEvent::Push(e) => &e.repository,
            RepositoryEvent::PullRequest(e) => &e.repository,
            RepositoryEvent::Release(e) => &e.repository,
        }
    }

    pub fn config(&self) -> Option<&RepoConfig> {
        match self {
            RepositoryEvent::Push(e) => e.config.as_ref(),
            RepositoryEvent::PullRequest(e) => e.config.as_ref(),
            RepositoryEvent::Release(e) => e.config.as_ref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepositoryEvent::Push(_) => "push",
            RepositoryEvent::PullRequest(_) => "pull_request",
            RepositoryEvent::Release(_) => "release",
        }
    }
}

pub fn branch_of(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}
