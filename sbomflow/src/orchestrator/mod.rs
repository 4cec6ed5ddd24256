//! Event handling: gating, deduplication, checkout, generation, upload or
//! report, commit status and cleanup.

pub mod analysis;
pub mod comment;
pub mod status;
pub mod tasks;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use crate::checkout::{Checkout, GitHubCheckout};
use crate::context::AnalysisContext;
use crate::event::{PullRequestEvent, PushEvent, ReleaseEvent, Repository, RepositoryEvent};
use crate::github::{CommitStatus, GitHubClient};
use crate::repo_config::RepoConfig;
use crate::reporting::{ReportingClient, VulnerabilityReport};
use crate::sbom::{HostEnvironment, SbomGenerator, execute_all};
use crate::settings::Settings;
use crate::tracking::{Project, TrackingClient};

use self::analysis::PullRequestReport;
use self::tasks::{RepoLimiter, TaskRegistry};

/// Why an event was not analysed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    RepositoryNotEnabled,
    DisabledByConfig,
    NotDefaultBranch { git_ref: String },
    PullRequestsDisabled,
    IgnoredAction { action: String },
    PullRequestReportDisabled,
    BotUser { login: String },
    ConcurrencyLimit,
    PushAnalysisRunning,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::RepositoryNotEnabled => write!(f, "repository is not enabled"),
            SkipReason::DisabledByConfig => write!(f, "disabled by repository config"),
            SkipReason::NotDefaultBranch { git_ref } => write!(f, "{git_ref} is not the default branch"),
            SkipReason::PullRequestsDisabled => write!(f, "pull request analysis is disabled"),
            SkipReason::IgnoredAction { action } => write!(f, "action '{action}' is ignored"),
            SkipReason::PullRequestReportDisabled => {
                write!(f, "pull request report disabled by repository config")
            }
            SkipReason::BotUser { login } => write!(f, "{login} is a bot"),
            SkipReason::ConcurrencyLimit => write!(f, "concurrent analysis limit reached"),
            SkipReason::PushAnalysisRunning => write!(f, "push analysis of the same commit running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Completion {
    Project { project: Project },
    Report { report: VulnerabilityReport },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Skipped { reason: SkipReason },
    /// An identical analysis is in flight; nothing was done.
    AlreadyRunning,
    Completed { completion: Completion },
}

impl EventOutcome {
    fn skipped(reason: SkipReason) -> Self {
        EventOutcome::Skipped { reason }
    }

    fn project(project: Project) -> Self {
        EventOutcome::Completed {
            completion: Completion::Project { project },
        }
    }

    fn report(report: VulnerabilityReport) -> Self {
        EventOutcome::Completed {
            completion: Completion::Report { report },
        }
    }
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    generator: SbomGenerator,
    tracking: TrackingClient,
    reporting: ReportingClient,
    github: GitHubClient,
    checkout: Arc<dyn Checkout>,
    tasks: Arc<TaskRegistry>,
    pull_request_tasks: Arc<TaskRegistry>,
    pull_request_limiter: Arc<RepoLimiter>,
}

impl Orchestrator {
    pub fn builder(settings: Settings) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings,
            checkout: None,
            host: None,
        }
    }

    /// Running push analyses. Pull requests only read this map.
    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn pull_request_tasks(&self) -> &Arc<TaskRegistry> {
        &self.pull_request_tasks
    }

    /// Handles one event. `Err` means the analysis ran and failed; the commit
    /// status has been written where applicable.
    pub async fn handle(&self, event: RepositoryEvent) -> Result<EventOutcome> {
        match event {
            RepositoryEvent::Push(push) => self.handle_push(&push).await,
            RepositoryEvent::PullRequest(pr) => self.handle_pull_request(&pr).await,
            RepositoryEvent::Release(release) => self.handle_release(&release).await,
        }
    }

    pub async fn handle_push(&self, event: &PushEvent) -> Result<EventOutcome> {
        let repo = &event.repository;
        if let Some(reason) = self.repository_gate(repo, event.config.as_ref()) {
            return Ok(self.skip(repo, reason));
        }
        if !event.is_default_branch() {
            let reason = SkipReason::NotDefaultBranch {
                git_ref: event.git_ref.clone(),
            };
            return Ok(self.skip(repo, reason));
        }

        let ctx = AnalysisContext::new(&repo.full_name, &event.git_ref, event.commit_sha.clone());
        let Some(_guard) = self.tasks.try_register(&ctx.unique_id()) else {
            info!(%ctx, "analysis already running, event dropped");
            return Ok(EventOutcome::AlreadyRunning);
        };

        let span = info_span!("push", repo = %ctx.repo_full_name, git_ref = %ctx.git_ref, trace_id = %ctx.trace_id);
        async {
            if self.settings.app.use_pending_commit_status {
                self.write_status(&ctx, &status::pending()).await;
            }

            let result = self.with_timeout(self.analyse_push(event, &ctx)).await;
            match &result {
                Ok(project) => info!(?project, "push analysis finished"),
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(%error, "push analysis failed");
                }
            }
            self.write_status(&ctx, &status::completed(&result)).await;
            result.map(EventOutcome::project)
        }
        .instrument(span)
        .await
    }

    async fn analyse_push(&self, event: &PushEvent, ctx: &AnalysisContext) -> Result<Project> {
        let repo = &event.repository;
        let checkout_ref = ctx.commit_sha.as_deref().unwrap_or(&ctx.git_ref);
        let local = self
            .checkout
            .checkout(repo, checkout_ref)
            .await
            .with_context(|| format!("checkout of {ctx} failed"))?;

        let commands = self.generator.create_commands(
            local.path(),
            repo.name(),
            self.settings.analysis.fetch_licenses,
            event.config.as_ref(),
        )?;
        let results = execute_all(commands, self.settings.app.max_concurrency).await;

        let details = repo.details(event.branch());
        let project = analysis::upload_results(
            &self.tracking,
            &self.reporting,
            &details,
            ctx.commit_sha.as_deref(),
            results,
        )
        .await;

        if let Err(e) = local.close() {
            warn!(error = %e, "failed to remove checkout");
        }
        project
    }

    pub async fn handle_pull_request(&self, event: &PullRequestEvent) -> Result<EventOutcome> {
        let repo = &event.repository;
        if let Some(reason) = self.pull_request_gate(event) {
            return Ok(self.skip(repo, reason));
        }

        let ctx = AnalysisContext::new(&repo.full_name, event.git_ref(), Some(event.head_sha.clone()));
        if self.tasks.is_running(&ctx.unique_id()) {
            return Ok(self.skip(repo, SkipReason::PushAnalysisRunning));
        }
        let Some(_permit) = self.pull_request_limiter.try_acquire(&repo.full_name) else {
            return Ok(self.skip(repo, SkipReason::ConcurrencyLimit));
        };
        let Some(_guard) = self.pull_request_tasks.try_register(&ctx.unique_id()) else {
            info!(%ctx, "pull request analysis already running, event dropped");
            return Ok(EventOutcome::AlreadyRunning);
        };

        let span = info_span!(
            "pull_request",
            repo = %ctx.repo_full_name,
            number = event.number,
            trace_id = %ctx.trace_id
        );
        async {
            let analysis = self.with_timeout(self.analyse_pull_request(event, &ctx)).await?;
            self.comment_pull_requests(event, &analysis).await;
            Ok::<_, anyhow::Error>(EventOutcome::report(analysis.report))
        }
        .instrument(span)
        .await
    }

    async fn analyse_pull_request(
        &self,
        event: &PullRequestEvent,
        ctx: &AnalysisContext,
    ) -> Result<PullRequestReport> {
        let repo = &event.repository;
        let local = self
            .checkout
            .checkout(repo, &event.head_sha)
            .await
            .with_context(|| format!("checkout of {ctx} failed"))?;

        let commands = self.generator.create_commands(
            local.path(),
            repo.name(),
            self.settings.pull_requests.fetch_licenses,
            event.config.as_ref(),
        )?;
        let results = execute_all(commands, self.settings.app.max_concurrency).await;
        let report = analysis::report_results(&self.reporting, repo.name(), results).await;

        if let Err(e) = local.close() {
            warn!(error = %e, "failed to remove checkout");
        }
        Ok(report)
    }

    /// Upserts the report comment on every open pull request of the branch.
    /// Failures are logged only.
    async fn comment_pull_requests(&self, event: &PullRequestEvent, analysis: &PullRequestReport) {
        let repo = &event.repository.full_name;
        let mut numbers = match self.github.open_pull_requests(repo, &event.head_ref).await {
            Ok(pulls) => pulls.into_iter().map(|p| p.number).collect(),
            Err(e) => {
                warn!(error = %e, "failed to list open pull requests");
                vec![]
            }
        };
        if !numbers.contains(&event.number) {
            numbers.push(event.number);
        }

        let search_url = self.tracking.search_url(event.repository.name());
        let body = comment::comment_body(&analysis.report, analysis.sboms, &search_url, &event.head_sha);
        for number in numbers {
            if let Err(e) = comment::upsert_comment(&self.github, repo, number, &body).await {
                warn!(number, error = %e, "failed to comment pull request");
            }
        }
    }

    pub async fn handle_release(&self, event: &ReleaseEvent) -> Result<EventOutcome> {
        let repo = &event.repository;
        if let Some(reason) = self.repository_gate(repo, event.config.as_ref()) {
            return Ok(self.skip(repo, reason));
        }
        if !event.is_released() {
            let reason = SkipReason::IgnoredAction {
                action: event.action.clone(),
            };
            return Ok(self.skip(repo, reason));
        }

        let ctx = AnalysisContext::new(&repo.full_name, &event.tag, event.target_commit.clone());
        let span = info_span!("release", repo = %ctx.repo_full_name, tag = %event.tag, trace_id = %ctx.trace_id);
        let details = repo.details(event.project_version());
        let project = self
            .with_timeout(
                self.tracking
                    .append_version_info(&details, &event.tag, ctx.commit_sha.as_deref()),
            )
            .instrument(span)
            .await?;
        Ok(EventOutcome::project(project))
    }

    fn repository_gate(&self, repo: &Repository, config: Option<&RepoConfig>) -> Option<SkipReason> {
        if !self.settings.is_repo_enabled(&repo.full_name) {
            return Some(SkipReason::RepositoryNotEnabled);
        }
        if config.and_then(|c| c.enable) == Some(false) {
            return Some(SkipReason::DisabledByConfig);
        }
        None
    }

    fn pull_request_gate(&self, event: &PullRequestEvent) -> Option<SkipReason> {
        if !self.settings.pull_requests.enabled {
            return Some(SkipReason::PullRequestsDisabled);
        }
        if !event.action.is_relevant() {
            return Some(SkipReason::IgnoredAction {
                action: event.action.to_string(),
            });
        }
        if let Some(reason) = self.repository_gate(&event.repository, event.config.as_ref()) {
            return Some(reason);
        }
        if event.config.as_ref().and_then(|c| c.enable_pull_request_report) == Some(false) {
            return Some(SkipReason::PullRequestReportDisabled);
        }
        if self.settings.pull_requests.ignore_bots {
            if let Some(bot) = [&event.sender, &event.author].into_iter().find(|u| u.is_bot()) {
                return Some(SkipReason::BotUser {
                    login: bot.login.clone(),
                });
            }
        }
        None
    }

    fn skip(&self, repo: &Repository, reason: SkipReason) -> EventOutcome {
        info!(repo = %repo.full_name, %reason, "event skipped");
        EventOutcome::skipped(reason)
    }

    async fn with_timeout<T>(&self, analysis: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.analysis_timeout();
        match tokio::time::timeout(limit, analysis).await {
            Ok(result) => result,
            Err(elapsed) => Err(anyhow::Error::new(elapsed))
                .with_context(|| format!("analysis timed out after {}s", limit.as_secs())),
        }
    }

    async fn write_status(&self, ctx: &AnalysisContext, status: &CommitStatus) {
        let Some(sha) = &ctx.commit_sha else {
            return;
        };
        if let Err(e) = self
            .github
            .create_commit_status(&ctx.repo_full_name, sha, status)
            .await
        {
            warn!(state = %status.state, error = %e, "failed to write commit status");
        }
    }
}

pub struct OrchestratorBuilder {
    settings: Settings,
    checkout: Option<Arc<dyn Checkout>>,
    host: Option<HostEnvironment>,
}

impl OrchestratorBuilder {
    pub fn checkout(mut self, checkout: impl Checkout + 'static) -> Self {
        self.checkout = Some(Arc::new(checkout));
        self
    }

    pub fn host_environment(mut self, host: HostEnvironment) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Orchestrator {
        let settings = self.settings;
        let github = GitHubClient::new(&settings.github.api_url, settings.github.token.clone());
        let checkout = self
            .checkout
            .unwrap_or_else(|| Arc::new(GitHubCheckout::new(github.clone())));
        let host = self.host.unwrap_or_else(HostEnvironment::capture);

        Orchestrator {
            generator: SbomGenerator::new(&settings, host),
            tracking: TrackingClient::new(&settings.dtrack.url, &settings.dtrack.api_key),
            reporting: ReportingClient::new(&settings.reporting),
            github,
            checkout,
            tasks: TaskRegistry::new(),
            pull_request_tasks: TaskRegistry::new(),
            pull_request_limiter: RepoLimiter::new(settings.pull_requests.concurrency_limit),
            settings: Arc::new(settings),
        }
    }
}
