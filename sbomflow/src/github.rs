use std::fmt;

use anyhow::{Context, Result, bail};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::instrument;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Context shown next to every commit status this service writes.
pub const STATUS_CONTEXT: &str = "Supply Chain Security";

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitState::Pending => write!(f, "pending"),
            CommitState::Success => write!(f, "success"),
            CommitState::Failure => write!(f, "failure"),
            CommitState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    pub state: CommitState,
    pub description: String,
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("sbomflow")
                .build()
                .expect("failed to build HTTP client"),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Open pull requests of `repo` whose head is `branch`.
    #[instrument(skip(self))]
    pub async fn open_pull_requests(&self, repo: &str, branch: &str) -> Result<Vec<PullRequest>> {
        let url = format!("{}/repos/{repo}/pulls?state=open", self.api_url);
        let pulls: Vec<PullRequest> = self.api_get_all(&url).await?;
        Ok(pulls.into_iter().filter(|p| p.head.git_ref == branch).collect())
    }

    #[instrument(skip(self))]
    pub async fn list_comments(&self, repo: &str, number: u64) -> Result<Vec<IssueComment>> {
        let url = format!("{}/repos/{repo}/issues/{number}/comments", self.api_url);
        self.api_get_all(&url).await
    }

    #[instrument(skip(self, body))]
    pub async fn create_comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let url = format!("{}/repos/{repo}/issues/{number}/comments", self.api_url);
        self.api_send(Method::POST, &url, &json!({ "body": body }))
            .await
            .map(drop)
    }

    #[instrument(skip(self, body))]
    pub async fn update_comment(&self, repo: &str, comment_id: u64, body: &str) -> Result<()> {
        let url = format!("{}/repos/{repo}/issues/comments/{comment_id}", self.api_url);
        self.api_send(Method::PATCH, &url, &json!({ "body": body }))
            .await
            .map(drop)
    }

    #[instrument(skip(self, status), fields(state = %status.state))]
    pub async fn create_commit_status(&self, repo: &str, sha: &str, status: &CommitStatus) -> Result<()> {
        let url = format!("{}/repos/{repo}/statuses/{sha}", self.api_url);
        let mut body = json!({
            "state": status.state,
            "description": status.description,
            "context": STATUS_CONTEXT,
        });
        if let Some(target_url) = &status.target_url {
            body["target_url"] = json!(target_url);
        }
        self.api_send(Method::POST, &url, &body).await.map(drop)
    }

    /// gzip-compressed tarball of `repo` at `git_ref`.
    #[instrument(skip(self))]
    pub async fn download_tarball(&self, repo: &str, git_ref: &str) -> Result<Vec<u8>> {
        let url = format!("{}/repos/{repo}/tarball/{git_ref}", self.api_url);
        let response = self
            .request(Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{url} returned HTTP {status}");
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read tarball from {url}"))?;
        Ok(bytes.to_vec())
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
    }

    #[tracing::instrument(skip(self))]
    async fn api_get_optional(&self, url: &str) -> Result<Option<Value>> {
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("{url} returned HTTP {status}");
        }

        let json = response
            .json()
            .await
            .with_context(|| format!("failed to parse JSON from {url}"))?;
        Ok(Some(json))
    }

    #[instrument(skip(self))]
    pub async fn api_get(&self, url: &str) -> Result<Value> {
        self.api_get_optional(url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{url} returned HTTP 404"))
    }

    /// Every item of a list endpoint, fetched page by page until a short page.
    async fn api_get_all<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let page_url = format!("{url}{separator}per_page={PER_PAGE}&page={page}");
            let batch: Vec<T> = serde_json::from_value(self.api_get(&page_url).await?)
                .with_context(|| format!("unexpected list from {page_url}"))?;
            let last = batch.len() < PER_PAGE;
            items.extend(batch);
            if last {
                return Ok(items);
            }
        }
        tracing::warn!(url, pages = MAX_PAGES, "page limit reached, list truncated");
        Ok(items)
    }

    async fn api_send(&self, method: Method, url: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .request(method, url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{url} returned HTTP {status}");
        }
        Ok(response)
    }
}
