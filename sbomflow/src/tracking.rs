use std::future::Future;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::event::RepositoryDetails;

pub const API_PATH: &str = "/api/v1";
const API_KEY_HEADER: &str = "X-API-Key";

/// Additional attempts after the first failed one.
pub const MAX_RETRIES: usize = 3;

/// Longest description the backend accepts.
const MAX_DESCRIPTION_LEN: usize = 255;

static COMMIT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#(\w{1,7})#").expect("valid commit prefix pattern"));

/// A project in the tracking backend, as seen by one analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Project {
    Available {
        url: String,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_sha: Option<String>,
    },
    /// Several projects were produced; `search_url` lists them.
    List { search_url: String },
    None,
}

impl Project {
    pub fn id(&self) -> Option<&str> {
        match self {
            Project::Available { id, .. } => Some(id),
            Project::List { .. } | Project::None => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Project::Available { url, .. } => Some(url),
            Project::List { search_url } => Some(search_url),
            Project::None => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Dependency-Track returned HTTP {status}")]
    Status { status: u16 },
}

/// Client for the Dependency-Track REST API.
#[derive(Clone)]
pub struct TrackingClient {
    client: reqwest::Client,
    base_url: String,
    api_url: String,
    api_key: String,
}

impl TrackingClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::builder()
                .user_agent("sbomflow")
                .build()
                .expect("failed to build HTTP client"),
            api_url: format!("{base_url}{API_PATH}"),
            base_url,
            api_key: api_key.trim().to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn project_url(&self, id: &str) -> String {
        format!("{}/projects/{id}", self.base_url)
    }

    /// Backend search page listing every project whose name contains `name`.
    pub fn search_url(&self, name: &str) -> String {
        format!("{}/projects?searchText={name}", self.base_url)
    }

    /// Uploads `sbom` as `project_name` in `details.version`, deactivates other
    /// versions of the same project and describes the uploaded one.
    ///
    /// Only a failed upload is an error; the housekeeping steps afterwards are
    /// logged and otherwise ignored.
    #[instrument(skip(self, details, sbom, parent), fields(version = %details.version))]
    pub async fn upload_sbom(
        &self,
        details: &RepositoryDetails,
        sbom: &Value,
        project_name: &str,
        parent: &Project,
        commit_sha: Option<&str>,
    ) -> Result<Project> {
        let version = details.version.as_str();
        let encoded = BASE64.encode(serde_json::to_vec(sbom).context("failed to serialize sbom")?);
        let mut payload = json!({
            "projectName": project_name,
            "projectVersion": version,
            "autoCreate": true,
            "bom": encoded,
        });
        if let Some(parent_id) = parent.id() {
            payload["parentUUID"] = json!(parent_id);
        }

        let url = format!("{}/bom", self.api_url);
        with_retry("upload sbom", || self.put_bom(&url, &payload))
            .await
            .inspect_err(|e| warn!(error = %e, "failed to upload project {project_name} in version {version}"))?;
        info!("uploaded project {project_name} in version {version}");

        self.deactivate_previous_versions(project_name, version).await;

        let project = self.lookup_project(project_name, version).await?;
        if let Some(id) = project.id() {
            self.update_project_metadata(id, details, parent, commit_sha, None)
                .await;
        }
        Ok(project)
    }

    /// Creates the umbrella project grouping a multi-project repository, or
    /// re-describes it when it already exists.
    #[instrument(skip(self, details), fields(name = %details.name, version = %details.version))]
    pub async fn create_or_update_parent_project(
        &self,
        details: &RepositoryDetails,
        commit_sha: Option<&str>,
    ) -> Result<Project> {
        let mut payload = project_base_data(details, commit_sha, None);
        payload["name"] = json!(details.name);
        payload["version"] = json!(details.version);

        let url = format!("{}/project", self.api_url);
        let response = with_retry("create parent project", || {
            self.send_retryable(Method::PUT, &url, Some(&payload))
        })
        .await?;

        match response.status() {
            StatusCode::CREATED => {
                let body: Value = response
                    .json()
                    .await
                    .context("failed to parse created parent project")?;
                let project = self.project_from_json(&body)?;
                info!(id = project.id(), "created parent project");
                Ok(project)
            }
            StatusCode::CONFLICT => {
                let project = self
                    .lookup_project(&details.name, &details.version)
                    .await
                    .context("parent project could not be found")?;
                if let Some(id) = project.id() {
                    self.update_project_metadata(id, details, &Project::None, commit_sha, None)
                        .await;
                }
                Ok(project)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(%status, %body, "failed to create parent project");
                Err(TrackingError::Status {
                    status: status.as_u16(),
                })
                .context("failed to create parent project")
            }
        }
    }

    /// Prefixes the project's description with `release` when the project was
    /// last analysed at `commit_sha`.
    #[instrument(skip(self, details), fields(name = %details.name, version = %details.version))]
    pub async fn append_version_info(
        &self,
        details: &RepositoryDetails,
        release: &str,
        commit_sha: Option<&str>,
    ) -> Result<Project> {
        let Some(commit_sha) = commit_sha else {
            return Ok(Project::None);
        };

        let project = self.lookup_project(&details.name, &details.version).await?;
        let Project::Available { id, commit_sha: project_sha, .. } = &project else {
            return Ok(Project::None);
        };

        match project_sha {
            None => {
                warn!(id, "project has no commit information");
                Ok(Project::None)
            }
            Some(sha) if !commit_sha.starts_with(sha.as_str()) => {
                warn!(id, project_commit = %sha, release_commit = commit_sha, "release targets a different commit");
                Ok(Project::None)
            }
            Some(_) => {
                self.update_project_metadata(id, details, &Project::None, Some(commit_sha), Some(release))
                    .await;
                Ok(project)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn lookup_project(&self, name: &str, version: &str) -> Result<Project> {
        let url = Url::parse_with_params(
            &format!("{}/project/lookup", self.api_url),
            &[("name", name), ("version", version)],
        )
        .context("invalid lookup url")?;

        let body = with_retry("lookup project", || self.get_json(url.as_str()))
            .await
            .inspect_err(|e| warn!(error = %e, "could not look up project"))
            .with_context(|| format!("lookup of project {name} in version {version} failed"))?;
        self.project_from_json(&body)
    }

    async fn deactivate_previous_versions(&self, name: &str, version: &str) {
        if let Err(e) = self.try_deactivate_previous_versions(name, version).await {
            warn!(error = %e, "failed to deactivate previous versions of {name}");
        }
    }

    async fn try_deactivate_previous_versions(&self, name: &str, version: &str) -> Result<()> {
        let url = Url::parse_with_params(
            &format!("{}/project", self.api_url),
            &[("name", name), ("excludeInactive", "true")],
        )
        .context("invalid project list url")?;

        let projects: Vec<Value> =
            serde_json::from_value(with_retry("list projects", || self.get_json(url.as_str())).await?)
                .context("unexpected project list")?;

        let outdated = projects.iter().filter_map(|p| {
            let same_name = p.get("name").and_then(Value::as_str) == Some(name);
            let other_version = p.get("version").and_then(Value::as_str) != Some(version);
            if same_name && other_version {
                p.get("uuid").and_then(Value::as_str)
            } else {
                None
            }
        });

        for id in outdated {
            let url = format!("{}/project/{id}", self.api_url);
            let body = json!({ "active": false });
            match with_retry("deactivate project", || self.send_expect_success(Method::PATCH, &url, &body)).await {
                Ok(()) => info!(id, "deactivated project"),
                Err(e) => warn!(id, error = %e, "failed to deactivate project"),
            }
        }
        Ok(())
    }

    async fn update_project_metadata(
        &self,
        id: &str,
        details: &RepositoryDetails,
        parent: &Project,
        commit_sha: Option<&str>,
        release: Option<&str>,
    ) {
        let mut body = project_base_data(details, commit_sha, release);
        if let Some(parent_id) = parent.id() {
            body["parent"] = json!({ "uuid": parent_id });
        }

        let url = format!("{}/project/{id}", self.api_url);
        match with_retry("update project", || self.send_expect_success(Method::PATCH, &url, &body)).await {
            Ok(()) => info!(id, "updated project metadata"),
            Err(e) => warn!(id, error = %e, "failed to update project metadata"),
        }
    }

    fn project_from_json(&self, body: &Value) -> Result<Project> {
        let id = body
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("project response has no uuid"))?;
        let commit_sha = body
            .get("description")
            .and_then(Value::as_str)
            .and_then(parse_commit_sha_from_description);
        Ok(Project::Available {
            url: self.project_url(id),
            id: id.to_string(),
            commit_sha,
        })
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))
    }

    /// Like `send`, but a server error is a failed attempt worth retrying.
    async fn send_retryable(&self, method: Method, url: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let response = self.send(method, url, body).await?;
        let status = response.status();
        if status.is_server_error() {
            bail!(TrackingError::Status {
                status: status.as_u16()
            });
        }
        Ok(response)
    }

    /// GET answered with 200 and a JSON body; any other status is an error.
    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.send(Method::GET, url, None).await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, %body, "unexpected response from {url}");
            bail!(TrackingError::Status {
                status: status.as_u16()
            });
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))
    }

    /// The upload endpoint answers 200 only; anything else, even another 2xx,
    /// is a failed upload.
    async fn put_bom(&self, url: &str, payload: &Value) -> Result<()> {
        let response = self.send(Method::PUT, url, Some(payload)).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => bail!(TrackingError::Status {
                status: status.as_u16()
            }),
        }
    }

    async fn send_expect_success(&self, method: Method, url: &str, body: &Value) -> Result<()> {
        let response = self.send(method, url, Some(body)).await?;
        let status = response.status();
        if !status.is_success() {
            bail!(TrackingError::Status {
                status: status.as_u16()
            });
        }
        Ok(())
    }
}

/// Runs `operation` until it succeeds, at most `MAX_RETRIES` more times.
async fn with_retry<T, F, Fut>(name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt > MAX_RETRIES => return Err(e),
            Err(e) => debug!(attempt, error = %e, "{name} failed, retrying"),
        }
    }
}

/// Description, tags, external references and active flag shared by every
/// project update.
fn project_base_data(details: &RepositoryDetails, commit_sha: Option<&str>, release: Option<&str>) -> Value {
    let tags: Vec<Value> = details
        .topics
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| json!({ "name": t }))
        .collect();

    let mut description = commit_sha_prefix(commit_sha);
    if let Some(release) = release {
        description.push_str(release);
        description.push_str(" | ");
    }
    if let Some(repo_description) = &details.description {
        description.push_str(repo_description.trim());
    }

    json!({
        "tags": tags,
        "description": truncate_description(description),
        "externalReferences": [
            { "type": "vcs", "url": details.vcs_url },
            { "type": "website", "url": details.website_url },
            { "type": "release-notes", "url": format!("{}/releases", details.website_url) },
        ],
        "active": true,
    })
}

fn truncate_description(description: String) -> String {
    if description.chars().count() < MAX_DESCRIPTION_LEN {
        return description;
    }
    let kept: String = description.chars().take(MAX_DESCRIPTION_LEN - 4).collect();
    format!("{kept}...")
}

/// `#<short sha># `, or empty without a commit.
fn commit_sha_prefix(commit_sha: Option<&str>) -> String {
    match commit_sha {
        Some(sha) if !sha.is_empty() => {
            let short: String = sha.chars().take(7).collect();
            format!("#{short}# ")
        }
        _ => String::new(),
    }
}

pub fn parse_commit_sha_from_description(description: &str) -> Option<String> {
    COMMIT_PREFIX
        .captures(description)
        .map(|caps| caps[1].to_string())
}
