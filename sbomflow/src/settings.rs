use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Application settings, read from a TOML file. Every field has a default so
/// an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub analysis: AnalysisSettings,
    pub pull_requests: PullRequestSettings,
    pub generator: GeneratorSettings,
    pub reporting: ReportingSettings,
    pub dtrack: DtrackSettings,
    pub github: GithubSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub analysis_timeout_secs: u64,
    /// Repositories (`owner/name`) to analyse. Empty means all.
    pub enabled_repos: Vec<String>,
    pub use_pending_commit_status: bool,
    pub max_concurrency: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            analysis_timeout_secs: 3600,
            enabled_repos: vec![],
            use_pending_commit_status: true,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub recursive_default: bool,
    pub fetch_licenses: bool,
    pub clean_wrapper_scripts: bool,
    pub exclude_github_folder: bool,
    /// Host variables that `${VAR}` placeholders in repository config may read.
    pub allowed_env_substitutions: Vec<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            recursive_default: true,
            fetch_licenses: true,
            clean_wrapper_scripts: true,
            exclude_github_folder: true,
            allowed_env_substitutions: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PullRequestSettings {
    pub enabled: bool,
    pub fetch_licenses: bool,
    pub ignore_bots: bool,
    /// Maximum concurrent pull-request analyses per repository, 0 for no limit.
    pub concurrency_limit: usize,
}

impl Default for PullRequestSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_licenses: false,
            ignore_bots: true,
            concurrency_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub command: String,
    pub fail_on_error: bool,
    pub use_gosum: bool,
    pub maven_include_test_scope: bool,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            command: "cdxgen".to_string(),
            fail_on_error: false,
            use_gosum: true,
            maven_include_test_scope: false,
        }
    }
}

/// Tool rendering the pull request vulnerability report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scanner {
    #[default]
    Grype,
    Depscan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportingSettings {
    pub scanner: Scanner,
    pub grype_command: String,
    /// Without a template for the selected scanner no vulnerability report
    /// is produced.
    pub grype_template: Option<String>,
    pub grype_config: Option<String>,
    pub depscan_command: String,
    /// Jinja2 template for depscan.
    pub depscan_template: Option<String>,
    pub sbomqs_command: String,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            scanner: Scanner::Grype,
            grype_command: "grype".to_string(),
            grype_template: None,
            grype_config: None,
            depscan_command: "depscan".to_string(),
            depscan_template: None,
            sbomqs_command: "sbomqs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DtrackSettings {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub api_url: String,
    pub token: Option<String>,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_url: crate::github::GITHUB_API_BASE.to_string(),
            token: None,
        }
    }
}

impl Settings {
    /// Reads `path` and applies `SBOMFLOW_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        let mut settings = Self::parse(&content)
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse settings")
    }

    /// Overrides connection settings from the environment. `lookup` is
    /// `std::env::var` outside of tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_string(&mut self.dtrack.url, lookup("SBOMFLOW_DTRACK_URL"));
        override_string(&mut self.dtrack.api_key, lookup("SBOMFLOW_DTRACK_API_KEY"));
        override_string(&mut self.github.api_url, lookup("SBOMFLOW_GITHUB_API_URL"));
        if let Some(token) = lookup("SBOMFLOW_GITHUB_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.github.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.analysis_timeout_secs == 0 {
            bail!("app.analysis_timeout_secs must be greater than zero");
        }
        if self.app.max_concurrency == 0 {
            bail!("app.max_concurrency must be greater than zero");
        }
        if self.generator.command.trim().is_empty() {
            bail!("generator.command must not be empty");
        }
        Ok(())
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.app.analysis_timeout_secs)
    }

    /// Whether `repo` (`owner/name`) is allowed by `app.enabled_repos`. Entries
    /// may name either the full repository or just its name. Blank entries
    /// are ignored.
    pub fn is_repo_enabled(&self, repo: &str) -> bool {
        let short = repo.rsplit_once('/').map_or(repo, |(_, name)| name);
        let mut entries = self
            .app
            .enabled_repos
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .peekable();
        entries.peek().is_none()
            || entries.any(|r| r.eq_ignore_ascii_case(repo) || r.eq_ignore_ascii_case(short))
    }
}

fn override_string(target: &mut String, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        *target = value;
    }
}
