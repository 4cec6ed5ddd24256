use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use globset::{Glob, GlobSetBuilder};
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::process::{self, ProcessResult};
use crate::repo_config::{ConfigPath, RepoConfig, build_config_paths};
use crate::sbom::document::{SbomResult, parse_sbom_file};
use crate::settings::Settings;

/// Name of the file the generator writes into the analysis folder.
pub const SBOM_FILE: &str = "sbom.json";

const DEFAULT_MAVEN_ARGS: &str = "-B -ntp";
const WRAPPER_SCRIPTS: [&str; 6] = [
    "mvnw",
    "mvnw.bat",
    "mvnw.cmd",
    "gradlew",
    "gradlew.bat",
    "gradlew.cmd",
];

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").expect("valid placeholder pattern"));
static JDK_HOME_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^JAVA(\d+)_HOME$").expect("valid jdk home pattern"));

/// Snapshot of the host environment used for placeholder substitution and
/// JDK selection. Tests build one from an explicit map.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    vars: HashMap<String, String>,
}

impl HostEnvironment {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_vars<K: Into<String>, V: Into<String>>(vars: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// `JAVA<version>_HOME` variables keyed by version.
    fn jdk_homes(&self) -> HashMap<String, String> {
        self.vars
            .iter()
            .filter_map(|(key, value)| {
                let version = JDK_HOME_VAR.captures(key)?.get(1)?.as_str().to_string();
                Some((version, value.clone()))
            })
            .collect()
    }
}

/// One generator invocation for one sub-project.
#[derive(Debug, Clone)]
pub struct SbomCommand {
    pub analysis_dir: PathBuf,
    pub project_name: String,
    pub command_line: String,
    pub environment: HashMap<String, String>,
    pub excludes: Vec<String>,
}

impl SbomCommand {
    pub fn sbom_file(&self) -> PathBuf {
        self.analysis_dir.join(SBOM_FILE)
    }

    /// Removes excluded files, runs the generator and parses its output.
    /// A failed run is tolerated as long as the output file exists and parses.
    #[instrument(skip(self), fields(project = %self.project_name))]
    pub async fn execute(&self) -> Result<SbomResult> {
        let dir = self.analysis_dir.clone();
        let excludes = self.excludes.clone();
        match tokio::task::spawn_blocking(move || remove_excluded_files(&dir, &excludes)).await {
            Ok(Ok(removed)) if removed > 0 => info!(removed, "removed excluded files"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to remove excluded files"),
            Err(e) => warn!(error = %e, "exclude cleanup task panicked"),
        }

        let result = process::run(&self.command_line, &self.analysis_dir, &self.environment).await;
        let sbom_file = self.sbom_file();
        match result {
            ProcessResult::Success { .. } => parse_sbom_file(&sbom_file, &self.project_name),
            ProcessResult::Failure { cause, .. } => {
                if sbom_file.exists() {
                    warn!(error = %cause, "generator failed but wrote an sbom, trying to parse it");
                    parse_sbom_file(&sbom_file, &self.project_name)
                } else {
                    warn!(error = %cause, command = %self.command_line, "generator failed");
                    Err(cause.context(format!(
                        "sbom generation failed for project '{}'",
                        self.project_name
                    )))
                }
            }
        }
    }
}

/// Turns a checked-out directory and its configuration into generator commands.
#[derive(Debug, Clone)]
pub struct SbomGenerator {
    command: String,
    recursive_default: bool,
    fail_on_error: bool,
    clean_wrapper_scripts: bool,
    exclude_github_folder: bool,
    allowed_env_substitutions: HashSet<String>,
    base_env: HashMap<String, String>,
    host: HostEnvironment,
}

impl SbomGenerator {
    pub fn new(settings: &Settings, host: HostEnvironment) -> Self {
        let base_env = HashMap::from([
            (
                "GITHUB_TOKEN".to_string(),
                settings.github.token.clone().unwrap_or_default().trim().to_string(),
            ),
            ("USE_GOSUM".to_string(), settings.generator.use_gosum.to_string()),
            ("MVN_ARGS".to_string(), DEFAULT_MAVEN_ARGS.to_string()),
            (
                "CDX_MAVEN_INCLUDE_TEST_SCOPE".to_string(),
                settings.generator.maven_include_test_scope.to_string(),
            ),
            (
                "CDXGEN_TIMEOUT_MS".to_string(),
                settings.analysis_timeout().as_millis().to_string(),
            ),
        ]);

        Self {
            command: settings.generator.command.clone(),
            recursive_default: settings.analysis.recursive_default,
            fail_on_error: settings.generator.fail_on_error,
            clean_wrapper_scripts: settings.analysis.clean_wrapper_scripts,
            exclude_github_folder: settings.analysis.exclude_github_folder,
            allowed_env_substitutions: settings
                .analysis
                .allowed_env_substitutions
                .iter()
                .cloned()
                .collect(),
            base_env,
            host,
        }
    }

    /// One command per enabled sub-project. Without configuration the whole
    /// repository is analysed as a single project named `default_project_name`.
    pub fn create_commands(
        &self,
        repo_dir: &Path,
        default_project_name: &str,
        fetch_licenses: bool,
        config: Option<&RepoConfig>,
    ) -> Result<Vec<SbomCommand>> {
        let mut paths = build_config_paths(config);
        if paths.is_empty() {
            paths.push(ConfigPath::new(vec![]));
        }

        let mut commands = Vec::with_capacity(paths.len());
        for path in &paths {
            if !path.last(|c| c.enable).unwrap_or(true) {
                info!(location = %analysis_subdir(path), "sub-project disabled, skipped");
                continue;
            }
            let project_name = project_name(default_project_name, path);
            commands.push(SbomCommand {
                analysis_dir: analysis_folder(repo_dir, path),
                command_line: self.command_line(self.analyse_recursive(path), &project_name),
                environment: self.build_env(path, fetch_licenses),
                excludes: self.exclude_list(path)?,
                project_name,
            });
        }
        Ok(commands)
    }

    fn command_line(&self, recursive: bool, project_name: &str) -> String {
        format!(
            "{} --spec-version 1.4 -o {SBOM_FILE} {}{} --project-name {project_name}",
            self.command,
            if recursive { "-r" } else { "--no-recurse" },
            if self.fail_on_error { " --fail-on-error" } else { "" },
        )
    }

    /// Last explicit value along the path. Without one, nested sub-projects
    /// are never recursive so that dependency files are not counted twice.
    pub fn analyse_recursive(&self, path: &ConfigPath<'_>) -> bool {
        match path.last(RepoConfig::recursive) {
            Some(recursive) => recursive,
            None if path.len() > 1 => false,
            None => self.recursive_default,
        }
    }

    pub fn build_env(&self, path: &ConfigPath<'_>, fetch_licenses: bool) -> HashMap<String, String> {
        let mut env = self.base_env.clone();
        env.insert("FETCH_LICENSE".to_string(), fetch_licenses.to_string());

        let gradle_args = self.joined_args(path.slice(RepoConfig::gradle_args));
        if !gradle_args.trim().is_empty() {
            env.insert("GRADLE_ARGS".to_string(), gradle_args);
        }

        let maven_args = self.joined_args(path.slice(RepoConfig::maven_args));
        if !maven_args.trim().is_empty() {
            env.insert("MVN_ARGS".to_string(), format!("{DEFAULT_MAVEN_ARGS} {maven_args}"));
        }

        let mut extra: BTreeMap<&str, &str> = BTreeMap::new();
        for map in path.slice(|c| c.env.as_ref()) {
            extra.extend(map.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        for (key, value) in extra {
            env.insert(key.to_string(), self.resolve_env_vars(value));
        }

        if let Some(java_home) = self.java_home(path) {
            env.insert("JAVA_HOME".to_string(), java_home);
        }

        env
    }

    fn joined_args(&self, args: Vec<&[String]>) -> String {
        args.into_iter()
            .flatten()
            .map(|arg| self.resolve_env_vars(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn java_home(&self, path: &ConfigPath<'_>) -> Option<String> {
        let fallback = self.host.get("JAVA_HOME").map(str::to_string);
        let Some(version) = path.last(RepoConfig::jdk_version) else {
            return fallback;
        };
        match self.host.jdk_homes().remove(version.trim()) {
            Some(home) => Some(home),
            None => {
                warn!(version, "no JAVA{version}_HOME on this host, using default JDK");
                fallback
            }
        }
    }

    /// Replaces `${VAR}` with the host value when `VAR` is allow-listed.
    /// Everything else becomes an empty string.
    pub fn resolve_env_vars(&self, value: &str) -> String {
        ENV_PLACEHOLDER
            .replace_all(value, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                if self.allowed_env_substitutions.contains(name) {
                    self.host.get(name).unwrap_or_default().to_string()
                } else {
                    String::new()
                }
            })
            .into_owned()
    }

    pub fn exclude_list(&self, path: &ConfigPath<'_>) -> Result<Vec<String>> {
        let mut excludes: Vec<String> = path
            .slice(RepoConfig::excludes)
            .into_iter()
            .flatten()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        if let Some(bad) = excludes
            .iter()
            .find(|e| e.contains("..") || e.starts_with(['/', '~', '$']))
        {
            bail!("exclude '{bad}' points outside the analysed directory");
        }

        if self.exclude_github_folder {
            excludes.push(".github".to_string());
        }
        if self.clean_wrapper_scripts {
            excludes.extend(WRAPPER_SCRIPTS.iter().map(|s| s.to_string()));
        }
        Ok(excludes)
    }
}

/// Runs all commands with at most `max_concurrency` generators at a time and
/// waits for every one of them. Results keep the order of `commands`.
pub async fn execute_all(
    commands: Vec<SbomCommand>,
    max_concurrency: usize,
) -> Vec<(SbomCommand, Result<SbomResult>)> {
    let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let futures: Vec<_> = commands
        .into_iter()
        .map(|command| {
            let sem = sem.clone();
            async move {
                let result = match sem.acquire().await {
                    Ok(_permit) => command.execute().await,
                    Err(e) => Err(anyhow::Error::new(e).context("generator pool closed")),
                };
                (command, result)
            }
        })
        .collect();
    join_all(futures).await
}

/// Joins every location along the path, stripped of surrounding slashes.
fn analysis_subdir(path: &ConfigPath<'_>) -> String {
    path.slice(RepoConfig::location)
        .into_iter()
        .map(|location| location.trim().trim_matches('/'))
        .filter(|location| !location.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn analysis_folder(repo_dir: &Path, path: &ConfigPath<'_>) -> PathBuf {
    let subdir = analysis_subdir(path);
    if subdir.is_empty() {
        repo_dir.to_path_buf()
    } else {
        repo_dir.join(subdir)
    }
}

/// `default` when no node names itself, otherwise `default-name1-name2`.
pub fn project_name(default: &str, path: &ConfigPath<'_>) -> String {
    let names: Vec<&str> = path
        .slice(RepoConfig::project_name)
        .into_iter()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        default.to_string()
    } else {
        format!("{default}-{}", names.join("-"))
    }
}

/// Deletes entries below `dir` matching any exclude pattern. Matched
/// directories are removed whole. Returns the number of removed entries.
fn remove_excluded_files(dir: &Path, excludes: &[String]) -> Result<usize> {
    if excludes.is_empty() || !dir.is_dir() {
        return Ok(0);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in excludes {
        let glob = Glob::new(pattern).with_context(|| format!("invalid exclude pattern '{pattern}'"))?;
        builder.add(glob);
    }
    let set = builder.build().context("failed to build exclude set")?;

    let mut matched = Vec::new();
    let mut walker = WalkDir::new(dir).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.context("failed to read directory entry")?;
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if set.is_match(relative) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            matched.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    for (path, is_dir) in &matched {
        let removed = if *is_dir {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        removed.with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(matched.len())
}
