pub mod checkout;
pub mod context;
pub mod event;
pub mod github;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod repo_config;
pub mod reporting;
pub mod sbom;
pub mod settings;
pub mod tracking;

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use output::ProjectEntry;
use repo_config::RepoConfig;
use sbom::{HostEnvironment, SbomGenerator, execute_all};
use settings::Settings;

pub use orchestrator::{EventOutcome, Orchestrator};

/// Generates sboms for every sub-project of a local directory without
/// uploading them. The directory is copied first so excludes never touch it.
///
/// Without an explicit `config` the repository's own config file is used,
/// if it has one.
pub async fn analyze_directory(
    settings: &Settings,
    dir: &Path,
    project_name: &str,
    config: Option<RepoConfig>,
) -> Result<Vec<ProjectEntry>> {
    let local = checkout::copy_directory(dir).await?;
    let config = match config {
        Some(config) => Some(config),
        None => RepoConfig::load(local.path())?,
    };

    let generator = SbomGenerator::new(settings, HostEnvironment::capture());
    let commands = generator.create_commands(
        local.path(),
        project_name,
        settings.analysis.fetch_licenses,
        config.as_ref(),
    )?;
    info!(projects = commands.len(), "generating sboms");

    let results = execute_all(commands, settings.app.max_concurrency).await;
    let entries = results
        .iter()
        .map(|(command, result)| ProjectEntry::new(command, result, local.path()))
        .collect();

    if let Err(e) = local.close() {
        warn!(error = %e, "failed to remove scratch directory");
    }
    Ok(entries)
}
