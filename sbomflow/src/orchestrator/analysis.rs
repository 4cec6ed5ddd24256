use anyhow::Result;
use futures::future::join_all;
use tracing::{info, warn};

use crate::event::RepositoryDetails;
use crate::reporting::{ReportingClient, VulnerabilityReport};
use crate::sbom::{SbomCommand, SbomResult, SbomYield};
use crate::tracking::{Project, TrackingClient};

pub type CommandResults = Vec<(SbomCommand, Result<SbomResult>)>;

/// Splits generator results into usable documents and failures. Empty
/// results are dropped.
fn partition(results: CommandResults) -> (Vec<SbomYield>, Vec<anyhow::Error>) {
    let mut yields = vec![];
    let mut failures = vec![];
    for (command, result) in results {
        match result {
            Ok(SbomResult::Yield(sbom)) => yields.push(sbom),
            Ok(SbomResult::None) => info!(project = %command.project_name, "nothing to analyse"),
            Err(e) => {
                warn!(project = %command.project_name, command = %command.command_line, error = %e, "sbom generation failed");
                failures.push(e);
            }
        }
    }
    (yields, failures)
}

/// Uploads every generated document, grouped under a parent project when
/// there are several, and folds the outcomes into one `Project`.
pub async fn upload_results(
    tracking: &TrackingClient,
    reporting: &ReportingClient,
    details: &RepositoryDetails,
    commit_sha: Option<&str>,
    results: CommandResults,
) -> Result<Project> {
    let (yields, mut failures) = partition(results);

    let parent = if yields.len() > 1 {
        match tracking.create_or_update_parent_project(details, commit_sha).await {
            Ok(parent) => parent,
            Err(e) => {
                let error = format!("{e:#}");
                warn!(%error, "continuing without parent project");
                Project::None
            }
        }
    } else {
        Project::None
    };

    let uploads = yields
        .iter()
        .map(|sbom| upload_one(tracking, reporting, details, &parent, commit_sha, sbom));
    let mut projects = vec![];
    for outcome in join_all(uploads).await {
        match outcome {
            Ok(project) => projects.push(project),
            Err(e) => failures.push(e),
        }
    }

    aggregate_projects(projects, failures, &tracking.search_url(&details.name))
}

async fn upload_one(
    tracking: &TrackingClient,
    reporting: &ReportingClient,
    details: &RepositoryDetails,
    parent: &Project,
    commit_sha: Option<&str>,
    sbom: &SbomYield,
) -> Result<Project> {
    let details = match reporting.calculate_quality_score(&sbom.sbom_file).await {
        Ok(score) => details.clone().with_topic(format!("sbom-quality-score={score}")),
        Err(e) => {
            warn!(project = %sbom.project_name, error = %e, "quality score unavailable");
            details.clone()
        }
    };
    tracking
        .upload_sbom(&details, &sbom.document, &sbom.project_name, parent, commit_sha)
        .await
        .map_err(|e| e.context(format!("upload of project {} failed", sbom.project_name)))
}

/// Any failure fails the whole event; otherwise zero projects is `None`, one
/// is that project and several are listed through `search_url`.
pub fn aggregate_projects(
    projects: Vec<Project>,
    failures: Vec<anyhow::Error>,
    search_url: &str,
) -> Result<Project> {
    let failed = failures.len();
    if let Some(first) = failures.into_iter().next() {
        return Err(first.context(format!(
            "{failed} of {} sub-projects failed",
            failed + projects.len()
        )));
    }

    let mut available: Vec<Project> = projects
        .into_iter()
        .filter(|p| matches!(p, Project::Available { .. }))
        .collect();
    Ok(match available.len() {
        0 => Project::None,
        1 => available.remove(0),
        _ => Project::List {
            search_url: search_url.to_string(),
        },
    })
}

/// Combined vulnerability report of a pull request and the number of
/// documents it was built from.
#[derive(Debug)]
pub struct PullRequestReport {
    pub report: VulnerabilityReport,
    pub sboms: usize,
}

/// Vulnerability report over every generated document. Failures along the
/// way only cost their own sub-report.
pub async fn report_results(
    reporting: &ReportingClient,
    repo_name: &str,
    results: CommandResults,
) -> PullRequestReport {
    let (yields, _failures) = partition(results);
    let reports = join_all(
        yields
            .iter()
            .map(|sbom| reporting.create_vulnerability_report(&sbom.sbom_file, &sbom.project_name)),
    )
    .await;

    let reports = reports
        .into_iter()
        .zip(&yields)
        .map(|(report, sbom)| {
            report.unwrap_or_else(|e| {
                warn!(project = %sbom.project_name, error = %e, "vulnerability report failed");
                VulnerabilityReport::None
            })
        })
        .collect();
    PullRequestReport {
        report: VulnerabilityReport::combine(reports, repo_name),
        sboms: yields.len(),
    }
}
