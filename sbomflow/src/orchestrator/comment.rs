use anyhow::Result;
use tracing::{info, instrument};

use crate::github::GitHubClient;
use crate::reporting::VulnerabilityReport;

/// Trailing line identifying the one comment this service owns on a pull request.
pub const MARKER: &str = "[//]: # (sbomflow)";

/// Placeholder in report templates replaced by the project search link.
pub const DEPENDENCY_TRACK_URL: &str = "DEPENDENCY_TRACK_URL";

/// `sboms` is the number of documents generated for the commit; without any
/// there is nothing a report could have been built from.
pub fn comment_body(report: &VulnerabilityReport, sboms: usize, search_url: &str, commit_sha: &str) -> String {
    let text = match report {
        VulnerabilityReport::Report { text, .. } => text.replace(DEPENDENCY_TRACK_URL, search_url),
        VulnerabilityReport::None if sboms == 0 => {
            format!("No SBOM available for commit {commit_sha}, so no vulnerability report was created.")
        }
        VulnerabilityReport::None => {
            format!("SBOM created for commit {commit_sha}, but no vulnerability report is available.")
        }
    };
    format!("{text}\n\n{MARKER}")
}

/// Replaces the body of the marked comment on pull request `number`, or
/// creates it when there is none yet.
#[instrument(skip(github, body))]
pub async fn upsert_comment(github: &GitHubClient, repo: &str, number: u64, body: &str) -> Result<()> {
    let existing = github
        .list_comments(repo, number)
        .await?
        .into_iter()
        .find(|c| c.body.trim_end().ends_with(MARKER));

    match existing {
        Some(comment) => {
            github.update_comment(repo, comment.id, body).await?;
            info!(comment = comment.id, "updated pull request comment");
        }
        None => {
            github.create_comment(repo, number, body).await?;
            info!("created pull request comment");
        }
    }
    Ok(())
}
