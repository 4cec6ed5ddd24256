use tokio::time::error::Elapsed;

use crate::github::{CommitState, CommitStatus};
use crate::tracking::{Project, TrackingError};

pub fn pending() -> CommitStatus {
    CommitStatus {
        state: CommitState::Pending,
        description: "SBOM creation running".to_string(),
        target_url: None,
    }
}

/// Final commit status for a push analysis.
pub fn completed(result: &anyhow::Result<Project>) -> CommitStatus {
    match result {
        Ok(Project::Available { url, .. }) => CommitStatus {
            state: CommitState::Success,
            description: "SBOM available".to_string(),
            target_url: Some(url.clone()),
        },
        Ok(Project::List { search_url }) => CommitStatus {
            state: CommitState::Success,
            description: "SBOMs available".to_string(),
            target_url: Some(search_url.clone()),
        },
        Ok(Project::None) => CommitStatus {
            state: CommitState::Success,
            description: "no SBOM available".to_string(),
            target_url: None,
        },
        Err(e) => failed(e),
    }
}

fn failed(error: &anyhow::Error) -> CommitStatus {
    if error.downcast_ref::<Elapsed>().is_some() {
        return CommitStatus {
            state: CommitState::Failure,
            description: "SBOM analysis timed out".to_string(),
            target_url: None,
        };
    }
    let description = match error.downcast_ref::<TrackingError>() {
        Some(tracking) => format!("SBOM creation failed: {tracking}"),
        None => "SBOM creation failed".to_string(),
    };
    CommitStatus {
        state: CommitState::Error,
        description,
        target_url: None,
    }
}
