use std::fmt;

/// Identity of one analysis run, threaded through every step instead of
/// living in thread-local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisContext {
    pub repo_full_name: String,
    pub git_ref: String,
    pub trace_id: String,
    pub commit_sha: Option<String>,
}

impl AnalysisContext {
    pub fn new(
        repo_full_name: impl Into<String>,
        git_ref: impl Into<String>,
        commit_sha: Option<String>,
    ) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            git_ref: git_ref.into(),
            trace_id: new_trace_id(),
            commit_sha: commit_sha.filter(|sha| !sha.trim().is_empty()),
        }
    }

    /// Key identifying the same origin of an analysis: repo, ref and commit.
    pub fn unique_id(&self) -> String {
        format!(
            "{}#{}#{}",
            self.repo_full_name,
            self.git_ref,
            self.commit_sha.as_deref().unwrap_or("")
        )
    }
}

impl fmt::Display for AnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.repo_full_name, self.git_ref, self.trace_id)
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
