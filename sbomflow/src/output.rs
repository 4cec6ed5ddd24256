use anyhow::Result;
use serde::Serialize;

use crate::sbom::{SbomCommand, SbomResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Generated,
    Empty,
    Failed,
}

/// Outcome of one sub-project, as printed by the CLI.
#[derive(Debug, Serialize)]
pub struct ProjectEntry {
    pub project_name: String,
    pub analysis_dir: String,
    pub status: EntryStatus,
    /// `group:name:version` of a named document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub components: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProjectEntry {
    /// `root` is stripped from the analysis directory so output does not
    /// depend on where the scratch copy lives.
    pub fn new(command: &SbomCommand, result: &Result<SbomResult>, root: &std::path::Path) -> Self {
        let analysis_dir = command
            .analysis_dir
            .strip_prefix(root)
            .unwrap_or(&command.analysis_dir)
            .display()
            .to_string();
        let mut entry = ProjectEntry {
            project_name: command.project_name.clone(),
            analysis_dir: if analysis_dir.is_empty() { ".".to_string() } else { analysis_dir },
            status: EntryStatus::Empty,
            component: None,
            components: 0,
            validation_issues: vec![],
            error: None,
        };
        match result {
            Ok(SbomResult::Yield(sbom)) => {
                entry.status = EntryStatus::Generated;
                entry.component = sbom
                    .component
                    .as_ref()
                    .map(|c| format!("{}:{}:{}", c.group, c.name, c.version));
                entry.components = sbom.bom.components.len();
                entry.validation_issues = sbom.validation_issues.clone();
            }
            Ok(SbomResult::None) => {}
            Err(e) => {
                entry.status = EntryStatus::Failed;
                entry.error = Some(format!("{e:#}"));
            }
        }
        entry
    }

    pub fn is_failure(&self) -> bool {
        self.status == EntryStatus::Failed
    }
}

pub trait OutputFormatter {
    fn write_results(&self, entries: &[ProjectEntry], writer: &mut dyn std::io::Write) -> std::io::Result<()>;
}

pub struct TextOutput;

impl OutputFormatter for TextOutput {
    fn write_results(&self, entries: &[ProjectEntry], writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        for entry in entries {
            writeln!(writer, "{} ({})", entry.project_name, entry.analysis_dir)?;
            match entry.status {
                EntryStatus::Generated => {
                    let component = entry.component.as_deref().unwrap_or("unnamed");
                    writeln!(writer, "  sbom: {component}, {} components", entry.components)?;
                }
                EntryStatus::Empty => writeln!(writer, "  sbom: none")?,
                EntryStatus::Failed => {
                    writeln!(writer, "  failed: {}", entry.error.as_deref().unwrap_or("unknown error"))?;
                }
            }
            for issue in &entry.validation_issues {
                writeln!(writer, "  issue: {issue}")?;
            }
        }
        Ok(())
    }
}

pub struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn write_results(&self, entries: &[ProjectEntry], writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        serde_json::to_writer_pretty(&mut *writer, entries)?;
        writeln!(writer)?;
        Ok(())
    }
}

pub fn formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json {
        Box::new(JsonOutput)
    } else {
        Box::new(TextOutput)
    }
}
