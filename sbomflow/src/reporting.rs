use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::process::{self, ProcessResult};
use crate::settings::{ReportingSettings, Scanner};

/// File the vulnerability scanner renders its template into.
pub const REPORT_FILE: &str = "report.txt";

/// Directory depscan writes its reports to, next to the sbom.
const DEPSCAN_REPORT_DIR: &str = "depscan-reports";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VulnerabilityReport {
    Report { text: String, project_name: String },
    None,
}

impl VulnerabilityReport {
    /// Merges per-project reports into one. Several reports are concatenated,
    /// each under a heading naming its project; the result is attributed to
    /// `project_name`.
    pub fn combine(reports: Vec<VulnerabilityReport>, project_name: &str) -> VulnerabilityReport {
        let mut reports: Vec<(String, String)> = reports
            .into_iter()
            .filter_map(|r| match r {
                VulnerabilityReport::Report { text, project_name } => Some((text, project_name)),
                VulnerabilityReport::None => None,
            })
            .collect();

        match reports.len() {
            0 => VulnerabilityReport::None,
            1 => {
                let (text, project_name) = reports.remove(0);
                VulnerabilityReport::Report { text, project_name }
            }
            _ => VulnerabilityReport::Report {
                text: reports
                    .iter()
                    .map(|(text, name)| format!("# {name} \n\n {text} \n"))
                    .collect(),
                project_name: project_name.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityScore(pub String);

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum VulnerabilityScanner {
    Grype {
        command: String,
        template: PathBuf,
        config: Option<String>,
    },
    Depscan {
        command: String,
        template: PathBuf,
    },
}

impl VulnerabilityScanner {
    /// Command line, environment and report location (relative to the sbom
    /// directory) for scanning `sbom_file`.
    fn invocation(&self, sbom_file: &Path) -> (String, HashMap<String, String>, PathBuf) {
        match self {
            VulnerabilityScanner::Grype { command, template, config } => {
                let mut command_line = format!(
                    "{command} -q --by-cve -o template -t {} --file {REPORT_FILE} sbom:{}",
                    absolute(template).display(),
                    absolute(sbom_file).display(),
                );
                if let Some(config) = config {
                    command_line.push_str(&format!(" -c {config}"));
                }
                let env = HashMap::from([("GRYPE_DB_AUTO_UPDATE".to_string(), "true".to_string())]);
                (command_line, env, PathBuf::from(REPORT_FILE))
            }
            VulnerabilityScanner::Depscan { command, template } => {
                let command_line = format!(
                    "{command} --no-vuln-table --no-banner --reports-dir {DEPSCAN_REPORT_DIR} \
                     --report-template {} --report-name {REPORT_FILE} --bom {}",
                    absolute(template).display(),
                    absolute(sbom_file).display(),
                );
                (command_line, HashMap::new(), Path::new(DEPSCAN_REPORT_DIR).join(REPORT_FILE))
            }
        }
    }
}

/// Runs the vulnerability scanner and the quality scorer against sbom files.
#[derive(Debug, Clone)]
pub struct ReportingClient {
    scanner: Option<VulnerabilityScanner>,
    sbomqs_command: String,
}

impl ReportingClient {
    pub fn new(settings: &ReportingSettings) -> Self {
        let scanner = match settings.scanner {
            Scanner::Grype => settings.grype_template.as_ref().map(|template| VulnerabilityScanner::Grype {
                command: settings.grype_command.clone(),
                template: PathBuf::from(template),
                config: settings.grype_config.clone(),
            }),
            Scanner::Depscan => settings.depscan_template.as_ref().map(|template| VulnerabilityScanner::Depscan {
                command: settings.depscan_command.clone(),
                template: PathBuf::from(template),
            }),
        };
        Self {
            scanner,
            sbomqs_command: settings.sbomqs_command.clone(),
        }
    }

    /// Scans `sbom_file` and reads the rendered report. Without a configured
    /// template, or when the scanner writes no report, there is no report.
    #[instrument(skip(self), fields(sbom = %sbom_file.display()))]
    pub async fn create_vulnerability_report(
        &self,
        sbom_file: &Path,
        project_name: &str,
    ) -> Result<VulnerabilityReport> {
        let Some(scanner) = &self.scanner else {
            return Ok(VulnerabilityReport::None);
        };
        let report_dir = sbom_file
            .parent()
            .ok_or_else(|| anyhow!("sbom file {} has no parent directory", sbom_file.display()))?;

        let (command_line, env, report_file) = scanner.invocation(sbom_file);
        match process::run(&command_line, report_dir, &env).await {
            ProcessResult::Success { .. } => read_report(&report_dir.join(report_file), project_name).await,
            ProcessResult::Failure { cause, .. } => {
                Err(cause.context(format!("vulnerability scan failed for project '{project_name}'")))
            }
        }
    }

    /// Overall quality score of `sbom_file`, taken from the scorer's short
    /// output `<score> <file>`.
    #[instrument(skip(self), fields(sbom = %sbom_file.display()))]
    pub async fn calculate_quality_score(&self, sbom_file: &Path) -> Result<QualityScore> {
        let sbom_file = absolute(sbom_file);
        let filename = sbom_file.display().to_string();
        let working_dir = sbom_file.parent().unwrap_or_else(|| Path::new("."));
        let command_line = format!("{} score -b {filename}", self.sbomqs_command);

        match process::run(&command_line, working_dir, &HashMap::new()).await {
            ProcessResult::Success { output_lines } => {
                let score = parse_score(&output_lines, &filename)?;
                info!(%score, "quality score calculated");
                Ok(score)
            }
            ProcessResult::Failure { cause, .. } => Err(cause.context("quality scoring failed")),
        }
    }
}

async fn read_report(report_file: &Path, project_name: &str) -> Result<VulnerabilityReport> {
    if !tokio::fs::try_exists(report_file).await.unwrap_or(false) {
        warn!(file = %report_file.display(), "scanner wrote no report");
        return Ok(VulnerabilityReport::None);
    }
    let text = tokio::fs::read_to_string(report_file)
        .await
        .with_context(|| format!("failed to read {}", report_file.display()))?;
    Ok(VulnerabilityReport::Report {
        text,
        project_name: project_name.to_string(),
    })
}

/// Finds the line `<score> <filename>`; other output is ignored.
fn parse_score(output_lines: &[String], filename: &str) -> Result<QualityScore> {
    let pattern = Regex::new(&format!(r"^(\d+(?:\.\d+)?)\s+{}$", regex::escape(filename)))
        .context("invalid score pattern")?;
    output_lines
        .iter()
        .find_map(|line| pattern.captures(line.trim()).map(|caps| QualityScore(caps[1].to_string())))
        .ok_or_else(|| anyhow!("no quality score for {filename} in scorer output"))
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
