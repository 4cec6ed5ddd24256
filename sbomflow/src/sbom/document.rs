use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// The subset of a CycloneDX document the pipeline inspects.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bom {
    pub bom_format: Option<String>,
    pub spec_version: Option<String>,
    pub metadata: Option<Metadata>,
    pub components: Vec<Component>,
    pub dependencies: Vec<Value>,
    pub services: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub component: Option<Component>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Component {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Group, name and version of the document's top-level component, all non-blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentId {
    pub group: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct SbomYield {
    /// The raw document, uploaded as-is.
    pub document: Value,
    pub bom: Bom,
    /// `None` for an unnamed document; the caller supplies a name.
    pub component: Option<ComponentId>,
    pub validation_issues: Vec<String>,
    pub sbom_file: PathBuf,
    pub project_name: String,
}

#[derive(Debug, Clone)]
pub enum SbomResult {
    Yield(SbomYield),
    None,
}

impl SbomResult {
    pub fn as_yield(&self) -> Option<&SbomYield> {
        match self {
            SbomResult::Yield(y) => Some(y),
            SbomResult::None => None,
        }
    }
}

impl Bom {
    fn component_id(&self) -> Option<ComponentId> {
        let component = self.metadata.as_ref()?.component.as_ref()?;
        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(ComponentId {
            group: non_blank(&component.group)?,
            name: non_blank(&component.name)?,
            version: non_blank(&component.version)?,
        })
    }

    fn is_empty(&self) -> bool {
        self.components.is_empty() && self.dependencies.is_empty() && self.services.is_empty()
    }

    /// Structural checks stricter than what the tracking backend requires.
    /// Findings are informational only.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        match self.bom_format.as_deref() {
            Some("CycloneDX") => {}
            Some(other) => issues.push(format!("bomFormat is '{other}', expected 'CycloneDX'")),
            None => issues.push("bomFormat is missing".to_string()),
        }
        if self.spec_version.is_none() {
            issues.push("specVersion is missing".to_string());
        }
        for (idx, component) in self.components.iter().enumerate() {
            if component.name.as_deref().is_none_or(|n| n.trim().is_empty()) {
                issues.push(format!("components[{idx}] has no name"));
            }
            if component.kind.is_none() {
                issues.push(format!("components[{idx}] has no type"));
            }
        }
        issues
    }
}

/// Reads a generator output file.
///
/// A missing file is `SbomResult::None`. An unreadable or unparseable file is
/// an error. A document with a fully named top-level component is a named
/// yield; an unnamed document is only a yield if it lists components,
/// dependencies or services.
pub fn parse_sbom_file(sbom_file: &Path, project_name: &str) -> Result<SbomResult> {
    if !sbom_file.exists() {
        debug!(file = %sbom_file.display(), "no sbom file written");
        return Ok(SbomResult::None);
    }

    let content = std::fs::read(sbom_file)
        .with_context(|| format!("cannot read file {}", sbom_file.display()))?;
    let document: Value = serde_json::from_slice(&content)
        .with_context(|| format!("{} is not valid JSON", sbom_file.display()))?;
    let bom = Bom::deserialize(&document)
        .with_context(|| format!("{} is not a CycloneDX document", sbom_file.display()))?;

    let validation_issues = bom.validate();
    if !validation_issues.is_empty() {
        warn!(
            project = project_name,
            issues = validation_issues.len(),
            "sbom has validation issues: {}",
            validation_issues.join("; ")
        );
    }

    let component = bom.component_id();
    if component.is_none() && bom.is_empty() {
        return Ok(SbomResult::None);
    }

    Ok(SbomResult::Yield(SbomYield {
        document,
        bom,
        component,
        validation_issues,
        sbom_file: sbom_file.to_path_buf(),
        project_name: project_name.to_string(),
    }))
}
