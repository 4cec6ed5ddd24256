use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};

/// Conventional location of the repository configuration file.
pub const CONFIG_FILE: &str = ".github/sbomflow.yml";

/// Nesting of `projects` deeper than this is rejected.
pub const MAX_CONFIG_DEPTH: usize = 16;

/// One node of a repository's configuration tree. Every field is optional:
/// an absent value means "inherit from the ancestors, or the global default".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub enable: Option<bool>,
    pub enable_pull_request_report: Option<bool>,
    pub project: Option<ProjectConfig>,
    pub analysis: Option<AnalysisConfig>,
    pub gradle: Option<BuildToolConfig>,
    pub maven: Option<BuildToolConfig>,
    pub jdk: Option<JdkConfig>,
    pub env: Option<BTreeMap<String, String>>,
    pub projects: Option<Vec<RepoConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProjectConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnalysisConfig {
    pub location: Option<String>,
    pub recursive: Option<bool>,
    pub excludes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BuildToolConfig {
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JdkConfig {
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: Option<String>,
}

// `version: 17` and `version: "17"` are both common in the wild.
fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|s| match s {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
    }))
}

impl RepoConfig {
    /// Parses a YAML document. An empty document yields `None`.
    pub fn from_yaml(content: &str) -> Result<Option<RepoConfig>> {
        let body = content.trim();
        if body.is_empty() || body == "---" {
            return Ok(None);
        }

        let config: Option<RepoConfig> =
            serde_yaml::from_str(content).context("failed to parse repository config")?;
        if let Some(config) = &config {
            let depth = config.depth();
            if depth > MAX_CONFIG_DEPTH {
                bail!("repository config nests {depth} levels deep, limit is {MAX_CONFIG_DEPTH}");
            }
        }
        Ok(config)
    }

    /// Reads `CONFIG_FILE` below `repo_dir`. A missing file yields `None`.
    pub fn load(repo_dir: &Path) -> Result<Option<RepoConfig>> {
        let path = repo_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Number of levels in this tree, counting this node as 1.
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(RepoConfig::depth)
            .max()
            .unwrap_or(0)
    }

    pub fn children(&self) -> &[RepoConfig] {
        self.projects.as_deref().unwrap_or_default()
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project.as_ref()?.name.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.analysis.as_ref()?.location.as_deref()
    }

    pub fn recursive(&self) -> Option<bool> {
        self.analysis.as_ref()?.recursive
    }

    pub fn excludes(&self) -> Option<&[String]> {
        self.analysis.as_ref()?.excludes.as_deref()
    }

    pub fn gradle_args(&self) -> Option<&[String]> {
        self.gradle.as_ref()?.args.as_deref()
    }

    pub fn maven_args(&self) -> Option<&[String]> {
        self.maven.as_ref()?.args.as_deref()
    }

    pub fn jdk_version(&self) -> Option<&str> {
        self.jdk.as_ref()?.version.as_deref()
    }
}

/// Root-to-leaf sequence of configuration nodes describing one sub-project.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPath<'a> {
    nodes: Vec<&'a RepoConfig>,
}

impl<'a> ConfigPath<'a> {
    pub fn new(nodes: Vec<&'a RepoConfig>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[&'a RepoConfig] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaf(&self) -> Option<&'a RepoConfig> {
        self.nodes.last().copied()
    }

    /// Values present along the path in root-to-leaf order. Nodes that do
    /// not set the field are skipped, never defaulted.
    pub fn slice<V>(&self, accessor: impl Fn(&'a RepoConfig) -> Option<V>) -> Vec<V> {
        self.nodes.iter().copied().filter_map(accessor).collect()
    }

    /// The value closest to the leaf.
    pub fn last<V>(&self, accessor: impl Fn(&'a RepoConfig) -> Option<V>) -> Option<V> {
        self.nodes.iter().rev().copied().find_map(accessor)
    }
}

/// Every root-to-leaf path of the tree, depth-first in declaration order.
/// `None` yields no paths; a root without children yields one path.
pub fn build_config_paths(root: Option<&RepoConfig>) -> Vec<ConfigPath<'_>> {
    let mut paths = Vec::new();
    if let Some(root) = root {
        let mut prefix = Vec::new();
        collect_paths(root, &mut prefix, &mut paths);
    }
    paths
}

fn collect_paths<'a>(
    node: &'a RepoConfig,
    prefix: &mut Vec<&'a RepoConfig>,
    paths: &mut Vec<ConfigPath<'a>>,
) {
    if prefix.len() >= MAX_CONFIG_DEPTH {
        tracing::warn!(depth = prefix.len(), "config nesting limit reached, subtree ignored");
        return;
    }

    prefix.push(node);
    if node.children().is_empty() {
        paths.push(ConfigPath::new(prefix.clone()));
    } else {
        for child in node.children() {
            collect_paths(child, prefix, paths);
        }
    }
    prefix.pop();
}
