use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::event::Repository;
use crate::github::GitHubClient;

/// A checked-out tree in a scratch directory, removed when dropped.
#[derive(Debug)]
pub struct LocalRepository {
    dir: TempDir,
}

impl LocalRepository {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("sbomflow-")
            .tempdir()
            .context("failed to create checkout directory")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the directory now, reporting failures instead of ignoring them.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("failed to remove {}", path.display()))
    }
}

/// Makes the tree of a repository ref available locally.
#[async_trait]
pub trait Checkout: Send + Sync {
    async fn checkout(&self, repository: &Repository, git_ref: &str) -> Result<LocalRepository>;
}

/// Downloads the ref as a tarball from the GitHub API.
pub struct GitHubCheckout {
    github: GitHubClient,
}

impl GitHubCheckout {
    pub fn new(github: GitHubClient) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Checkout for GitHubCheckout {
    #[instrument(skip(self, repository), fields(repo = %repository.full_name))]
    async fn checkout(&self, repository: &Repository, git_ref: &str) -> Result<LocalRepository> {
        let tarball = self
            .github
            .download_tarball(&repository.full_name, git_ref)
            .await?;
        let local = LocalRepository::new()?;
        let target = local.path().to_path_buf();
        let files = tokio::task::spawn_blocking(move || unpack_tarball(tarball.as_slice(), &target))
            .await
            .context("tarball extraction task panicked")??;
        info!(files, dir = %local.path().display(), "checked out");
        Ok(local)
    }
}

/// Copies a directory on this machine; the event's ref is ignored.
pub struct LocalDirCheckout {
    source: PathBuf,
}

impl LocalDirCheckout {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl Checkout for LocalDirCheckout {
    #[instrument(skip(self, repository), fields(source = %self.source.display()))]
    async fn checkout(&self, repository: &Repository, git_ref: &str) -> Result<LocalRepository> {
        debug!(repo = %repository.full_name, git_ref, "copying local checkout");
        copy_directory(&self.source).await
    }
}

/// Copies `source` into a new scratch directory.
pub async fn copy_directory(source: &Path) -> Result<LocalRepository> {
    if !source.is_dir() {
        bail!("{} is not a directory", source.display());
    }
    let local = LocalRepository::new()?;
    let source = source.to_path_buf();
    let target = local.path().to_path_buf();
    let files = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
        .await
        .context("copy task panicked")??;
    info!(files, dir = %local.path().display(), "copied to scratch directory");
    Ok(local)
}

/// Unpacks a gzipped tarball into `target`, dropping the single top-level
/// folder GitHub wraps every archive in. Links are never created, so later
/// entries cannot be written through them. Returns the number of files written.
pub fn unpack_tarball(data: impl Read, target: &Path) -> Result<usize> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = 0;
    for entry in archive.entries().context("failed to read tarball")? {
        let mut entry = entry.context("corrupt tarball entry")?;
        let path = entry.path().context("invalid path in tarball")?.into_owned();
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            debug!(path = %path.display(), "link entry skipped");
            continue;
        }
        let Some(relative) = strip_top_folder(&path) else {
            continue;
        };
        let destination = target.join(&relative);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        entry
            .unpack(&destination)
            .with_context(|| format!("failed to unpack {}", relative.display()))?;
        if entry.header().entry_type().is_file() {
            files += 1;
        }
    }
    Ok(files)
}

/// `None` for the top folder itself and for paths leaving the archive root.
fn strip_top_folder(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;
    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}

fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.with_context(|| format!("failed to read {}", source.display()))?;
        let relative = entry.path().strip_prefix(source)?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)
                .with_context(|| format!("failed to create {}", destination.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
            files += 1;
        }
    }
    Ok(files)
}
