use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Generate SBOMs for repositories and their sub-projects
#[derive(Parser)]
#[command(name = "sbomflow", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate an SBOM per sub-project of a local directory
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Directory to analyse; it is copied before anything runs
    pub dir: PathBuf,

    /// Project name used for the top-level project
    #[arg(short, long)]
    pub name: String,

    /// Repository config to use instead of the directory's own
    #[arg(long)]
    pub repo_config: Option<PathBuf>,

    /// Application settings file (TOML)
    #[arg(short, long, env = "SBOMFLOW_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}
