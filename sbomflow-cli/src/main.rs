mod cli;

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{AnalyzeArgs, Cli, Command};
use sbomflow::output;
use sbomflow::repo_config::RepoConfig;
use sbomflow::settings::Settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command {
        Command::Analyze(args) => analyze(args).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over the verbosity flags when set.
fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.verbosity.tracing_level_filter().to_string()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Returns whether every sub-project succeeded.
async fn analyze(args: AnalyzeArgs) -> Result<bool> {
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => {
            let mut settings = Settings::default();
            settings.apply_env_overrides(|key| std::env::var(key).ok());
            settings.validate()?;
            settings
        }
    };

    let config = match &args.repo_config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            RepoConfig::from_yaml(&content)
                .with_context(|| format!("invalid repository config {}", path.display()))?
        }
        None => None,
    };

    let entries = sbomflow::analyze_directory(&settings, &args.dir, &args.name, config).await?;

    let mut stdout = std::io::stdout().lock();
    output::formatter(args.json)
        .write_results(&entries, &mut stdout)
        .context("failed to write results")?;

    Ok(!entries.iter().any(|e| e.is_failure()))
}
