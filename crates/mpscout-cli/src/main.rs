use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use mpscout_adapters::{FixturePage, PageSession, WebDriverOptions, WebDriverSession};
use mpscout_core::RunSummary;
use mpscout_sync::{
    plan_search, PlanError, RunSettings, ScoutConfig, ScoutPipeline, SearchPlan, DEFAULT_CONFIG_PATH,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mpscout")]
#[command(about = "Scouts marketplace search results for fresh local listings")]
struct Cli {
    /// Location slug, or `all` to use the configured location and search terms.
    location: String,
    /// Required unless LOCATION is `all`.
    search_term: Option<String>,
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Replay a page fixture instead of driving a browser.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match ScoutConfig::read(&cli.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let config_found = loaded.is_some();
    let config = loaded.unwrap_or_default().with_env_overrides();

    if let Err(err) = init_tracing(config.output.log_file.as_deref()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    if !config_found {
        warn!(path = %cli.config.display(), "config file not found; using defaults");
    }

    let plan = match plan_search(&config, &cli.location, cli.search_term.as_deref()) {
        Ok(plan) => plan,
        Err(PlanError::MissingSearchTerm) => Cli::command()
            .error(ErrorKind::MissingRequiredArgument, PlanError::MissingSearchTerm)
            .exit(),
        Err(err) => {
            error!(error = %err, "CRITICAL: cannot run in config-driven mode");
            return ExitCode::FAILURE;
        }
    };
    info!(location = %plan.location, terms = ?plan.terms, "starting scout");

    match run(&cli, &config, &plan).await {
        Ok(summary) => {
            for term in &summary.terms {
                info!(
                    term = %term.term,
                    committed = term.committed,
                    error = term.error.as_deref().unwrap_or(""),
                    "term summary"
                );
            }
            info!(
                run_id = %summary.run_id,
                new_records = summary.new_records,
                elapsed = ?summary.elapsed(),
                "scraping complete; found {} new listings",
                summary.new_records
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "CRITICAL: scout run aborted");
            ExitCode::FAILURE
        }
    }
}

/// Stderr always; the configured log file as well, appended in plain text.
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn run(cli: &Cli, config: &ScoutConfig, plan: &SearchPlan) -> Result<RunSummary> {
    let mut pipeline = ScoutPipeline::new(RunSettings::from_config(config))?;
    match &cli.fixture {
        Some(path) => {
            let session = FixturePage::from_file(path)?;
            info!(fixture = %path.display(), "replaying page fixture");
            drive(&mut pipeline, &session, plan).await
        }
        None => {
            let options = WebDriverOptions {
                webdriver_url: config.advanced.webdriver_url.clone(),
                headless: config.advanced.headless,
                ..WebDriverOptions::default()
            };
            let session = WebDriverSession::connect(&options)
                .await
                .with_context(|| format!("starting browser session via {}", options.webdriver_url))?;
            drive(&mut pipeline, &session, plan).await
        }
    }
}

/// Runs the pipeline and closes the session whether or not the run succeeded.
async fn drive<S: PageSession>(
    pipeline: &mut ScoutPipeline,
    session: &S,
    plan: &SearchPlan,
) -> Result<RunSummary> {
    let result = pipeline.run(session, &plan.terms, &plan.location).await;
    if let Err(err) = session.close().await {
        warn!(error = %err, "browser session did not close cleanly");
    }
    Ok(result?)
}
