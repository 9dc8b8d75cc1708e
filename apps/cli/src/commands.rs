//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use tracing::info;

use webcrawl_crawler::{validate_job, MultiKBCoordinator};
use webcrawl_shared::config::load_job_config;
use webcrawl_shared::CoordinatorEvent;

/// webcrawl — a scoped web crawler and scraper for multi-KB jobs.
#[derive(Parser)]
#[command(
    name = "webcrawl",
    version,
    about = "Run a scoped, multi-knowledge-base crawl job from a TOML config.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a crawl job and print the final `JobResult` as JSON on stdout.
    Run {
        /// Path to a job config TOML file.
        config: PathBuf,

        /// Print progress events to stderr as they arrive.
        #[arg(long)]
        progress: bool,
    },

    /// Validate a job config without running it.
    Validate {
        /// Path to a job config TOML file.
        config: PathBuf,
    },
}

pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "webcrawl=info",
        1 => "webcrawl=debug",
        _ => "webcrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { config, progress } => cmd_run(&config, progress).await,
        Command::Validate { config } => cmd_validate(&config).await,
    }
}

async fn cmd_run(config_path: &PathBuf, progress: bool) -> Result<()> {
    let job = load_job_config(config_path)
        .map_err(|e| eyre!("failed to load job config at {}: {e}", config_path.display()))?;

    let report = validate_job(&job);
    if !report.valid {
        return Err(eyre!("job config is invalid: {}", report.errors.join("; ")));
    }
    for warning in &report.warnings {
        tracing::warn!(%warning, "scope overlap detected");
    }

    let mut coordinator = MultiKBCoordinator::new(job)
        .map_err(|e| eyre!("failed to start job: {e}"))?;

    if progress {
        let mut events = coordinator.take_events().expect("events taken once");
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });
    }

    info!("running crawl job");
    let result = coordinator.run().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    let job = load_job_config(config_path)
        .map_err(|e| eyre!("failed to load job config at {}: {e}", config_path.display()))?;
    let report = validate_job(&job);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::JobStarted { job_id } => eprintln!("job started: {job_id}"),
        CoordinatorEvent::MultiKbProgress { snapshot } => eprintln!(
            "[{}] depth {}/{} queue={} discovered={} processed={}",
            snapshot.kb_name,
            snapshot.current_depth,
            snapshot.max_depth,
            snapshot.queue_size,
            snapshot.urls_discovered,
            snapshot.urls_processed
        ),
        CoordinatorEvent::PageComplete { kb_id, page } => {
            eprintln!("[{kb_id}] {:?} {}", page.status, page.url)
        }
        CoordinatorEvent::KbCompleted { kb_id } => eprintln!("KB completed: {kb_id}"),
        CoordinatorEvent::KbFailed { kb_id, reason } => {
            eprintln!("KB failed: {kb_id} ({reason})")
        }
        CoordinatorEvent::JobCompleted { .. } => eprintln!("job completed"),
        CoordinatorEvent::JobFailed { reason } => eprintln!("job failed: {reason}"),
    }
}
