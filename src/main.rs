//! Pulse main entry point
//!
//! This is the command-line interface for the Pulse content crawler.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pulse_crawler::config::{load_config_with_hash, Config, Frequency};
use pulse_crawler::crawler::{Orchestrator, RunReport, ScheduleSpec, Scheduler};
use pulse_crawler::output::{load_statistics, print_statistics};
use pulse_crawler::state::{read_seeds, AddOutcome, CooldownPolicy, UrlTracker};
use pulse_crawler::storage::open_storage;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Pulse: an adaptive content-acquisition crawler
///
/// Pulse re-crawls a known set of URLs on a schedule, escalating from plain
/// requests to proxied and browser-rendered fetches when servers push back,
/// and forwards content downstream only when it changed.
#[derive(Parser, Debug)]
#[command(name = "pulse-crawler")]
#[command(version)]
#[command(about = "An adaptive content-acquisition crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults are used if it does not exist)
    #[arg(short, long, global = true, default_value = "pulse.toml")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bulk-load seed URLs from a JSON file
    Load {
        #[arg(value_name = "SEEDS")]
        seeds: PathBuf,
    },

    /// Start tracking a single URL
    Add {
        url: String,

        /// Correlation metadata, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Stop tracking a URL
    Remove { url: String },

    /// Show the stored record for a URL
    Show { url: String },

    /// Crawl every due URL once
    Run {
        /// List due URLs without fetching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Run on a schedule until interrupted
    Schedule {
        /// Overrides `schedule.frequency`
        #[arg(long)]
        frequency: Option<Frequency>,

        /// Overrides `schedule.time` (HH:MM, local time)
        #[arg(long)]
        time: Option<String>,

        /// Fire scheduled runs even when `schedule.enabled` is false
        #[arg(long)]
        enable: bool,
    },

    /// Show aggregate statistics from the database
    Stats {
        /// Number of domains to list
        #[arg(long, default_value_t = 20)]
        domains: usize,
    },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let (config, config_hash) = load_settings(&cli.config)?;

    match cli.command {
        Command::Load { seeds } => handle_load(&config, &seeds),
        Command::Add { url, meta } => handle_add(&config, &url, meta),
        Command::Remove { url } => handle_remove(&config, &url),
        Command::Show { url } => handle_show(&config, &url),
        Command::Run { dry_run: true } => handle_dry_run(&config, config_hash),
        Command::Run { dry_run: false } => handle_run(&config, config_hash).await,
        Command::Schedule {
            frequency,
            time,
            enable,
        } => handle_schedule(config, config_hash, frequency, time, enable).await,
        Command::Stats { domains } => handle_stats(&config, domains),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let default_filter = if quiet {
        "error"
    } else {
        match verbose {
            0 => "pulse_crawler=info,warn",
            1 => "pulse_crawler=debug,info",
            2 => "pulse_crawler=trace,debug",
            _ => "trace",
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Loads the configuration file, or defaults when it does not exist
fn load_settings(path: &Path) -> anyhow::Result<(Config, String)> {
    if !path.exists() {
        tracing::info!("No configuration at {}, using defaults", path.display());
        return Ok((Config::default(), "defaults".to_string()));
    }

    let (config, hash) = load_config_with_hash(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    tracing::debug!("Configuration loaded (hash: {})", hash);
    Ok((config, hash))
}

fn open_tracker(config: &Config) -> anyhow::Result<UrlTracker> {
    let storage = open_storage(Path::new(&config.tracker.database_path)).with_context(|| {
        format!("failed to open database {}", config.tracker.database_path)
    })?;
    Ok(UrlTracker::new(
        storage,
        CooldownPolicy::from_config(&config.tracker),
    ))
}

fn handle_load(config: &Config, seeds: &Path) -> anyhow::Result<()> {
    let tracker = open_tracker(config)?;
    let entries = read_seeds(seeds)?;
    let report = tracker.load_seeds(entries, Utc::now())?;

    println!("Added: {}", report.added);
    println!("Already tracked: {}", report.already_present);
    if !report.invalid.is_empty() {
        println!("Invalid: {}", report.invalid.len());
        for (url, reason) in &report.invalid {
            println!("  {} ({})", url, reason);
        }
    }
    Ok(())
}

fn handle_add(config: &Config, url: &str, meta: Vec<(String, String)>) -> anyhow::Result<()> {
    let tracker = open_tracker(config)?;
    let metadata: Map<String, Value> = meta
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    match tracker.add_url(url, metadata, Utc::now())? {
        AddOutcome::Added(record) => println!("Tracking {}", record.url),
        AddOutcome::AlreadyPresent(record) => {
            println!("Already tracked: {} ({})", record.url, record.status)
        }
    }
    Ok(())
}

fn handle_remove(config: &Config, url: &str) -> anyhow::Result<()> {
    let tracker = open_tracker(config)?;
    if !tracker.remove_url(url)? {
        bail!("{} is not tracked", url);
    }
    println!("Removed {}", url);
    Ok(())
}

fn handle_show(config: &Config, url: &str) -> anyhow::Result<()> {
    let tracker = open_tracker(config)?;
    match tracker.get(url)? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("{} is not tracked", url),
    }
}

fn handle_dry_run(config: &Config, config_hash: String) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config, config_hash)?;
    let due = orchestrator.due_urls()?;

    println!("=== Pulse Dry Run ===\n");
    println!("{} URLs due", due.len());
    for record in &due {
        let strategy = record
            .last_strategy
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "  {} [{}] last strategy: {}",
            record.url, record.status, strategy
        );
    }
    Ok(())
}

async fn handle_run(config: &Config, config_hash: String) -> anyhow::Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(config, config_hash)?);

    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight URLs");
            stopper.request_stop();
        }
    });

    let report = orchestrator.run_once().await?;
    print_report(&report);
    Ok(())
}

async fn handle_schedule(
    config: Config,
    config_hash: String,
    frequency: Option<Frequency>,
    time: Option<String>,
    enable: bool,
) -> anyhow::Result<()> {
    let mut schedule = config.schedule.clone();
    schedule.enabled |= enable;
    if let Some(frequency) = frequency {
        schedule.frequency = frequency;
    }
    if let Some(time) = time {
        schedule.time = time;
    }
    let spec = ScheduleSpec::from_config(&schedule)?;

    let orchestrator = Arc::new(Orchestrator::from_config(&config, config_hash)?);
    let scheduler = Arc::new(Scheduler::from_config(orchestrator, &schedule));
    if !scheduler.is_enabled() {
        tracing::warn!(
            "schedule.enabled is false; scheduled triggers will be ignored (use --enable)"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping scheduler");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(
        "Scheduling {} runs at {}",
        spec.frequency.as_str(),
        spec.time.format("%H:%M")
    );
    scheduler.run_scheduled(spec, shutdown_rx).await;
    Ok(())
}

fn handle_stats(config: &Config, domains: usize) -> anyhow::Result<()> {
    let tracker = open_tracker(config)?;
    let storage = tracker.storage();
    let guard = storage
        .lock()
        .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
    let stats = load_statistics(&*guard, Utc::now())?;

    println!("Database: {}\n", config.tracker.database_path);
    print_statistics(&stats, domains);
    Ok(())
}

fn print_report(report: &RunReport) {
    let Some(run_id) = report.run_id else {
        println!("No URLs due");
        return;
    };

    let counts = &report.counts;
    let state = if report.interrupted {
        "interrupted"
    } else {
        "completed"
    };
    println!("=== Run {} {} ===", run_id, state);
    println!("Due:          {}", counts.total);
    println!(
        "Successful:   {} ({} changed, {} unchanged)",
        counts.successful, counts.changed, counts.unchanged
    );
    println!("Failed:       {}", counts.failed);
    println!("Blocked:      {}", counts.blocked);
    println!("Rate limited: {}", counts.rate_limited);
    println!("Skipped:      {}", counts.skipped);

    if !report.errors.is_empty() {
        println!("\nErrors:");
        for (url, error) in &report.errors {
            println!("  {}: {}", url, error);
        }
    }
}
