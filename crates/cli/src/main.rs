//! Command-line driver for bottlesync.

use anyhow::{Context, Result};
use bottlesync_core::config::AppConfig;
use bottlesync_core::format::{format_date, format_duration, format_size, format_timestamp, parse_date};
use bottlesync_core::{HashLedger, ItemStatus, RunState};
use bottlesync_engine::{LedgerDelta, RunOptions, RunReport, SyncEngine, metrics};
use bottlesync_storage::{ObjectStore, StorageError};
use clap::{Parser, Subcommand, ValueEnum};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use time::{Date, OffsetDateTime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "bottlesync.toml";

/// Mirror Homebrew bottles into object storage.
#[derive(Parser, Debug)]
#[command(name = "bottlesync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "BOTTLESYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch the catalog and mirror every bottle not yet in the ledger
    Sync {
        /// Plan and route only; download and write nothing
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Date for artifact keys and ledger entries (YYYY-MM-DD, default today UTC)
        #[arg(long, value_parser = parse_run_date)]
        date: Option<Date>,

        /// Print the result as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show what the next sync would download
    Plan {
        /// Print the plan as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Ledger maintenance
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommands {
    /// Validate the stored ledger without modifying it
    Check {
        /// Print the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Re-derive ledger entries from mirrored artifacts and commit them
    Rebuild,
}

fn parse_run_date(raw: &str) -> Result<Date, String> {
    parse_date(raw).map_err(|e| e.to_string())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Load configuration from the optional TOML file, then `BOTTLESYNC_*` env vars.
fn load_config(path: &Path, explicit: bool) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "loading configuration file");
        figment = figment.merge(Toml::file(path));
    } else if explicit {
        anyhow::bail!("configuration file not found: {}", path.display());
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("BOTTLESYNC_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let explicit = cli.config != Path::new(DEFAULT_CONFIG_PATH);
    let config = load_config(&cli.config, explicit)?;

    match cli.command {
        Commands::Sync {
            dry_run,
            date,
            json,
        } => sync(config, RunOptions { run_date: date, dry_run }, json).await,
        Commands::Plan { json } => plan(config, json).await,
        Commands::Ledger { command } => match command {
            LedgerCommands::Check { json } => ledger_check(config, json).await,
            LedgerCommands::Rebuild => ledger_rebuild(config).await,
        },
    }
}

async fn sync(config: AppConfig, options: RunOptions, json: bool) -> Result<ExitCode> {
    let textfile = config.metrics.textfile_path.clone();
    let engine = SyncEngine::from_config(config)
        .await
        .context("failed to initialize sync engine")?;
    engine
        .store()
        .health_check()
        .await
        .context("storage health check failed")?;

    let report = engine.run(options).await;

    if let Some(path) = textfile
        && let Err(e) = write_metrics_textfile(&path).await
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to write metrics textfile");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        print_report(&report);
    }

    Ok(match report.state() {
        RunState::Failed => ExitCode::FAILURE,
        RunState::Success | RunState::PartialSuccess => ExitCode::SUCCESS,
    })
}

async fn plan(config: AppConfig, json: bool) -> Result<ExitCode> {
    let engine = SyncEngine::from_config(config)
        .await
        .context("failed to initialize sync engine")?;
    let report = engine
        .run(RunOptions {
            run_date: None,
            dry_run: true,
        })
        .await;

    let Some(plan) = &report.plan else {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        return Ok(ExitCode::FAILURE);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
    } else {
        println!("Candidates:       {}", plan.candidates);
        println!("Already mirrored: {}", plan.already_present);
        println!(
            "Estimated size:   {}{}",
            format_size(plan.total_estimated_bytes),
            if plan.estimate_degraded { " (incomplete)" } else { "" }
        );
        println!("Worker:           {}", plan.worker.as_str());
        for key in &plan.keys {
            println!("  {key}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn ledger_check(config: AppConfig, json: bool) -> Result<ExitCode> {
    let store = bottlesync_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    let now = OffsetDateTime::now_utc();

    let data = match store.get(&config.ledger.key).await {
        Ok(data) => data,
        Err(StorageError::NotFound(_)) => {
            if json {
                println!("{}", json!({"key": config.ledger.key, "present": false}));
            } else {
                println!("No ledger at {}", config.ledger.key);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e).context("failed to read ledger"),
    };

    let parsed = match HashLedger::parse(&data, now.date(), now) {
        Ok(parsed) => parsed,
        Err(e) => {
            if json {
                println!(
                    "{}",
                    json!({"key": config.ledger.key, "present": true, "valid": false, "error": e.to_string()})
                );
            } else {
                println!("Ledger {} is corrupt: {e}", config.ledger.key);
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    let ledger = &parsed.ledger;
    let healthy = parsed.dropped.is_empty();
    if json {
        let dropped: Vec<_> = parsed
            .dropped
            .iter()
            .map(|d| json!({"key": d.key, "reason": d.reason}))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "key": config.ledger.key,
                "present": true,
                "valid": healthy,
                "entries": ledger.len(),
                "last_updated": format_timestamp(ledger.last_updated()),
                "migrated": parsed.migrated,
                "dropped": dropped,
                "statistics": ledger.statistics(),
            }))?
        );
    } else {
        println!("Ledger:       {}", config.ledger.key);
        println!("Entries:      {}", ledger.len());
        println!("Last updated: {}", format_timestamp(ledger.last_updated()));
        println!("Migrated:     {}", parsed.migrated);
        println!("Dropped:      {}", parsed.dropped.len());
        for dropped in &parsed.dropped {
            println!("  {}: {}", dropped.key, dropped.reason);
        }
        if let Some(stats) = ledger.statistics() {
            println!("Total size:   {}", format_size(stats.total_size));
            for (platform, platform_stats) in &stats.platforms {
                println!(
                    "  {platform}: {} bottles, mean {}",
                    platform_stats.count,
                    format_size(platform_stats.mean_size)
                );
            }
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn ledger_rebuild(config: AppConfig) -> Result<ExitCode> {
    let store = bottlesync_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    let hash_store = bottlesync_engine::HashStore::new(store, config.ledger.clone());
    let now = OffsetDateTime::now_utc();

    let mut handle = hash_store.load(now.date(), now).await.handle;
    let before = handle.ledger().len();
    let rebuilt = hash_store
        .rebuild_from_artifacts(now.date(), now)
        .await
        .context("failed to scan artifacts")?;
    let found = rebuilt.len();

    let mut delta = LedgerDelta::new();
    delta.extend(rebuilt.entries().cloned());
    let report = hash_store
        .commit(&mut handle, &delta, now)
        .await
        .context("failed to commit rebuilt ledger")?;

    println!("Artifacts with integrity metadata: {found}");
    println!("Ledger entries: {before} -> {}", report.entries);
    Ok(ExitCode::SUCCESS)
}

async fn write_metrics_textfile(path: &Path) -> Result<()> {
    let text = metrics::render_text()?;
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, text)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move metrics into {}", path.display()))?;
    Ok(())
}

fn print_report(report: &RunReport) {
    let result = &report.result;
    if report.dry_run {
        println!("Dry run: nothing was downloaded or written");
    }
    println!("State:    {}", result.state);
    if let Some(plan) = &report.plan {
        println!(
            "Plan:     {} candidates, {} estimated, {} worker",
            plan.candidates,
            format_size(plan.total_estimated_bytes),
            plan.worker.as_str()
        );
    }
    println!(
        "Items:    {} uploaded, {} skipped, {} failed",
        result.counts.uploaded, result.counts.skipped, result.counts.failed
    );
    println!("Bytes:    {}", format_size(result.total_bytes));
    println!("Duration: {}", format_duration(result.duration));
    println!("Ledger:   {} entries", report.ledger_entries);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    for error in &report.errors {
        println!("error: {error}");
    }
}

fn report_json(report: &RunReport) -> serde_json::Value {
    let outcomes: Vec<_> = report
        .outcomes
        .iter()
        .map(|outcome| {
            let (status, detail) = match &outcome.status {
                ItemStatus::Uploaded { storage_key, .. } => ("uploaded", Some(storage_key.clone())),
                ItemStatus::SkippedAlreadyPresent => ("skipped", None),
                ItemStatus::Failed(reason) => (reason.label(), Some(reason.to_string())),
            };
            json!({
                "key": outcome.key.ledger_key(),
                "status": status,
                "detail": detail,
                "bytes": outcome.bytes_transferred,
                "attempts": outcome.attempts,
                "elapsed_ms": outcome.elapsed.as_millis() as u64,
            })
        })
        .collect();

    json!({
        "state": report.result.state,
        "dry_run": report.dry_run,
        "counts": report.result.counts,
        "total_bytes": report.result.total_bytes,
        "duration_ms": report.result.duration.as_millis() as u64,
        "phases": report.phases,
        "plan": report.plan,
        "ledger_entries": report.ledger_entries,
        "commit_attempts": report.commit_attempts,
        "warnings": report.warnings,
        "errors": report.errors,
        "outcomes": outcomes,
    })
}
