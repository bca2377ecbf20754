use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tickwork_core::{TickworkConfig, TracingReporter};
use tickwork_defer::Deferrable;
use tickwork_scheduler::{CoordinationStore, Manager, SqliteStore};
use tracing::{info, warn};

mod jobs;

#[derive(Parser)]
#[command(name = "tickwork-worker", about = "Fleet-coordinated recurring job runner")]
struct Cli {
    /// Config file (defaults to ~/.tickwork/tickwork.toml).
    #[arg(long, global = true, env = "TICKWORK_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile stored schedules, then poll until Ctrl-C.
    Run,
    /// Run one blocking pass over every job and exit.
    Tick,
    /// Show every job with its stored schedule.
    List,
    /// Drop a job's stored schedule and derive a fresh one.
    Reset {
        /// Job name (or a raw storage key for unregistered jobs).
        job: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tickwork_worker=info,tickwork_scheduler=info,tickwork_defer=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = TickworkConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        TickworkConfig::default()
    });

    let db_path = &config.store.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening coordination store");
    let store: Arc<dyn CoordinationStore> = Arc::new(
        SqliteStore::open(db_path)
            .with_context(|| format!("failed to open coordination store at {db_path}"))?,
    );

    let registry = jobs::registry(&store)?;
    let reporter = Arc::new(TracingReporter);
    let manager = Manager::new(
        Arc::clone(&store),
        registry,
        config.scheduler.clone(),
        reporter.clone(),
    );

    match cli.command {
        Command::Run => {
            let defer = Deferrable::new(config.defer.clone(), reporter);
            run(manager, &defer).await
        }
        Command::Tick => {
            let summary = manager.blocking_tick().await;
            info!(
                checked = summary.checked,
                claimed = summary.claimed,
                store_errors = summary.store_errors,
                "tick complete"
            );
            Ok(())
        }
        Command::List => list(&manager),
        Command::Reset { job } => {
            let removed = manager.remove(&job)?;
            if manager.registry().get(&job).is_some() {
                let info = manager.ensure_schedule(&job)?;
                println!("{job}: next run {}", fmt_time(info.next_run));
            } else if removed {
                println!("{job}: removed (not a registered job)");
            } else {
                println!("{job}: nothing stored");
            }
            Ok(())
        }
    }
}

async fn run(manager: Manager, defer: &Deferrable) -> anyhow::Result<()> {
    // Startup cleanup stays off the polling loop.
    let reconciler = manager.clone();
    defer.later_labeled("reconcile", move || {
        let summary = reconciler.reconcile()?;
        info!(
            removed = summary.removed.len(),
            ensured = summary.ensured,
            "stored schedules reconciled"
        );
        Ok(())
    });

    let runner = manager.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    manager.stop();
    defer.stop();
    handle.await.context("scheduler loop panicked")?;
    Ok(())
}

fn list(manager: &Manager) -> anyhow::Result<()> {
    for job in manager.schedules()? {
        let (prev_run, prev_result, next_run) = match &job.info {
            Some(info) => (
                fmt_time(info.prev_run),
                info.prev_result
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                fmt_time(info.next_run),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        println!(
            "{:<28} {:<24} prev={} result={} next={}",
            job.key,
            job.cadence.to_string(),
            prev_run,
            prev_result,
            next_run
        );
    }
    Ok(())
}

fn fmt_time(t: Option<impl std::fmt::Display>) -> String {
    t.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), "failed to create store directory: {e}");
        }
    }
}
