use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use svcdir_core::CycleRun;
use svcdir_storage::{
    FileStatsStore, MemoryRecordStore, MemoryStatsStore, PgRecordStore, RecordStore, StatsStore,
};
use svcdir_sync::{build_driver, load_jobs_and_registry, CycleDriver, DiscoveryConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PID_FILE: &str = "svcdir.pid";

#[derive(Debug, Parser)]
#[command(name = "svcdir")]
#[command(about = "Local service directory discovery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run discovery cycles on the configured interval until signalled.
    Start,
    /// Signal a running `start` process to stop.
    Stop,
    /// Run a single discovery cycle and exit.
    Once {
        /// Use an in-memory record store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the last persisted stats.
    Stats,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = DiscoveryConfig::from_env();

    match cli.command.unwrap_or(Commands::Once { dry_run: false }) {
        Commands::Start => start(config).await?,
        Commands::Stop => stop(&config).await?,
        Commands::Once { dry_run } => {
            let run = once(config, dry_run).await?;
            print_run(&run);
        }
        Commands::Stats => {
            let stats = FileStatsStore::new(&config.data_dir);
            match stats.read_stats().await? {
                Some(blob) => println!("{}", serde_json::to_string_pretty(&blob)?),
                None => println!("no stats available"),
            }
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied to {}", redact(&config.database_url));
        }
    }

    Ok(())
}

async fn connect(config: &DiscoveryConfig) -> Result<PgRecordStore> {
    let store = PgRecordStore::connect(&config.database_url, config.db_max_connections).await?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn driver_for(
    config: &DiscoveryConfig,
    store: Arc<dyn RecordStore>,
    stats: Arc<dyn StatsStore>,
) -> Result<CycleDriver> {
    let (jobs_file, registry) = load_jobs_and_registry(config).await?;
    info!(
        region = %jobs_file.region.name,
        jobs = jobs_file.jobs.len(),
        extractors = ?registry.names(),
        "loaded discovery jobs"
    );
    Ok(build_driver(config, jobs_file, registry, store, stats))
}

async fn start(config: DiscoveryConfig) -> Result<()> {
    let store = Arc::new(connect(&config).await?);
    let stats = Arc::new(FileStatsStore::new(&config.data_dir));
    let driver = driver_for(&config, store, stats).await?;

    let pid_path = pid_path(&config);
    write_pid(&pid_path).await?;

    if let Err(err) = driver.start().await {
        remove_pid(&pid_path).await;
        return Err(err).context("starting discovery driver");
    }

    shutdown_signal().await;
    info!("shutdown requested; waiting for the current batch to finish");
    let stopped = driver.shutdown().await;
    remove_pid(&pid_path).await;
    stopped.context("stopping discovery driver")?;
    Ok(())
}

async fn once(config: DiscoveryConfig, dry_run: bool) -> Result<CycleRun> {
    let (store, stats): (Arc<dyn RecordStore>, Arc<dyn StatsStore>) = if dry_run {
        info!("dry run: records and stats stay in memory");
        (
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryStatsStore::new()),
        )
    } else {
        (
            Arc::new(connect(&config).await?),
            Arc::new(FileStatsStore::new(&config.data_dir)),
        )
    };
    let driver = driver_for(&config, store, stats).await?;

    let cycle = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.run_once().await })
    };
    tokio::pin!(cycle);

    let run = tokio::select! {
        joined = &mut cycle => joined,
        _ = shutdown_signal() => {
            info!("shutdown requested; finishing the current batch");
            driver.shutdown().await?;
            cycle.await
        }
    };
    Ok(run.context("discovery cycle task failed")??)
}

async fn stop(config: &DiscoveryConfig) -> Result<()> {
    let pid_path = pid_path(config);
    let pid = match tokio::fs::read_to_string(&pid_path).await {
        Ok(text) => text.trim().to_string(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("no discovery service is running");
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", pid_path.display()));
        }
    };

    let status = tokio::process::Command::new("kill")
        .args(["-TERM", &pid])
        .status()
        .await
        .context("sending SIGTERM")?;
    if status.success() {
        println!("stop signal sent to discovery service (pid {pid})");
    } else {
        warn!(pid = %pid, "process not found; removing stale pid file");
        remove_pid(&pid_path).await;
        println!("no discovery service is running");
    }
    Ok(())
}

fn print_run(run: &CycleRun) {
    println!(
        "cycle complete: id={} success={} failed={} new={} inserted={} updated={} skipped={} rejected={} batches={:?} duration={}s",
        run.cycle_id,
        run.success,
        run.failed,
        run.new_records,
        run.inserted,
        run.updated,
        run.skipped,
        run.rejected,
        run.batches,
        run.duration_secs
    );
    if run.interrupted {
        println!("cycle interrupted before all batches ran");
    }
    for error in &run.errors {
        println!("  error: {error}");
    }
}

fn pid_path(config: &DiscoveryConfig) -> PathBuf {
    config.data_dir.join(PID_FILE)
}

async fn write_pid(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, std::process::id().to_string())
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn remove_pid(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "could not remove pid file");
        }
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable; listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
