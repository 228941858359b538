use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use queuectl::config::{StoreConfig, WorkerConfig};
use queuectl::dlq::DeadLetterQueue;
use queuectl::error::QueueError;
use queuectl::scheduler::{Job, JobQueue, JobState, StateCounts, WorkerRecord, WorkerRegistry};
use queuectl::shutdown::install_shutdown_handler;
use queuectl::store::{ConfigEntry, ConfigStore, Store};
use queuectl::supervisor::Supervisor;
use queuectl::worker::WorkerReport;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A persistent shell-command job queue with retries and a dead letter queue")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the shared job database
    #[arg(long, global = true, default_value = "data/queue.db")]
    db: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Add a shell command to the queue
    Enqueue {
        /// The command to execute (e.g., "echo hello")
        command: String,
    },

    /// Run workers, or tell running workers to stop
    Worker(WorkerArgs),

    /// Inspect and retry dead jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Read or change the retry policy
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// List jobs in creation order
    List {
        /// Only show jobs in this state (pending, processing, completed, dead)
        #[arg(long, short = 's')]
        state: Option<String>,
    },

    /// Show job counts and registered workers
    Status,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Number of workers to start
    #[arg(long, short = 'c', default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    count: u64,

    /// Jobs each worker executes before exiting (0 = no limit)
    #[arg(long, short = 'l', default_value_t = 0)]
    limit: u64,

    /// Seconds to sleep when no job is eligible
    #[arg(long, short = 's', default_value_t = 3)]
    sleep: u64,

    /// Log every poll and command result
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Signal all running workers to stop after their current job
    #[arg(long, conflicts_with_all = ["count", "limit", "sleep", "reset_stop", "lease_timeout"])]
    stop: bool,

    /// Clear a stop signal left over from an earlier --stop before starting
    #[arg(long)]
    reset_stop: bool,

    /// Seconds without a heartbeat before a worker's job is reclaimed (0 = never, raised to 3 heartbeats)
    #[arg(long, default_value_t = 30)]
    lease_timeout: u64,
}

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs, most recently failed first
    List,
    /// Move a dead job back to pending with a fresh retry budget
    Retry {
        /// The job ID (UUID)
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Set max-retries or backoff-base
    Set { key: String, value: String },
    /// Show the current retry policy
    Get,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct StopOutput {
    stop: bool,
}

#[derive(Serialize)]
struct ConfigOutput {
    entries: Vec<ConfigEntry>,
    retry_delays_secs: Vec<u64>,
}

#[derive(Serialize)]
struct StatusOutput {
    jobs: StateCounts,
    total: u64,
    workers: Vec<WorkerStatusOutput>,
}

#[derive(Serialize)]
struct WorkerStatusOutput {
    #[serde(flatten)]
    worker: WorkerRecord,
    alive: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn print_job_table(jobs: &[Job]) {
    println!(
        "{:<38} {:<11} {:<9} {:<20} COMMAND",
        "JOB ID", "STATE", "ATTEMPTS", "UPDATED"
    );
    println!("{}", "-".repeat(100));
    for job in jobs {
        println!(
            "{:<38} {:<11} {:<9} {:<20} {}",
            job.id,
            job.state,
            format!("{}/{}", job.attempts, job.max_retries),
            format_time(job.updated_at),
            truncate(&job.command, 40)
        );
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_enqueue(
    store: &Store,
    command: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = JobQueue::new(store.clone()).enqueue(command).await?;
    match output_format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job enqueued successfully!");
            println!("Job ID: {}", job.id);
        }
    }
    Ok(())
}

async fn handle_worker(
    store: Store,
    args: WorkerArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if args.stop {
        Supervisor::stop(&store).await?;
        match output_format {
            OutputFormat::Json => print_json(&StopOutput { stop: true })?,
            OutputFormat::Table => {
                println!("Stop signal sent. Workers will exit after their current job.");
            }
        }
        return Ok(());
    }

    let config = WorkerConfig::new(usize::try_from(args.count)?)
        .with_job_limit(args.limit)
        .with_idle_sleep_ms(args.sleep.saturating_mul(1000))
        .with_lease_timeout_ms(args.lease_timeout.saturating_mul(1000))
        .with_reset_stop(args.reset_stop);

    tracing::info!(
        count = config.count,
        limit = ?config.job_limit(),
        idle_sleep_secs = args.sleep,
        lease_timeout = ?config.lease_timeout(),
        "Starting queuectl workers"
    );

    let shutdown = install_shutdown_handler();
    let reports = Supervisor::new(store, config, shutdown).run().await?;

    match output_format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Table => print_worker_reports(&reports),
    }
    Ok(())
}

fn print_worker_reports(reports: &[WorkerReport]) {
    println!(
        "{:<38} {:<10} {:<10} {:<8} {:<5} EXIT",
        "WORKER ID", "PROCESSED", "COMPLETED", "RETRIED", "DEAD"
    );
    println!("{}", "-".repeat(90));
    for report in reports {
        println!(
            "{:<38} {:<10} {:<10} {:<8} {:<5} {:?}",
            report.worker_id,
            report.processed,
            report.completed,
            report.retried,
            report.dead,
            report.reason
        );
    }
}

async fn handle_dlq_list(
    store: &Store,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let dlq = DeadLetterQueue::new(store.clone());
    let mut dead = dlq.list_dead();
    let mut jobs = Vec::new();
    while let Some(job) = dead.next().await {
        jobs.push(job?);
    }

    match output_format {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("Dead letter queue is empty.");
            } else {
                print_job_table(&jobs);
                println!();
                println!("{} dead job(s)", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_dlq_retry(
    store: &Store,
    job_id: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = DeadLetterQueue::new(store.clone()).requeue(job_id).await?;
    match output_format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job {} moved back to pending", job.id);
            println!("Max retries: {}", job.max_retries);
        }
    }
    Ok(())
}

async fn handle_config_set(
    store: &Store,
    key: &str,
    value: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let entry = ConfigStore::new(store.clone()).set(key, value).await?;
    match output_format {
        OutputFormat::Json => print_json(&entry)?,
        OutputFormat::Table => println!("{} = {}", entry.key, entry.value),
    }
    Ok(())
}

async fn handle_config_get(
    store: &Store,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = ConfigStore::new(store.clone());
    let entries = settings.entries().await?;
    let delays: Vec<u64> = settings
        .retry_policy()
        .await?
        .schedule()
        .iter()
        .map(|d| d.as_secs())
        .collect();

    match output_format {
        OutputFormat::Json => print_json(&ConfigOutput {
            entries,
            retry_delays_secs: delays,
        })?,
        OutputFormat::Table => {
            for entry in &entries {
                let marker = if entry.is_default { " (default)" } else { "" };
                println!("{:<14} {}{}", entry.key, entry.value, marker);
            }
            println!();
            if delays.is_empty() {
                println!("Retry delays: none, failed jobs go straight to the dead letter queue");
            } else {
                let delays: Vec<String> = delays.iter().map(|d| format!("{}s", d)).collect();
                println!("Retry delays: {}", delays.join(", "));
            }
        }
    }
    Ok(())
}

async fn handle_list(
    store: &Store,
    state: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = state.map(|s| s.parse::<JobState>()).transpose()?;
    let jobs = JobQueue::new(store.clone()).list(state).await?;

    match output_format {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                print_job_table(&jobs);
                println!();
                println!("{} job(s)", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_status(
    store: &Store,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let counts = JobQueue::new(store.clone()).counts().await?;
    let workers = WorkerRegistry::new(store.clone()).all_workers().await?;
    let lease = WorkerConfig::default()
        .lease_timeout()
        .unwrap_or(std::time::Duration::MAX);
    let now = Utc::now();

    let workers: Vec<WorkerStatusOutput> = workers
        .into_iter()
        .map(|worker| WorkerStatusOutput {
            alive: worker.is_alive(lease, now),
            worker,
        })
        .collect();

    match output_format {
        OutputFormat::Json => print_json(&StatusOutput {
            total: counts.total(),
            jobs: counts,
            workers,
        })?,
        OutputFormat::Table => {
            println!("Jobs");
            println!("{}", "=".repeat(40));
            for state in JobState::ALL {
                println!("{:<12} {}", state, counts.get(state));
            }
            println!("{:<12} {}", "total", counts.total());
            println!();
            println!("Workers");
            println!("{}", "=".repeat(40));
            if workers.is_empty() {
                println!("No workers running.");
            } else {
                println!("{:<38} {:<20} STATUS", "WORKER ID", "LAST HEARTBEAT");
                println!("{}", "-".repeat(70));
                for w in &workers {
                    let status = if w.alive { "[+] alive" } else { "[-] stale" };
                    println!(
                        "{:<38} {:<20} {}",
                        w.worker.worker_id,
                        format_time(w.worker.last_heartbeat),
                        status
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut store_config = StoreConfig::new(&args.db);
    if let Commands::Worker(worker) = &args.command {
        let wanted = u32::try_from(worker.count).unwrap_or(u32::MAX).saturating_add(2);
        store_config = store_config.with_min_connections(wanted);
    }
    let store = Store::connect(&store_config).await?;

    match args.command {
        Commands::Enqueue { command } => handle_enqueue(&store, command, &args.output).await?,
        Commands::Worker(worker) => handle_worker(store.clone(), worker, &args.output).await?,
        Commands::Dlq { command } => match command {
            DlqCommands::List => handle_dlq_list(&store, &args.output).await?,
            DlqCommands::Retry { job_id } => handle_dlq_retry(&store, &job_id, &args.output).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Set { key, value } => {
                handle_config_set(&store, &key, &value, &args.output).await?
            }
            ConfigCommands::Get => handle_config_get(&store, &args.output).await?,
        },
        Commands::List { state } => handle_list(&store, state, &args.output).await?,
        Commands::Status => handle_status(&store, &args.output).await?,
    }

    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let verbose = matches!(&args.command, Commands::Worker(worker) if worker.verbose);
    init_tracing(verbose);

    if let Err(e) = run(args).await {
        if !e.downcast_ref::<QueueError>().is_some_and(QueueError::is_rejection) {
            tracing::error!(error = %e, "Command failed");
        }
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
