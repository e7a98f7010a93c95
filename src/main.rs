//! warden - background maintenance task scheduler.
//!
//! Usage:
//!   warden pass [SITE] [TASK|all] [--force]   Run one pass and exit
//!   warden daemon [SITE]                        Run passes until stopped
//!   warden list [SITE]                          Show stored task descriptors
//!   warden seed [SITE]                          Write configured tasks into the store
//!   warden validate                             Check the configuration file

use clap::{Parser, Subcommand};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use warden::builtins::register_builtins;
use warden::config::load_seeds_from_directory;
use warden::core::task::panic_message;
use warden::daemon::DaemonConfig;
use warden::{
    Daemon, DaemonError, Event, EventBus, EventHandler, HandlerRegistry, InMemoryStorage,
    PassRequest, Scheduler, ServiceConfig, SiteId, StorageConfig, TaskOutcome, TaskStore,
    YamlLoader, seed_tasks,
};

const DEFAULT_CONFIG: &str = "warden.yaml";
const EVENT_TARGET: &str = "warden::events";

/// warden - background maintenance tasks with database-backed mutual exclusion
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Service configuration file (default: ./warden.yaml when present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pass over the registry
    Pass {
        /// Site whose store is used
        #[arg(default_value = SiteId::DEFAULT)]
        site: String,

        /// Single task to run, or "all"
        #[arg(default_value = warden::ALL_TASKS)]
        task: String,

        /// Ignore the interval gate
        #[arg(short, long)]
        force: bool,

        /// Print the pass report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run passes continuously until stopped
    Daemon {
        /// Site whose store is used
        #[arg(default_value = SiteId::DEFAULT)]
        site: String,

        /// Single-instance marker path
        #[arg(long, value_name = "FILE")]
        pid_file: Option<PathBuf>,

        /// Seconds to wait between passes
        #[arg(long)]
        sleep: Option<u64>,

        /// Seconds after which the daemon exits (0 = never)
        #[arg(long)]
        max_time: Option<u64>,
    },

    /// List the task descriptors in the store
    List {
        /// Site whose store is used
        #[arg(default_value = SiteId::DEFAULT)]
        site: String,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create or update task descriptors from the configuration
    Seed {
        /// Site whose store is used
        #[arg(default_value = SiteId::DEFAULT)]
        site: String,

        /// Extra directory of YAML seed files
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Validate the configuration without touching the store
    Validate,
}

impl Commands {
    fn site(&self) -> SiteId {
        match self {
            Commands::Pass { site, .. }
            | Commands::Daemon { site, .. }
            | Commands::List { site, .. }
            | Commands::Seed { site, .. } => SiteId::new(site.as_str()),
            Commands::Validate => SiteId::default(),
        }
    }
}

/// Turns scheduler events into log records.
///
/// The library already logs its decisions; these records go to a separate
/// target so `RUST_LOG=warden::events=debug` shows the raw event stream.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::PassStarted {
                pass_id,
                site,
                task_filter,
                force,
                ..
            } => {
                let filter = task_filter.as_ref().map(|t| t.as_str());
                debug!(target: EVENT_TARGET, %pass_id, %site, task = ?filter, force, "pass started");
            }
            Event::PassCompleted {
                pass_id,
                executed,
                skipped,
                duration,
                ..
            } => {
                debug!(target: EVENT_TARGET, %pass_id, executed, skipped, ?duration, "pass completed");
            }
            Event::TaskClaimed { task, .. } => {
                debug!(target: EVENT_TARGET, %task, "task claimed");
            }
            Event::TaskSkipped { task, reason, .. } => {
                debug!(target: EVENT_TARGET, %task, %reason, "task skipped");
            }
            Event::TaskCompleted { task, duration, .. } => {
                debug!(target: EVENT_TARGET, %task, ?duration, "task completed");
            }
            Event::TaskFailed {
                task,
                error,
                duration,
                ..
            } => {
                debug!(target: EVENT_TARGET, %task, %error, ?duration, "task failed");
            }
            Event::HandlerUnresolved { task, error, .. } => {
                debug!(target: EVENT_TARGET, %task, %error, "handler could not be resolved");
            }
            Event::ClaimFailed { task, error, .. } => {
                debug!(target: EVENT_TARGET, %task, %error, "claim failed");
            }
            Event::ReleaseFailed { task, error, .. } => {
                debug!(target: EVENT_TARGET, %task, %error, "release failed, task stays marked running");
            }
            Event::TaskRecovered { task, .. } => {
                debug!(target: EVENT_TARGET, %task, "released claim abandoned mid-execution");
            }
            Event::DaemonStarted { pid, .. } => {
                debug!(target: EVENT_TARGET, pid, "daemon started");
            }
            Event::DaemonStopped { passes, reason, .. } => {
                debug!(target: EVENT_TARGET, passes, %reason, "daemon stopped");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let _log_guard = init_logging(level, config.log_file.as_deref())?;

    if let Commands::Validate = cli.command {
        return validate(cli.config.as_deref(), &config);
    }

    let site = cli.command.site();
    match config.database_for(&site).clone() {
        StorageConfig::Memory => {
            warn!("memory store selected: no persistence and no cross-process exclusion");
            let store = Arc::new(InMemoryStorage::new());
            dispatch(cli.command, &config, store, HandlerRegistry::new()).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            let store = Arc::new(warden::SqliteStorage::new(&path).await?);
            debug!(%site, path = %path, "store opened");
            let registry = HandlerRegistry::new().with_handler(Arc::new(
                warden::builtins::store_maintenance(store.pool().clone(), &config.builtins),
            ));
            let result = dispatch(cli.command, &config, Arc::clone(&store), registry).await;
            store.close().await;
            result
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("sqlite storage requires the `sqlite` feature".into())
        }
    }
}

/// Load the service configuration.
///
/// An explicit path must exist; without one, `./warden.yaml` is used when
/// present and built-in defaults otherwise.
fn load_config(path: Option<&Path>) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(YamlLoader::load_service_config(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Ok(YamlLoader::load_service_config(DEFAULT_CONFIG)?)
        }
        None => Ok(ServiceConfig::default()),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(
    level: &str,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path.file_name().ok_or("log_file has no file name")?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Run a store-backed command.
async fn dispatch<S: TaskStore + 'static>(
    command: Commands,
    config: &ServiceConfig,
    store: Arc<S>,
    mut registry: HandlerRegistry,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    register_builtins(&mut registry, &config.builtins, Arc::clone(&store));

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let scheduler = Arc::new(
        Scheduler::with_storage(store)
            .with_registry(registry)
            .with_event_bus(event_bus),
    );

    match command {
        Commands::Pass {
            site,
            task,
            force,
            json,
        } => {
            let request = PassRequest::scheduled(site.as_str())
                .with_selector(&task)
                .with_force(force);
            run_pass(&scheduler, request, json).await
        }
        Commands::Daemon {
            site,
            pid_file,
            sleep,
            max_time,
        } => {
            let idle = sleep.unwrap_or(config.sleep_interval_secs);
            let max_run_time = match max_time {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => config.max_run_time(),
            };
            let daemon_config = DaemonConfig::new(pid_file.unwrap_or_else(|| config.pid_file.clone()))
                .with_site(site.as_str())
                .with_idle_interval(Duration::from_secs(idle.max(1)))
                .with_max_run_time(max_run_time);
            run_daemon(scheduler, daemon_config).await
        }
        Commands::List { json, .. } => list_tasks(scheduler.storage().as_ref(), json).await,
        Commands::Seed { dir, .. } => {
            let mut seeds = config.tasks.clone();
            if let Some(dir) = dir {
                seeds.extend(load_seeds_from_directory(&dir)?);
            }
            for seed in &seeds {
                if !scheduler.registry().contains_handler(seed.handler()) {
                    warn!(task = %seed.name, handler = seed.handler(), "no handler registered under this reference");
                }
            }
            let written = seed_tasks(scheduler.storage().as_ref(), &seeds).await?;
            info!(written, "tasks seeded");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => Err("validate does not open a store".into()),
    }
}

/// Run a single pass, abandoning it on a termination signal.
///
/// The recovery hook fires on every way out, so a claim held by an
/// interrupted handler is released before the process exits.
async fn run_pass<S: TaskStore + 'static>(
    scheduler: &Scheduler<S>,
    request: PassRequest,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let hook = scheduler.recovery_hook();

    let pass = AssertUnwindSafe(scheduler.run_pass(&request)).catch_unwind();
    let result = tokio::select! {
        result = pass => Some(result),
        signal = shutdown_signal() => {
            warn!(signal, "interrupted, abandoning pass");
            None
        }
    };

    // The pass future is gone by now, so no handler is still running.
    if let Err(e) = hook.fire().await {
        error!(error = %e, "recovery hook failed");
    }

    let report = match result {
        None => return Ok(ExitCode::from(130)),
        Some(Err(payload)) => {
            error!(error = %panic_message(payload), "pass panicked");
            return Ok(ExitCode::FAILURE);
        }
        Some(Ok(result)) => result?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    if report.tasks.is_empty() {
        println!("No eligible tasks for site {}", report.site);
    }
    for entry in &report.tasks {
        let detail = match &entry.outcome {
            TaskOutcome::Completed => "completed".to_string(),
            TaskOutcome::Failed { error } => format!("failed: {}", error),
            TaskOutcome::Unresolved { error } => format!("unresolved: {}", error),
            TaskOutcome::Inactive => "skipped (inactive)".to_string(),
            TaskOutcome::AlreadyRunning => "skipped (already running)".to_string(),
            TaskOutcome::NotClaimed => "skipped (not due)".to_string(),
            TaskOutcome::ClaimError { error } => format!("skipped (claim error: {})", error),
        };
        println!("  {}: {}", entry.task, detail);
    }
    Ok(ExitCode::SUCCESS)
}

/// Run the daemon until a signal, the run-time cap, or a conflict ends it.
async fn run_daemon<S: TaskStore + 'static>(
    scheduler: Arc<Scheduler<S>>,
    config: DaemonConfig,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let daemon = Daemon::new(scheduler, config);
    let handle = daemon.handle();

    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(signal, "stop requested, finishing current pass");
        handle.stop();
    });

    match daemon.run().await {
        Ok(summary) => {
            info!(
                passes = summary.passes,
                failed_passes = summary.failed_passes,
                reason = %summary.reason,
                "daemon exited"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(DaemonError::AlreadyRunning { pid }) => {
            error!(pid, "another daemon is already running");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

/// Print the descriptors in the store.
async fn list_tasks<S: TaskStore + ?Sized>(
    store: &S,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let tasks = store.list_tasks().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(ExitCode::SUCCESS);
    }

    if tasks.is_empty() {
        println!("No tasks in store");
        return Ok(ExitCode::SUCCESS);
    }

    for task in &tasks {
        println!("{}", task.name);
        println!("  Handler: {}", task.handler);
        if let Some(require) = &task.require {
            println!("  Requires: {}", require);
        }
        println!("  Active: {}", task.active);
        if task.is_scheduled() {
            println!("  Interval: {} min", task.interval_minutes);
        } else {
            println!("  Interval: forced runs only");
        }
        println!("  Sort order: {}", task.sort_order);
        println!("  Running: {}", task.running);
        match task.next_run {
            Some(next) => println!("  Next run: {}", next.to_rfc3339()),
            None => println!("  Next run: due"),
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

/// Validate the configuration and report what it declares.
fn validate(
    path: Option<&Path>,
    config: &ServiceConfig,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    if path.is_none() && !Path::new(DEFAULT_CONFIG).exists() {
        warn!("no configuration file found, built-in defaults are in use");
    }

    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, &config.builtins, Arc::new(InMemoryStorage::new()));

    info!(
        config = %source,
        tasks = config.tasks.len(),
        sites = config.sites.len(),
        "configuration is valid"
    );
    for seed in &config.tasks {
        let known = registry.contains_handler(seed.handler()) || seed.handler() == "optimize_store";
        if !known {
            warn!(task = %seed.name, handler = seed.handler(), "handler is not built in");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Wait for SIGINT, SIGTERM or SIGQUIT and name the signal received.
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
            _ = quit.recv() => Ok("SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

/// Like [`wait_for_shutdown`], but a broken listener never completes.
async fn shutdown_signal() -> &'static str {
    match wait_for_shutdown().await {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "shutdown signal listener failed");
            std::future::pending().await
        }
    }
}
