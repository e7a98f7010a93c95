//! Continuous mode.
//!
//! The daemon holds a single-instance marker, runs scheduled passes back to
//! back with an idle wait in between, and stops cooperatively: a stop
//! request (or the run-time cap) never interrupts a pass in flight.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Terminated
//! ```

mod pid;

pub use pid::{InstanceMarker, process_alive, read_pid};

use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::task::panic_message;
use crate::core::types::{SiteId, TaskName};
use crate::events::Event;
use crate::scheduler::{PassRequest, Scheduler};
use crate::storage::TaskStore;

/// Default wait between passes.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on how long one daemon process keeps looping.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(3600);

/// Errors that prevent the daemon from starting or stopping cleanly.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Another live process holds the instance marker.
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    /// The instance marker could not be read, written or removed.
    #[error("instance marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle state of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DaemonState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            DaemonState::Idle => "idle",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Terminated => "terminated",
        };
        f.write_str(state)
    }
}

/// Why the daemon left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`DaemonHandle::stop`] was called, usually from a signal.
    Requested,
    /// The run-time cap elapsed.
    MaxRunTime,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::MaxRunTime => f.write_str("maximum run time reached"),
        }
    }
}

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Location of the single-instance marker.
    pub pid_file: PathBuf,
    /// Wait between passes.
    pub idle_interval: Duration,
    /// Stop after this long; `None` loops until stopped.
    pub max_run_time: Option<Duration>,
    /// Site passed to every pass.
    pub site: SiteId,
}

impl DaemonConfig {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            max_run_time: Some(DEFAULT_MAX_RUN_TIME),
            site: SiteId::default(),
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_max_run_time(mut self, max: Option<Duration>) -> Self {
        self.max_run_time = max;
        self
    }

    pub fn with_site(mut self, site: impl Into<SiteId>) -> Self {
        self.site = site.into();
        self
    }
}

/// What a daemon did before it terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSummary {
    /// Passes started, including failed ones.
    pub passes: u64,
    /// Passes that ended in an error.
    pub failed_passes: u64,
    pub reason: StopReason,
    /// Claim released by the recovery hook on the way out.
    pub recovered: Option<TaskName>,
}

/// Handle for controlling a running daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<DaemonState>,
}

impl DaemonHandle {
    /// Ask the daemon to stop after the current pass.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Get the current daemon state.
    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    /// Wait until the daemon has reached `state` or a later one.
    pub async fn wait_for(&self, state: DaemonState) -> DaemonState {
        let mut rx = self.state_rx.clone();
        if let Ok(current) = rx.wait_for(|s| *s >= state).await {
            return *current;
        }
        *rx.borrow()
    }
}

/// Runs scheduled passes until stopped.
pub struct Daemon<S: TaskStore> {
    scheduler: Arc<Scheduler<S>>,
    config: DaemonConfig,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<DaemonState>,
    state_rx: watch::Receiver<DaemonState>,
}

impl<S: TaskStore + 'static> Daemon<S> {
    pub fn new(scheduler: Arc<Scheduler<S>>, config: DaemonConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(DaemonState::Idle);
        Self {
            scheduler,
            config,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            state_tx,
            state_rx,
        }
    }

    /// A handle that can stop this daemon and observe its state.
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            stop_tx: Arc::clone(&self.stop_tx),
            state_rx: self.state_rx.clone(),
        }
    }

    fn set_state(&self, state: DaemonState) {
        tracing::debug!(state = %state, "daemon state");
        self.state_tx.send_replace(state);
    }

    /// Acquire the instance marker and loop until stopped.
    ///
    /// Fails without running any pass when another live daemon holds the
    /// marker.
    pub async fn run(mut self) -> Result<DaemonSummary, DaemonError> {
        self.set_state(DaemonState::Starting);
        let marker = match InstanceMarker::acquire(&self.config.pid_file) {
            Ok(marker) => marker,
            Err(e) => {
                self.set_state(DaemonState::Terminated);
                return Err(e);
            }
        };

        tracing::info!(
            pid = marker.pid(),
            pid_file = %marker.path().display(),
            site = %self.config.site,
            idle_secs = self.config.idle_interval.as_secs(),
            "daemon started"
        );
        self.scheduler
            .event_bus()
            .emit(Event::daemon_started(marker.pid()))
            .await;
        self.set_state(DaemonState::Running);

        let (passes, failed_passes, reason) = self.run_loop().await;

        self.set_state(DaemonState::Stopping);
        tracing::info!(reason = %reason, passes, "daemon stopping");

        let recovered = self.recover().await;
        if let Err(e) = marker.release() {
            tracing::warn!(error = %e, "failed to remove instance marker");
        }

        self.scheduler
            .event_bus()
            .emit(Event::daemon_stopped(passes, reason))
            .await;
        self.set_state(DaemonState::Terminated);

        Ok(DaemonSummary {
            passes,
            failed_passes,
            reason,
            recovered,
        })
    }

    async fn run_loop(&mut self) -> (u64, u64, StopReason) {
        let started = tokio::time::Instant::now();
        let request = PassRequest::scheduled(self.config.site.clone());
        let mut passes = 0;
        let mut failed = 0;

        loop {
            if *self.stop_rx.borrow() {
                return (passes, failed, StopReason::Requested);
            }

            passes += 1;
            let pass = AssertUnwindSafe(self.scheduler.run_pass(&request)).catch_unwind();
            match pass.await {
                Ok(Ok(report)) => {
                    tracing::debug!(
                        pass_id = %report.pass_id,
                        executed = report.executed(),
                        skipped = report.skipped(),
                        "daemon pass finished"
                    );
                }
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::error!(error = %e, "daemon pass failed");
                    // A failed release leaves the marker set; retry it before the next pass.
                    self.recover().await;
                }
                Err(payload) => {
                    failed += 1;
                    tracing::error!(error = %panic_message(payload), "daemon pass panicked");
                    self.recover().await;
                }
            }

            if self
                .config
                .max_run_time
                .is_some_and(|cap| started.elapsed() >= cap)
            {
                return (passes, failed, StopReason::MaxRunTime);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.idle_interval) => {}
                _ = self.stop_rx.changed() => {}
            }
        }
    }

    async fn recover(&self) -> Option<TaskName> {
        match self.scheduler.recovery_hook().fire().await {
            Ok(recovered) => recovered,
            Err(e) => {
                tracing::error!(error = %e, "recovery hook failed");
                None
            }
        }
    }
}
