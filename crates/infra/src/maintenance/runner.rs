use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use segforge_core::ProjectName;

use super::iteration::{IterationOutcome, SkipReason};
use super::master::MasterElection;
use crate::config::MaintenanceConfig;

/// One unit of periodic work for a project.
pub trait MaintenanceTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run_once(&self, project: &ProjectName) -> IterationOutcome;
}

/// Counters published by a running maintenance thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub iterations: u64,
    pub committed: u64,
    pub aborted: u64,
    pub skipped: u64,
    pub last_outcome: Option<IterationOutcome>,
}

/// Scheduling parameters shared by every maintenance thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceRunner {
    pub interval: Duration,
    pub on_demand_delay: Duration,
}

impl Default for MaintenanceRunner {
    fn default() -> Self {
        Self::from(&MaintenanceConfig::default())
    }
}

impl From<&MaintenanceConfig> for MaintenanceRunner {
    fn from(cfg: &MaintenanceConfig) -> Self {
        Self {
            interval: cfg.interval(),
            on_demand_delay: cfg.on_demand_delay(),
        }
    }
}

/// Handle for a running maintenance thread (shutdown + trigger hook).
#[derive(Debug)]
pub struct MaintenanceHandle {
    task: String,
    project: ProjectName,
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    stats: Arc<Mutex<RunnerStats>>,
    join: Option<thread::JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    /// Request an extra iteration after the on-demand delay.
    ///
    /// Triggers are coalesced: while one is pending, further calls are no-ops.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Stop the thread after its current iteration and wait for it.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl MaintenanceRunner {
    /// Spawn the maintenance thread of `task` for `project`.
    ///
    /// - Schedule: the first iteration runs immediately, later ones
    ///   `interval` after the previous one finished
    /// - Master gating: non-master nodes record `Skipped(NotMaster)`
    /// - Failures: logged and reported in the stats, never propagated
    pub fn spawn(
        &self,
        project: ProjectName,
        task: Arc<dyn MaintenanceTask>,
        master: Arc<dyn MasterElection>,
    ) -> std::io::Result<MaintenanceHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let stats = Arc::new(Mutex::new(RunnerStats::default()));

        let name = task.name().to_string();
        let cfg = self.clone();
        let thread_project = project.clone();
        let thread_stats = stats.clone();
        let join = thread::Builder::new()
            .name(format!("{name}-{project}"))
            .spawn(move || {
                runner_loop(
                    cfg,
                    thread_project,
                    task,
                    master,
                    shutdown_rx,
                    trigger_rx,
                    thread_stats,
                )
            })?;

        Ok(MaintenanceHandle {
            task: name,
            project,
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            stats,
            join: Some(join),
        })
    }
}

fn runner_loop(
    cfg: MaintenanceRunner,
    project: ProjectName,
    task: Arc<dyn MaintenanceTask>,
    master: Arc<dyn MasterElection>,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) {
    info!(task = task.name(), project = %project, "maintenance runner started");

    let mut next_run = Instant::now();

    loop {
        // Shutdown has priority; a dropped handle also stops the thread.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        while trigger_rx.try_recv().is_ok() {
            next_run = next_run.min(Instant::now() + cfg.on_demand_delay);
        }

        let now = Instant::now();
        if now < next_run {
            thread::sleep((next_run - now).min(Duration::from_millis(50)));
            continue;
        }

        let outcome = if master.is_master() {
            task.run_once(&project)
        } else {
            IterationOutcome::Skipped(SkipReason::NotMaster)
        };

        match &outcome {
            IterationOutcome::Committed { records, offset } => {
                debug!(task = task.name(), project = %project, records, offset = ?offset, "maintenance iteration committed")
            }
            IterationOutcome::Aborted(reason) => {
                warn!(task = task.name(), project = %project, reason = %reason, "maintenance iteration aborted")
            }
            IterationOutcome::Skipped(reason) => {
                debug!(task = task.name(), project = %project, reason = ?reason, "maintenance iteration skipped")
            }
        }
        record(&stats, outcome);

        // Fixed delay: measured from the end of this iteration.
        next_run = Instant::now() + cfg.interval;
    }

    info!(task = task.name(), project = %project, "maintenance runner stopped");
}

fn record(stats: &Mutex<RunnerStats>, outcome: IterationOutcome) {
    let mut stats = match stats.lock() {
        Ok(s) => s,
        Err(poisoned) => poisoned.into_inner(),
    };
    stats.iterations += 1;
    match &outcome {
        IterationOutcome::Committed { .. } => stats.committed += 1,
        IterationOutcome::Aborted(_) => stats.aborted += 1,
        IterationOutcome::Skipped(_) => stats.skipped += 1,
    }
    stats.last_outcome = Some(outcome);
}
