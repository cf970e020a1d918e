//! Scheduler — the always-on core. One tokio loop per concern, all wired to
//! a single shutdown signal:
//!
//! * decision loop: pull snapshots from each provider, evaluate triggers,
//!   route the resulting decisions
//! * flush loop: persist tracker state and prune old markers
//! * reaper loop: requeue claims whose worker stopped heartbeating
//! * health loop: watchdog over dependent services
//!
//! Pause is a marker file checked at the top of each decision/health tick,
//! so an operator can quiesce a running daemon without stopping it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use vigil_core::{Result, VigilConfig, VigilError};

use crate::approval::ApprovalGate;
use crate::decision::{ActionType, Decision, DecisionEngine};
use crate::executor::TaskExecutor;
use crate::queue::TaskQueue;
use crate::router::NotificationRouter;
use crate::snapshot::StateProvider;
use crate::tracker::TrackerState;
use crate::watchdog::Watchdog;

/// Explicit daemon state: pid file ownership plus the pause marker. Owned
/// by one scheduler instance; the pid file is removed on drop.
pub struct ProcessState {
    dir: PathBuf,
}

impl ProcessState {
    /// Claim the pid file. Fails if another live process holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        if let Some(pid) = Self::running_pid(dir) {
            return Err(VigilError::InvalidState(format!(
                "already running (pid {pid})"
            )));
        }
        std::fs::write(Self::pid_file(dir), std::process::id().to_string())?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Pid of a live daemon using this directory, if any.
    pub fn running_pid(dir: &Path) -> Option<u32> {
        let raw = std::fs::read_to_string(Self::pid_file(dir)).ok()?;
        let pid = raw.trim().parse::<u32>().ok()?;
        if PathBuf::from(format!("/proc/{pid}")).exists() {
            Some(pid)
        } else {
            None
        }
    }

    pub fn pause(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(Self::pause_marker(dir), "")?;
        Ok(())
    }

    pub fn resume(dir: &Path) -> Result<()> {
        match std::fs::remove_file(Self::pause_marker(dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_paused(dir: &Path) -> bool {
        Self::pause_marker(dir).exists()
    }

    fn pid_file(dir: &Path) -> PathBuf {
        dir.join("vigil.pid")
    }

    fn pause_marker(dir: &Path) -> PathBuf {
        dir.join("paused")
    }
}

impl Drop for ProcessState {
    fn drop(&mut self) {
        std::fs::remove_file(Self::pid_file(&self.dir)).ok();
    }
}

/// Shared wiring handed to every loop.
struct Shared {
    config: VigilConfig,
    data_dir: PathBuf,
    queue: Arc<TaskQueue>,
    router: Arc<NotificationRouter>,
    gate: Arc<ApprovalGate>,
    tracker: Arc<TrackerState>,
}

impl Shared {
    /// Dispatch one decision to the component its action type names.
    async fn route(&self, decision: Decision) {
        match decision.action_type {
            ActionType::Notify => {
                self.router.send(&decision).await;
            }
            ActionType::EnqueueTask => {
                match self.queue.enqueue(
                    &decision.title,
                    &decision.payload,
                    decision.priority.queue_priority(),
                ) {
                    Ok(id) => tracing::info!("📥 Decision '{}' queued as task #{id}", decision.title),
                    Err(e) => tracing::warn!("⚠️ Could not queue '{}': {e}", decision.title),
                }
            }
            ActionType::RequestApproval => {
                match self.gate.request_approval(
                    &decision.title,
                    &decision.message,
                    decision.payload.clone(),
                    self.config.approval.default_timeout_secs,
                    false,
                ) {
                    Ok(id) => {
                        tracing::info!("🔐 Decision '{}' awaiting approval {id}", decision.title);
                        self.router.send(&decision).await;
                    }
                    Err(e) => tracing::warn!("⚠️ Approval request failed: {e}"),
                }
            }
            ActionType::Ignore => {
                tracing::debug!("🙈 Ignoring decision '{}'", decision.title);
            }
        }
    }
}

/// Owns the loops, the worker pool, and the process state.
pub struct Scheduler {
    shared: Arc<Shared>,
    engine: Arc<DecisionEngine>,
    providers: Vec<Arc<dyn StateProvider>>,
    watchdog: Arc<Watchdog>,
    executor: TaskExecutor,
    process: ProcessState,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VigilConfig,
        data_dir: &Path,
        engine: DecisionEngine,
        providers: Vec<Arc<dyn StateProvider>>,
        queue: Arc<TaskQueue>,
        router: NotificationRouter,
        gate: Arc<ApprovalGate>,
        tracker: Arc<TrackerState>,
        watchdog: Watchdog,
        executor: TaskExecutor,
    ) -> Result<Self> {
        let process = ProcessState::acquire(data_dir)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                data_dir: data_dir.to_path_buf(),
                queue,
                router: Arc::new(router),
                gate,
                tracker,
            }),
            engine: Arc::new(engine),
            providers,
            watchdog: Arc::new(watchdog),
            executor,
            process,
        })
    }

    /// Run until the shutdown signal flips. Flushes state on the way out.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let cfg = &self.shared.config.scheduler;
        tracing::info!(
            "🚀 Scheduler starting (decision {}s, flush {}s, reaper {}s, health {}s)",
            cfg.decision_interval_secs,
            cfg.flush_interval_secs,
            cfg.reaper_interval_secs,
            cfg.health_interval_secs
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(self.spawn_decision_loop(shutdown.clone()));
        handles.push(self.spawn_flush_loop(shutdown.clone()));
        handles.push(self.spawn_reaper_loop(shutdown.clone()));
        handles.push(self.spawn_health_loop(shutdown.clone()));
        handles.extend(self.executor.spawn(shutdown.clone()));

        let mut shutdown = shutdown;
        // Err here means the sender vanished; treat it as a stop request too
        let _ = shutdown.wait_for(|stop| *stop).await;
        tracing::info!("🛑 Shutdown requested, draining loops");

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Loop ended abnormally: {e}");
            }
        }
        if let Err(e) = self.shared.tracker.flush() {
            tracing::warn!("⚠️ Final tracker flush failed: {e}");
        }
        drop(self.process);
        tracing::info!("👋 Scheduler stopped");
        Ok(())
    }

    fn spawn_decision_loop(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let engine = self.engine.clone();
        let providers = self.providers.clone();
        let interval = Duration::from_secs(shared.config.scheduler.decision_interval_secs);
        tokio::spawn(tick_loop("decision", interval, shutdown, move || {
            let shared = shared.clone();
            let engine = engine.clone();
            let providers = providers.clone();
            async move {
                if ProcessState::is_paused(&shared.data_dir) {
                    tracing::debug!("⏸️ Paused, skipping decision tick");
                    return;
                }
                for provider in &providers {
                    let snapshot = match provider.pull().await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            tracing::debug!("⚠️ Provider '{}' unavailable: {e}", provider.name());
                            continue;
                        }
                    };
                    for decision in engine.evaluate(&snapshot) {
                        shared.route(decision).await;
                    }
                }
            }
        }))
    }

    fn spawn_flush_loop(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let interval = Duration::from_secs(shared.config.scheduler.flush_interval_secs);
        tokio::spawn(tick_loop("flush", interval, shutdown, move || {
            let shared = shared.clone();
            async move {
                let max_age =
                    chrono::Duration::hours(shared.config.tracker.marker_max_age_hours as i64);
                shared.tracker.prune(max_age);
                if let Err(e) = shared.tracker.flush() {
                    // Retried next tick; never fatal
                    tracing::warn!("⚠️ Tracker flush failed: {e}");
                }
                if let Err(e) = shared.gate.cleanup_old(max_age) {
                    tracing::warn!("⚠️ Approval cleanup failed: {e}");
                }
                if let Err(e) = shared.queue.cleanup_old(30) {
                    tracing::warn!("⚠️ Queue cleanup failed: {e}");
                }
            }
        }))
    }

    fn spawn_reaper_loop(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let interval = Duration::from_secs(shared.config.scheduler.reaper_interval_secs);
        tokio::spawn(tick_loop("reaper", interval, shutdown, move || {
            let shared = shared.clone();
            async move {
                let stale = shared.config.queue.heartbeat_stale_secs;
                if let Err(e) = shared.queue.requeue_stale(stale) {
                    tracing::warn!("⚠️ Stale-claim reap failed: {e}");
                }
            }
        }))
    }

    fn spawn_health_loop(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let watchdog = self.watchdog.clone();
        let interval = Duration::from_secs(shared.config.scheduler.health_interval_secs);
        tokio::spawn(tick_loop("health", interval, shutdown, move || {
            let shared = shared.clone();
            let watchdog = watchdog.clone();
            async move {
                if ProcessState::is_paused(&shared.data_dir) {
                    return;
                }
                for decision in watchdog.check_all().await {
                    shared.route(decision).await;
                }
            }
        }))
    }
}

/// Generic timed loop: run `tick` every `interval` until shutdown. Exits
/// within one interval of the signal.
async fn tick_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            // The watch ref must not outlive the select arm
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
        }
        if *shutdown.borrow() {
            break;
        }
        tick().await;
    }
    tracing::debug!("Loop '{name}' stopped");
}
