//! Watchdog — liveness checks and rate-limited restarts for dependent
//! services.
//!
//! Each declared service is probed once per health tick (pid file plus an
//! OS process check by default). A dead service is restarted, but at most
//! `max_restarts` times inside the sliding window; past that the watchdog
//! stops trying and escalates with a single high-priority decision instead
//! of flapping forever.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use vigil_core::config::WatchdogConfig;
use vigil_core::Result;

use crate::decision::{Decision, Priority};
use crate::tracker::TrackerState;

/// A service the watchdog is responsible for.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub pid_file: PathBuf,
    /// Shell command that starts the service (detached).
    pub start_command: String,
}

/// Liveness and restart primitives, separated out so tests can fake the OS.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, spec: &ServiceSpec) -> bool;

    async fn restart(&self, spec: &ServiceSpec) -> Result<()>;
}

/// Default probe: pid file + `/proc/<pid>` existence, restart via shell.
pub struct PidFileProbe;

#[async_trait]
impl ProcessProbe for PidFileProbe {
    fn is_alive(&self, spec: &ServiceSpec) -> bool {
        let Ok(raw) = std::fs::read_to_string(&spec.pid_file) else {
            return false;
        };
        let Ok(pid) = raw.trim().parse::<u32>() else {
            return false;
        };
        PathBuf::from(format!("/proc/{pid}")).exists()
    }

    async fn restart(&self, spec: &ServiceSpec) -> Result<()> {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&spec.start_command)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        Ok(())
    }
}

/// Health monitor over declared services.
pub struct Watchdog {
    services: Vec<ServiceSpec>,
    probe: Box<dyn ProcessProbe>,
    tracker: Arc<TrackerState>,
    config: WatchdogConfig,
    restart_times: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl Watchdog {
    pub fn new(
        services: Vec<ServiceSpec>,
        probe: Box<dyn ProcessProbe>,
        tracker: Arc<TrackerState>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            services,
            probe,
            tracker,
            config,
            restart_times: Mutex::new(HashMap::new()),
        }
    }

    /// Probe every service once. Dead services are restarted (rate-limited);
    /// the returned decisions carry restart notices and escalations for the
    /// scheduler to route.
    pub async fn check_all(&self) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for spec in &self.services {
            if self.probe.is_alive(spec) {
                self.tracker.reset_failures(&spec.name);
                continue;
            }
            let failures = self.tracker.record_failure(&spec.name);
            tracing::warn!(
                "💔 Service '{}' is down (consecutive failures: {failures})",
                spec.name
            );
            if failures >= 2 {
                if let Some(alert) = self.repeated_failure_alert(spec, failures) {
                    decisions.push(alert);
                }
            }
            if let Some(decision) = self.handle_down(spec).await {
                decisions.push(decision);
            }
        }
        decisions
    }

    async fn handle_down(&self, spec: &ServiceSpec) -> Option<Decision> {
        if !self.restart_allowed(&spec.name) {
            return self.escalate(spec);
        }
        match self.probe.restart(spec).await {
            Ok(()) => {
                self.record_restart(&spec.name);
                tracing::info!("🔄 Restarted service '{}'", spec.name);
                Some(
                    Decision::notify(
                        Priority::Medium,
                        &format!("Restarted {}", spec.name),
                        "Service was down and has been restarted automatically",
                    )
                    .with_dedup_key(&format!("watchdog:{}:restarted", spec.name)),
                )
            }
            Err(e) => {
                tracing::error!("❌ Restart of '{}' failed: {e}", spec.name);
                // A failed attempt still counts against the window
                self.record_restart(&spec.name);
                None
            }
        }
    }

    /// A service down on consecutive checks gets one cooldown-gated alert;
    /// a single blip does not.
    fn repeated_failure_alert(&self, spec: &ServiceSpec, failures: u32) -> Option<Decision> {
        let key = format!("watchdog:{}:failing", spec.name);
        let window = Duration::seconds(self.config.restart_window_secs as i64);
        if !self.tracker.check_cooldown(&key, window) {
            return None;
        }
        self.tracker.record_cooldown(&key);
        Some(
            Decision::notify(
                Priority::Medium,
                &format!("{} is failing repeatedly", spec.name),
                &format!("Down on {failures} consecutive health checks"),
            )
            .with_dedup_key(&key),
        )
    }

    /// One escalation per window once restarts are exhausted.
    fn escalate(&self, spec: &ServiceSpec) -> Option<Decision> {
        let key = format!("watchdog:{}:exhausted", spec.name);
        let window = Duration::seconds(self.config.restart_window_secs as i64);
        if !self.tracker.check_cooldown(&key, window) {
            return None;
        }
        self.tracker.record_cooldown(&key);
        tracing::error!(
            "🚨 Service '{}' restart budget exhausted ({} in {}s), giving up",
            spec.name,
            self.config.max_restarts,
            self.config.restart_window_secs
        );
        Some(
            Decision::notify(
                Priority::High,
                &format!("{} keeps crashing", spec.name),
                &format!(
                    "Restarted {} times in {}s without staying up; manual intervention needed",
                    self.config.max_restarts, self.config.restart_window_secs
                ),
            )
            .with_dedup_key(&key),
        )
    }

    fn restart_allowed(&self, service: &str) -> bool {
        let cutoff = Utc::now() - Duration::seconds(self.config.restart_window_secs as i64);
        let mut times = self.restart_times.lock().unwrap_or_else(|p| p.into_inner());
        let history = times.entry(service.to_string()).or_default();
        history.retain(|t| *t > cutoff);
        (history.len() as u32) < self.config.max_restarts
    }

    fn record_restart(&self, service: &str) {
        let mut times = self.restart_times.lock().unwrap_or_else(|p| p.into_inner());
        times.entry(service.to_string()).or_default().push(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeProbe {
        alive: Arc<AtomicBool>,
        restarts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, _spec: &ServiceSpec) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn restart(&self, _spec: &ServiceSpec) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tracker() -> Arc<TrackerState> {
        let path = std::env::temp_dir()
            .join(format!("vigil-watchdog-{}.json", uuid::Uuid::new_v4()));
        Arc::new(TrackerState::open(&path))
    }

    fn bridge_spec() -> ServiceSpec {
        ServiceSpec {
            name: "bridge".to_string(),
            pid_file: PathBuf::from("/tmp/bridge.pid"),
            start_command: "true".to_string(),
        }
    }

    fn watchdog(alive: Arc<AtomicBool>, restarts: Arc<AtomicU32>) -> Watchdog {
        Watchdog::new(
            vec![bridge_spec()],
            Box::new(FakeProbe { alive, restarts }),
            tracker(),
            WatchdogConfig {
                max_restarts: 5,
                restart_window_secs: 300,
                services: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn healthy_service_is_left_alone() {
        let restarts = Arc::new(AtomicU32::new(0));
        let wd = watchdog(Arc::new(AtomicBool::new(true)), restarts.clone());
        assert!(wd.check_all().await.is_empty());
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dead_service_is_restarted_with_a_notice() {
        let restarts = Arc::new(AtomicU32::new(0));
        let wd = watchdog(Arc::new(AtomicBool::new(false)), restarts.clone());

        let decisions = wd.check_all().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].priority, Priority::Medium);
    }

    #[tokio::test]
    async fn second_consecutive_failure_raises_one_alert() {
        let restarts = Arc::new(AtomicU32::new(0));
        let wd = watchdog(Arc::new(AtomicBool::new(false)), restarts.clone());

        // First blip: restart notice only
        assert_eq!(wd.check_all().await.len(), 1);

        // Second consecutive failure: repeated-failure alert + restart notice
        let decisions = wd.check_all().await;
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].title.contains("failing repeatedly"));

        // Third failure: alert is inside its cooldown
        assert_eq!(wd.check_all().await.len(), 1);
    }

    #[tokio::test]
    async fn restart_budget_caps_at_five_then_escalates_once() {
        let restarts = Arc::new(AtomicU32::new(0));
        let wd = watchdog(Arc::new(AtomicBool::new(false)), restarts.clone());

        for _ in 0..5 {
            wd.check_all().await;
        }
        assert_eq!(restarts.load(Ordering::SeqCst), 5);

        // Sixth crash inside the window: no restart, one high-priority alert
        let decisions = wd.check_all().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 5);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].priority, Priority::High);

        // Further checks stay quiet until the escalation cooldown passes
        assert!(wd.check_all().await.is_empty());
        assert_eq!(restarts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn recovery_resets_failure_count() {
        let alive = Arc::new(AtomicBool::new(false));
        let restarts = Arc::new(AtomicU32::new(0));
        let wd = watchdog(alive.clone(), restarts.clone());

        wd.check_all().await;
        assert_eq!(wd.tracker.failure_count("bridge"), 1);

        alive.store(true, Ordering::SeqCst);
        wd.check_all().await;
        assert_eq!(wd.tracker.failure_count("bridge"), 0);
    }

    #[test]
    fn pid_probe_reports_dead_without_pid_file() {
        let spec = ServiceSpec {
            name: "ghost".to_string(),
            pid_file: std::env::temp_dir()
                .join(format!("vigil-missing-{}.pid", uuid::Uuid::new_v4())),
            start_command: "true".to_string(),
        };
        assert!(!PidFileProbe.is_alive(&spec));
    }

    #[test]
    fn pid_probe_sees_a_live_process() {
        let pid_file = std::env::temp_dir()
            .join(format!("vigil-self-{}.pid", uuid::Uuid::new_v4()));
        std::fs::write(&pid_file, std::process::id().to_string()).unwrap();
        let spec = ServiceSpec {
            name: "self".to_string(),
            pid_file: pid_file.clone(),
            start_command: "true".to_string(),
        };
        assert!(PidFileProbe.is_alive(&spec));
        std::fs::remove_file(&pid_file).ok();
    }
}
