//! Vigil configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VigilError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
            notify: NotifyConfig::default(),
            approval: ApprovalConfig::default(),
            watchdog: WatchdogConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl VigilConfig {
    /// Load config from the default path (~/.vigil/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VigilError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| VigilError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Vigil home directory (data stores, pid file, logs).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vigil")
    }
}

/// Scheduler loop intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between decision-loop ticks.
    #[serde(default = "default_decision_interval")]
    pub decision_interval_secs: u64,
    /// Seconds between tracker flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Seconds between health/watchdog checks.
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Seconds between stale-claim reaper passes.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_decision_interval() -> u64 { 30 }
fn default_flush_interval() -> u64 { 60 }
fn default_health_interval() -> u64 { 300 }
fn default_reaper_interval() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decision_interval_secs: default_decision_interval(),
            flush_interval_secs: default_flush_interval(),
            health_interval_secs: default_health_interval(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Max attempts before a task goes to dead_letter.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff (seconds).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Cap on a single backoff delay (seconds).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// A running claim with no heartbeat for this long is orphaned.
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_secs: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_backoff_base() -> u64 { 30 }
fn default_backoff_cap() -> u64 { 3600 }
fn default_heartbeat_stale() -> u64 { 120 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            heartbeat_stale_secs: default_heartbeat_stale(),
        }
    }
}

/// Task executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Parallel workers draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-task runner timeout (seconds).
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Seconds a worker sleeps when the queue is empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Grace period for in-flight tasks on shutdown (seconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Seconds between claim heartbeats while a task runs.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_workers() -> usize { 3 }
fn default_task_timeout() -> u64 { 1800 }
fn default_poll_interval() -> u64 { 10 }
fn default_shutdown_grace() -> u64 { 15 }
fn default_heartbeat_interval() -> u64 { 30 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_secs: default_task_timeout(),
            poll_interval_secs: default_poll_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Notification routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Quiet hours start (local hour 0-23). Non-high notifications are
    /// suppressed between start and end.
    #[serde(default = "default_quiet_start")]
    pub quiet_hours_start: u32,
    /// Quiet hours end (local hour 0-23).
    #[serde(default = "default_quiet_end")]
    pub quiet_hours_end: u32,
    /// Window within which a repeated dedup key is suppressed (seconds).
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
}

fn default_quiet_start() -> u32 { 22 }
fn default_quiet_end() -> u32 { 7 }
fn default_dedup_window() -> u64 { 3600 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            quiet_hours_start: default_quiet_start(),
            quiet_hours_end: default_quiet_end(),
            dedup_window_secs: default_dedup_window(),
        }
    }
}

/// Approval gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Default request timeout (seconds).
    #[serde(default = "default_approval_timeout")]
    pub default_timeout_secs: u64,
    /// Poll interval for wait_for_approval (seconds).
    #[serde(default = "default_approval_poll")]
    pub poll_interval_secs: u64,
}

fn default_approval_timeout() -> u64 { 600 }
fn default_approval_poll() -> u64 { 5 }

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_approval_timeout(),
            poll_interval_secs: default_approval_poll(),
        }
    }
}

/// Watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Max automatic restarts within the window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Sliding restart window (seconds).
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    /// Services to watch.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// One watched service, as declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub pid_file: String,
    pub start_command: String,
}

fn default_max_restarts() -> u32 { 5 }
fn default_restart_window() -> u64 { 300 }

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            services: Vec::new(),
        }
    }
}

/// Tracker state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Dedup markers older than this are pruned (hours).
    #[serde(default = "default_marker_max_age")]
    pub marker_max_age_hours: u64,
}

fn default_marker_max_age() -> u64 { 48 }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            marker_max_age_hours: default_marker_max_age(),
        }
    }
}
