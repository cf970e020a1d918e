//! Tracker state — durable, thread-safe key/value store for dedup markers,
//! cooldown timestamps, per-period "already ran" guards, and service failure
//! counts. Several loops mutate it concurrently; one internal lock guards
//! every read-modify-write, and flushes go through a temp file + atomic
//! rename so a crash never leaves a half-written state file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, Local, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::{Result, VigilError};

/// Calendar period for run-once guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ServiceFailures {
    count: u32,
    last_failure: Option<DateTime<Utc>>,
}

/// On-disk shape. Unknown keys in an old file are dropped; missing keys get
/// defaults, so the format can grow without migration code.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TrackerData {
    /// event_id -> when it was first notified.
    #[serde(default)]
    notified: HashMap<String, DateTime<Utc>>,
    /// cooldown key -> last trigger time.
    #[serde(default)]
    cooldowns: HashMap<String, DateTime<Utc>>,
    /// routine name -> period stamp ("2026-08-27" or "2026-W35").
    #[serde(default)]
    period_guards: HashMap<String, String>,
    /// service name -> consecutive failure count.
    #[serde(default)]
    service_failures: HashMap<String, ServiceFailures>,
}

/// Thread-safe persistent state manager.
pub struct TrackerState {
    state_file: PathBuf,
    inner: Mutex<TrackerData>,
}

impl TrackerState {
    /// Open the tracker, loading existing state if the file exists.
    pub fn open(state_file: &Path) -> Self {
        let data = match std::fs::read_to_string(state_file) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Tracker state unreadable, starting fresh: {e}");
                TrackerData::default()
            }),
            Err(_) => TrackerData::default(),
        };
        Self {
            state_file: state_file.to_path_buf(),
            inner: Mutex::new(data),
        }
    }

    /// Atomically flush state to disk (temp file + rename).
    pub fn flush(&self) -> Result<()> {
        let json = {
            let data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            serde_json::to_string_pretty(&*data)?
        };
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.state_file.with_extension("tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.state_file)
            .map_err(|e| VigilError::Store(format!("tracker rename failed: {e}")))?;
        tracing::debug!("💾 Tracker state flushed to {}", self.state_file.display());
        Ok(())
    }

    // ─── Dedup markers ──────────────────────────────────────

    /// Mark an event as notified. Returns true only the first time for a
    /// given id; callers use the return value as the "should I act" signal.
    pub fn mark_notified(&self, event_id: &str) -> bool {
        let mut data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if data.notified.contains_key(event_id) {
            return false;
        }
        data.notified.insert(event_id.to_string(), Utc::now());
        true
    }

    /// Whether an event id was already marked.
    pub fn is_notified(&self, event_id: &str) -> bool {
        let data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        data.notified.contains_key(event_id)
    }

    /// Drop dedup markers older than `max_age` to keep the file bounded.
    pub fn prune(&self, max_age: Duration) {
        let cutoff = Utc::now() - max_age;
        let mut data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        data.notified.retain(|_, ts| *ts > cutoff);
        data.cooldowns.retain(|_, ts| *ts > cutoff);
    }

    // ─── Cooldowns ──────────────────────────────────────────

    /// Check if a cooldown has expired. Returns true if the action is
    /// allowed (no record, or the window has elapsed).
    pub fn check_cooldown(&self, key: &str, window: Duration) -> bool {
        let data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match data.cooldowns.get(key) {
            Some(last) => Utc::now() - *last >= window,
            None => true,
        }
    }

    /// Record that an action was taken (start the cooldown).
    pub fn record_cooldown(&self, key: &str) {
        let mut data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        data.cooldowns.insert(key.to_string(), Utc::now());
    }

    // ─── Period guards ──────────────────────────────────────

    /// Returns true at most once per calendar period for a routine,
    /// surviving restarts. The first caller inside a new period wins.
    pub fn guard_once(&self, routine: &str, period: Period) -> bool {
        let stamp = Self::period_stamp(period);
        let mut data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if data.period_guards.get(routine) == Some(&stamp) {
            return false;
        }
        data.period_guards.insert(routine.to_string(), stamp);
        true
    }

    fn period_stamp(period: Period) -> String {
        let now = Local::now();
        match period {
            Period::Day => now.format("%Y-%m-%d").to_string(),
            Period::Week => {
                let week = now.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }

    // ─── Service health counters ────────────────────────────

    /// Record a service failure; returns the new consecutive count.
    pub fn record_failure(&self, service: &str) -> u32 {
        let mut data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let entry = data.service_failures.entry(service.to_string()).or_default();
        entry.count += 1;
        entry.last_failure = Some(Utc::now());
        entry.count
    }

    /// Reset the failure count after a successful check.
    pub fn reset_failures(&self, service: &str) {
        let mut data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = data.service_failures.get_mut(service) {
            entry.count = 0;
        }
    }

    pub fn failure_count(&self, service: &str) -> u32 {
        let data = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        data.service_failures.get(service).map(|e| e.count).unwrap_or(0)
    }
}
