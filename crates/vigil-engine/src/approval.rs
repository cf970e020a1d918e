//! Approval gate — human-in-the-loop authorization for risky actions.
//!
//! Requests move strictly forward: `pending` resolves to `approved` or
//! `denied` by an explicit operator call, or — once the timeout elapses with
//! no resolution — to `approved` (auto_approve) or `expired`. Timeouts are
//! applied lazily on read, so no background timer is needed and the outcome
//! is the same after a restart. The request table persists as a JSON file
//! with atomic writes, re-read on every operation so the daemon and the
//! operator CLI can work the same store concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::{Result, VigilError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timeout_secs: u64,
    pub auto_approve: bool,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    fn timed_out(&self, now: DateTime<Utc>) -> bool {
        (now - self.requested_at).num_seconds() >= self.timeout_secs as i64
    }
}

/// Durable table of approval requests.
pub struct ApprovalGate {
    path: PathBuf,
    poll: std::time::Duration,
    /// Serializes read-modify-write cycles within this process. The store
    /// itself is re-read from disk on every operation, so the daemon and
    /// the operator CLI see each other's writes instead of clobbering them
    /// with stale in-memory copies.
    lock: Mutex<()>,
}

impl ApprovalGate {
    /// Open the gate. `poll` is the interval `wait_for_approval` re-checks
    /// at.
    pub fn open(path: &Path, poll: std::time::Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            poll,
            lock: Mutex::new(()),
        }
    }

    /// Current on-disk request table.
    fn load(&self) -> HashMap<String, ApprovalRequest> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Approval store unreadable, starting fresh: {e}");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    /// File a new request. Returns its id.
    pub fn request_approval(
        &self,
        action: &str,
        description: &str,
        details: serde_json::Value,
        timeout_secs: u64,
        auto_approve: bool,
    ) -> Result<String> {
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.to_string(),
            description: description.to_string(),
            details,
            timeout_secs,
            auto_approve,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
        };
        let id = request.id.clone();
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut requests = self.load();
        requests.insert(id.clone(), request);
        self.persist(&requests)?;
        tracing::info!("🔐 Approval requested: {action} ({id})");
        Ok(id)
    }

    /// Explicitly resolve a pending request. Errors if the request is
    /// unknown or already terminal (including timed out).
    pub fn resolve(&self, id: &str, approve: bool) -> Result<ApprovalStatus> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut requests = self.load();
        let request = requests
            .get_mut(id)
            .ok_or_else(|| VigilError::NotFound(format!("approval {id}")))?;
        Self::apply_timeout(request);
        if request.status.is_terminal() {
            return Err(VigilError::InvalidState(format!(
                "approval {id} already {}",
                request.status.as_str()
            )));
        }
        request.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        request.resolved_at = Some(Utc::now());
        let status = request.status;
        self.persist(&requests)?;
        tracing::info!("🔐 Approval {id} resolved: {}", status.as_str());
        Ok(status)
    }

    /// Non-blocking status check. Applies the timeout transition if due.
    pub fn check_approval(&self, id: &str) -> Result<ApprovalStatus> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut requests = self.load();
        let request = requests
            .get_mut(id)
            .ok_or_else(|| VigilError::NotFound(format!("approval {id}")))?;
        let transitioned = Self::apply_timeout(request);
        let status = request.status;
        if transitioned {
            self.persist(&requests)?;
        }
        Ok(status)
    }

    /// Block until the request is terminal, re-checking at the configured
    /// poll interval. Bounded by the request's own timeout, which resolves
    /// it deterministically even with no operator around.
    pub async fn wait_for_approval(&self, id: &str) -> Result<ApprovalStatus> {
        loop {
            let status = self.check_approval(id)?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// All requests still pending, oldest first.
    pub fn pending(&self) -> Result<Vec<ApprovalRequest>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut requests = self.load();
        let mut transitioned = false;
        for request in requests.values_mut() {
            transitioned |= Self::apply_timeout(request);
        }
        if transitioned {
            self.persist(&requests)?;
        }
        let mut pending: Vec<ApprovalRequest> = requests
            .into_values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        Ok(pending)
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load().remove(id)
    }

    /// Drop terminal requests resolved more than `max_age` ago. Returns how
    /// many were removed.
    pub fn cleanup_old(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut requests = self.load();
        let before = requests.len();
        requests.retain(|_, r| {
            !r.status.is_terminal() || r.resolved_at.map(|t| t > cutoff).unwrap_or(true)
        });
        let removed = before - requests.len();
        if removed > 0 {
            self.persist(&requests)?;
            tracing::debug!("🧹 Removed {removed} old approval request(s)");
        }
        Ok(removed)
    }

    /// Timeout transition: pending + elapsed -> approved/expired.
    fn apply_timeout(request: &mut ApprovalRequest) -> bool {
        if request.status != ApprovalStatus::Pending || !request.timed_out(Utc::now()) {
            return false;
        }
        request.status = if request.auto_approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Expired
        };
        request.resolved_at = Some(Utc::now());
        tracing::info!(
            "⏳ Approval {} timed out -> {}",
            request.id,
            request.status.as_str()
        );
        true
    }

    fn persist(&self, requests: &HashMap<String, ApprovalRequest>) -> Result<()> {
        let json = serde_json::to_string_pretty(requests)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| VigilError::Store(format!("approval store rename failed: {e}")))?;
        Ok(())
    }
}
