//! State snapshots — immutable views of the external world, one per tick.
//!
//! Concrete monitoring backends (calendar, email, open apps) live outside
//! this crate; they plug in through the [`StateProvider`] trait and return a
//! normalized, provider-tagged [`StateSnapshot`]. A provider that cannot
//! produce a snapshot returns an error and the scheduler skips that tick for
//! it — unavailability is never fatal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::{Result, VigilError};

/// An immutable, versioned key/value view of the external world at one
/// evaluation tick. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Which provider produced this snapshot.
    pub provider: String,
    /// Monotonic per-provider version (tick counter).
    pub version: u64,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Normalized provider data.
    pub data: serde_json::Value,
}

impl StateSnapshot {
    pub fn new(provider: &str, version: u64, data: serde_json::Value) -> Self {
        Self {
            provider: provider.to_string(),
            version,
            taken_at: Utc::now(),
            data,
        }
    }

    /// Convenience accessor into the snapshot data.
    pub fn get(&self, pointer: &str) -> Option<&serde_json::Value> {
        self.data.pointer(pointer)
    }
}

/// A pull-style source of external state.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Provider name used to tag snapshots and log skipped ticks.
    fn name(&self) -> &str;

    /// Produce a snapshot of the current external state.
    ///
    /// `Err` signals unavailability; the caller skips this tick.
    async fn pull(&self) -> Result<StateSnapshot>;
}

/// Provider that reads a normalized JSON state file maintained by an
/// external monitor process.
pub struct FileStateProvider {
    name: String,
    path: PathBuf,
    version: std::sync::atomic::AtomicU64,
}

impl FileStateProvider {
    pub fn new(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            version: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl StateProvider for FileStateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self) -> Result<StateSnapshot> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            VigilError::Provider(self.name.clone(), format!("cannot read state file: {e}"))
        })?;
        let data: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            VigilError::Provider(self.name.clone(), format!("malformed state file: {e}"))
        })?;
        let version = self
            .version
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        Ok(StateSnapshot::new(&self.name, version, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vigil-snap-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn file_provider_pulls_versioned_snapshots() {
        let path = temp_path("ok");
        std::fs::write(&path, r#"{"system": {"memory_percent": 91}}"#).unwrap();

        let provider = FileStateProvider::new("system", &path);
        let snap1 = provider.pull().await.unwrap();
        let snap2 = provider.pull().await.unwrap();

        assert_eq!(snap1.provider, "system");
        assert_eq!(snap1.version, 1);
        assert_eq!(snap2.version, 2);
        assert_eq!(
            snap1.get("/system/memory_percent").and_then(|v| v.as_u64()),
            Some(91)
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_file_is_unavailable_not_fatal() {
        let provider = FileStateProvider::new("ghost", &temp_path("missing"));
        let err = provider.pull().await.unwrap_err();
        assert!(matches!(err, VigilError::Provider(name, _) if name == "ghost"));
    }
}
