//! Error taxonomy for the Vigil workspace.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Errors surfaced by Vigil components.
///
/// The taxonomy mirrors how failures are handled rather than where they
/// occur: configuration problems degrade a feature, store problems are
/// retried on the next flush/tick, provider problems skip a tick.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Bad or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Durable store (queue database, tracker file) failure.
    #[error("store error: {0}")]
    Store(String),

    /// A state provider is unavailable or returned garbage. The affected
    /// loop skips its tick; never fatal.
    #[error("provider '{0}' unavailable: {1}")]
    Provider(String, String),

    /// A referenced record (task, approval) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted against a record in the wrong state
    /// (e.g. resolving an already-resolved approval).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
