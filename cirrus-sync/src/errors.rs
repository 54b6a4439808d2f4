//! Error types for sync operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] cirrus_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient transport failure; the affected tracker reverts to
    /// not-started and the next cycle retries it
    #[error("Network error: {0}")]
    Network(String),

    /// Required migration data absent or a queue is internally inconsistent;
    /// aborts the current cycle without partial commit
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// A programming-invariant violation: never expected in correct
    /// operation (second concurrent transfer, conflict resolved twice, ...)
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Master-version resets kept invalidating work past the configured cap
    #[error("Gave up after {0} master version resets")]
    RetriesExhausted(u32),

    #[error("Unknown sharing group: {0}")]
    UnknownSharingGroup(uuid::Uuid),
}

impl SyncError {
    /// Transient errors leave trackers retryable; everything else aborts
    /// the cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
