use bcf_adapters::{AdapterError, SnapshotError};
use bcf_core::SyncStatus;
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for one sync. Every variant ends the job as `failed` with the
/// `Display` text stored verbatim.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed or empty snapshot; nothing in the catalog was touched.
    #[error("validation failed: {0}")]
    Validation(#[from] SnapshotError),
    /// Download or local read failed; nothing in the catalog was touched.
    #[error("transport failed: {0}")]
    Transport(#[from] AdapterError),
    /// The diff transaction rolled back as a whole.
    #[error("apply failed: {0}")]
    Apply(#[source] sqlx::Error),
    /// Only the in-flight chunk rolled back; earlier chunks stay committed.
    #[error("recompute failed: {0}")]
    Recompute(String),
    #[error("archiving snapshot failed: {0}")]
    Archive(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
    #[error("unknown sync job {0}")]
    UnknownJob(Uuid),
    #[error("sync job {id} is {status}; {action} not allowed")]
    InvalidJobState {
        id: Uuid,
        status: SyncStatus,
        action: &'static str,
    },
}

impl SyncError {
    /// True for failures that happen before any catalog mutation.
    pub fn is_pre_apply(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Transport(_) | Self::Archive(_)
        )
    }
}
