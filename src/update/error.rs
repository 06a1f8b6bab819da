use thiserror::Error;
use uuid::Uuid;

/// Rejections returned by the coordinator before an update starts.
///
/// Pipeline failures (integrity, backup, apply, verification, rollback) are
/// not errors: they are recorded on the `UpdateRecord` as an
/// `UpdateFailure` with its terminal status.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update {active} on '{blocking}' is in progress, '{component}' cannot be updated until it finishes")]
    UpdateInProgress {
        component: String,
        blocking: String,
        active: Uuid,
    },

    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("component '{0}' is already registered")]
    DuplicateComponent(String),

    #[error("no staged update pending for '{0}'")]
    NoPendingUpdate(String),

    #[error("pending update store failed: {0:#}")]
    PendingStore(anyhow::Error),
}
