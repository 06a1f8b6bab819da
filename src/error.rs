use crate::message::ValidationError;
use crate::subscription::PatternError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned to callers of the message bus.
///
/// Handler failures are not part of this taxonomy: they are caught during
/// delivery, logged and counted in [`crate::BusStats`], and never reach the
/// publisher.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid subscription: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("message bus is unavailable")]
    BusUnavailable,

    #[error("message bus ingress queue is full (capacity {capacity})")]
    Backpressure { capacity: usize },

    #[error("request on '{topic}' timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
}

impl BusError {
    /// Publish rejections the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Backpressure { .. } | BusError::Timeout { .. })
    }
}
