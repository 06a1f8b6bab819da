//! Topic patterns and the subscription registry.
//!
//! Patterns are dot-separated like topics. A `*` segment matches exactly one
//! topic segment and a `**` segment matches zero or more segments, so
//! `hardware.*` matches `hardware.detected` while `update.**` matches
//! `update`, `update.applied` and `update.failed.alert`.

mod pattern;
mod registry;

pub use pattern::{PatternError, TopicPattern};
pub use registry::{SubscriptionId, SubscriptionRegistry};

/// Handle returned by `subscribe`. Pass it back to `unsubscribe`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub subscriber: String,
    pub pattern: String,
}
