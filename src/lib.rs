// Message envelope and validation
pub mod message;

// Topic patterns and the subscription registry
pub mod subscription;

// Message bus (publish, subscribe, request/response)
pub mod bus;

// Bus error taxonomy
pub mod error;

// Component backups (store/restore/prune)
pub mod backup;

// Update/rollback coordinator
pub mod update;

// Synthetic trigger messages on fixed intervals
pub mod schedule;

// Pluggable decision policies
pub mod policy;

// Configuration (TOML + env overrides)
pub mod config;

pub use bus::{handler_fn, BusStats, DeliveryContext, DeliveryReceipt, MessageBus, MessageHandler};
pub use error::BusError;
pub use message::{Message, MessageKind, Priority};
pub use subscription::{SubscriptionHandle, SubscriptionId, TopicPattern};
