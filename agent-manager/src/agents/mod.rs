//! Built-in agents shipped with the daemon.

pub mod audit;
pub mod hardware;
pub mod resource;
pub mod update;

pub use audit::AuditAgent;
pub use hardware::HardwareAgent;
pub use resource::{Allocation, ResourceAgent, ResourcePool};
pub use update::{DirectorySource, StaticSource, UpdateApplierAgent, UpdateProposerAgent, UpdateSource};
