//! reaper: cleanup engine for leaked virtualization inventory
//!
//! Destroys stale VMs, prunes empty folders and resource pools leaf-first,
//! deletes volumes left behind by a lease and removes empty cluster
//! modules. The platform is reached through the async traits in
//! [`inventory`], [`volume`] and [`module`].

pub mod audit;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod inventory;
pub mod lease;
pub mod lister;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod module;
pub mod pruner;
pub mod task;
pub mod vm;
pub mod volume;

pub use audit::{ReapAuditLogger, create_audit_logger};
pub use cleanup::Reaper;
pub use config::{CleanupPlan, ReaperConfig};
pub use error::{AggregateError, ReapError, Result};
pub use http::{HttpConfig, HttpPlatform};
pub use lease::LeaseRunner;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryPlatform;
