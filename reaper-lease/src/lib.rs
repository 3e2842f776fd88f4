//! reaper-lease: client for the lease broker
//!
//! The broker hands out named resources of a type and tracks their state.
//! The reaper acquires `dirty` resources, cleans them and releases them as
//! `free`.

pub mod client;
pub mod error;
pub mod types;

pub use client::LeaseClient;
pub use error::{LeaseError, Result};
pub use types::{Metric, Resource, ResourceState, UserData};
