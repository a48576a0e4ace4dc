//! Incremental filesystem service: storages multiplexed onto incfs mounts,
//! data loader lifecycle management and read health monitoring.

pub mod archive;
pub mod clock;
pub mod config;
pub mod constants;
pub mod control;
pub mod data_loader;
pub mod error;
pub mod fs;
pub mod incfs;
pub mod jobs;
pub mod loader;
pub mod mount;
pub mod mounter;
pub mod path;
pub mod permissions;
pub mod records;
pub mod registry;
pub mod service;
pub mod types;

// Fakes for the injected collaborators (only compiled during tests)
#[cfg(test)]
mod testing;

pub use config::{ServiceConfig, load_config};
pub use error::{IncrementalError, Result};
pub use service::{IncrementalService, IncrementalServiceConnector, ServiceDeps};
