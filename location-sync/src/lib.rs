pub mod config;
pub mod connector;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod publisher;
pub mod reconciler;
pub mod repository;
pub mod scheduler;
pub mod sync;
pub mod telemetry;
pub mod token;

#[cfg(test)]
mod proptests;

pub use config::LocationSyncConfig;
pub use error::{LocationSyncError, LocationSyncResult};
pub use scheduler::SyncScheduler;
pub use sync::{LocationSyncService, SyncReport};
