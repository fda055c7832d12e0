//! Core traits and types for peersync coordination backends.
//!
//! This crate defines the abstractions shared between the local-file and
//! cloud-object coordination implementations:
//! - `CoordinationBackend`: intent registration, leader election, snapshot
//!   transfer, and stale-artifact cleanup
//! - `Operation`: row-level change records logged between syncs
//! - `RemoteSnapshotMetadata`: cheap change-detection state persisted locally
//! - `SyncConfig`: typed configuration selecting strategy and backend

mod backend;
mod config;
mod error;
mod operation;

pub use backend::{
    CoordinationBackend, LeaderClaim, RemoteSnapshotMetadata, SyncIntent,
};
pub use config::{BackendConfig, SyncConfig, SyncStrategy};
pub use error::SyncError;
pub use operation::{Operation, OperationKind};
