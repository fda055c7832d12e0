//! Leader-elected synchronization engine for locally cached SQLite databases.
//!
//! Applications log their row operations through [`OperationTracker`], and the
//! engine coordinates with peers through a [`CoordinationBackend`] (shared
//! directory or object store) to elect a single leader per cycle. The leader
//! downloads the shared snapshot, replays pending operations with
//! [`DatabaseMerger`], and publishes the merged result atomically.
//!
//! [`CoordinationBackend`]: peersync_core::CoordinationBackend

pub mod backup;
pub mod manager;
pub mod merger;
pub mod scheduler;
pub mod service;
pub mod tracker;

pub use backup::{BackupManager, LocalBackupManager, RetentionPolicy};
pub use manager::{LeaderElectionSyncManager, SyncOutcome, SyncPhase};
pub use merger::DatabaseMerger;
pub use scheduler::SyncScheduler;
pub use service::{backend_from_config, SyncService, SyncStatus};
pub use tracker::OperationTracker;

pub use peersync_core::{
    BackendConfig, CoordinationBackend, Operation, OperationKind, SyncConfig, SyncError,
    SyncStrategy,
};
