use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Marker body published when an instance wants to sync.
///
/// Ephemeral: removed when the election resolves or the intent goes stale.
/// The process id lets the local backend check peer liveness during cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncIntent {
    pub instance_id: String,
    pub operation_type: String,
    pub timestamp: DateTime<Utc>,
    pub process_id: u32,
}

/// Record written by the elected leader for observability and crash
/// recovery. At most one non-stale claim exists system-wide; a claim older
/// than the staleness threshold may be removed by any peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderClaim {
    pub instance_id: String,
    pub elected_at: DateTime<Utc>,
    pub process_id: u32,
}

/// Metadata snapshot of the shared database used for cheap change
/// comparison between syncs. Persisted locally as JSON.
///
/// `version_token` is an opaque store-provided identity (ETag for object
/// stores); when both sides carry one it takes precedence over size/mtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshotMetadata {
    /// Opaque version identity, when the medium provides one
    pub version_token: Option<String>,
    /// Last modification time, in the medium's native resolution. Only
    /// compared for equality, never across backends.
    pub modified_at: Option<i64>,
    /// Snapshot size in bytes
    pub size: u64,
}

impl RemoteSnapshotMetadata {
    /// Compare against a newer observation. Conservative: equality requires
    /// at least one field to positively match; token comparison wins when
    /// both sides have one.
    pub fn differs_from(&self, other: &RemoteSnapshotMetadata) -> bool {
        if let (Some(a), Some(b)) = (&self.version_token, &other.version_token) {
            return a != b;
        }
        self.size != other.size || self.modified_at != other.modified_at
    }
}

/// Coordination backend abstraction.
///
/// Implementations share one contract: the shared snapshot lives under a
/// fixed logical name, write access to it requires winning `elect_leader`,
/// uploads are atomic at the final name (no reader ever observes a partially
/// written snapshot), and `release_leadership` is idempotent and safe to call
/// on every exit path.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Short name for logs and status reporting.
    fn backend_name(&self) -> &'static str;

    /// Stable identifier of this instance within the coordination medium.
    fn instance_id(&self) -> &str;

    /// Probe environment, credentials, and connectivity.
    async fn is_available(&self) -> bool;

    /// Publish a marker of intent to sync. Returns `false` only when the
    /// backend cannot be reached.
    async fn register_intent(&self, operation_type: &str) -> Result<bool, SyncError>;

    /// Attempt to become leader, blocking up to `timeout`.
    ///
    /// `Ok(false)` is a normal outcome: another instance is syncing.
    async fn elect_leader(&self, timeout: Duration) -> Result<bool, SyncError>;

    /// Copy the shared snapshot to `dest`. Returns `Ok(false)` when no
    /// shared snapshot exists yet (bootstrap), without touching `dest`.
    async fn download_database(&self, dest: &Path) -> Result<bool, SyncError>;

    /// Publish `src` as the new shared snapshot. Stages under a temporary
    /// name and finalizes atomically.
    async fn upload_database(&self, src: &Path) -> Result<(), SyncError>;

    /// Remove this instance's intent/leader/lock artifacts. Idempotent;
    /// failures are logged, never surfaced.
    async fn release_leadership(&self);

    /// Remove abandoned intent/leader/temp artifacts older than `max_age`
    /// (or whose owning process is dead, where that can be checked).
    async fn cleanup_stale(&self, max_age: Duration);

    /// Cheap remote-change check. Conservative: reports changed whenever
    /// metadata is missing, unreadable, or uncertain. Returns the freshest
    /// observation alongside the verdict so callers can persist it.
    async fn has_changed(
        &self,
        last: Option<&RemoteSnapshotMetadata>,
    ) -> (bool, Option<RemoteSnapshotMetadata>);
}
