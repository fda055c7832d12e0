use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use peersync_core::{
    CoordinationBackend, Operation, RemoteSnapshotMetadata, SyncConfig, SyncError, SyncStrategy,
};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use crate::merger::DatabaseMerger;
use crate::tracker::OperationTracker;

/// Where a sync cycle currently stands, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    IntentRegistered,
    ElectionPending,
    Leader,
    NotLeader,
    Downloading,
    Merging,
    Uploading,
    Finalizing,
}

/// How a sync attempt ended. All variants are successful outcomes; failures
/// surface as `SyncError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This instance led a full cycle.
    Completed { downloaded: bool, uploaded: bool },
    /// Another instance holds leadership and will sync on our behalf.
    NotLeader,
    /// A sync was already in flight in this process; the request coalesced.
    Skipped,
    /// `local_only` strategy: nothing to coordinate.
    LocalOnly,
}

/// Releases leadership (and the intent marker) exactly once per cycle.
///
/// The normal path calls `release` explicitly; a panic between acquisition
/// and release falls back to a spawned release so the external lock is
/// never silently abandoned.
struct LeadershipGuard {
    backend: Arc<dyn CoordinationBackend>,
    released: bool,
}

impl LeadershipGuard {
    fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            backend,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        self.backend.release_leadership().await;
    }
}

impl Drop for LeadershipGuard {
    fn drop(&mut self) {
        if !self.released {
            let backend = self.backend.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { backend.release_leadership().await });
            }
        }
    }
}

/// Orchestrates the end-to-end sync protocol over one coordination backend,
/// one operation tracker, and one merger.
///
/// One cycle: register intent, elect (bounded wait), and as leader run
/// change-check, conditional download, merge of pending operations,
/// conditional upload, and an atomic local-cache replacement. Election
/// timing out is success: another instance is syncing. Within a process at
/// most one cycle runs at a time; concurrent requests coalesce.
pub struct LeaderElectionSyncManager {
    config: SyncConfig,
    backend: Arc<dyn CoordinationBackend>,
    tracker: Arc<OperationTracker>,
    merger: DatabaseMerger,
    phase: Mutex<SyncPhase>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    in_flight: AsyncMutex<()>,
}

impl LeaderElectionSyncManager {
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn CoordinationBackend>,
        tracker: Arc<OperationTracker>,
    ) -> Self {
        let merger = DatabaseMerger::new(
            config.expected_tables.clone(),
            config.schema_sql.clone(),
        );
        Self {
            config,
            backend,
            tracker,
            merger,
            phase: Mutex::new(SyncPhase::Idle),
            last_sync: Mutex::new(None),
            in_flight: AsyncMutex::new(()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap()
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap()
    }

    pub fn backend(&self) -> &Arc<dyn CoordinationBackend> {
        &self.backend
    }

    /// Run one sync attempt. `timeout` bounds the election wait, not the
    /// critical section: once leadership is acquired the cycle completes or
    /// fails explicitly, never abandoning the external lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync(&self, timeout: Duration, trigger: &str) -> Result<SyncOutcome, SyncError> {
        if self.config.strategy == SyncStrategy::LocalOnly {
            return Ok(SyncOutcome::LocalOnly);
        }

        let _permit = match self.in_flight.try_lock() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Sync already in flight; coalescing {} trigger", trigger);
                return Ok(SyncOutcome::Skipped);
            }
        };

        let result = self.run_cycle(timeout, trigger).await;
        self.set_phase(SyncPhase::Idle);
        result
    }

    async fn run_cycle(&self, timeout: Duration, trigger: &str) -> Result<SyncOutcome, SyncError> {
        self.backend.cleanup_stale(self.config.staleness).await;

        self.set_phase(SyncPhase::IntentRegistered);
        if !self.backend.register_intent(trigger).await? {
            return Err(SyncError::Unavailable(
                "Backend refused sync intent registration".into(),
            ));
        }

        let guard = LeadershipGuard::new(self.backend.clone());

        self.set_phase(SyncPhase::ElectionPending);
        let result = match self.backend.elect_leader(timeout).await {
            Err(e) => Err(e),
            Ok(false) => {
                self.set_phase(SyncPhase::NotLeader);
                debug!("Election timed out after {:?}; another instance is syncing", timeout);
                Ok(SyncOutcome::NotLeader)
            }
            Ok(true) => {
                self.set_phase(SyncPhase::Leader);
                self.leader_cycle().await
            }
        };

        guard.release().await;

        match &result {
            // Only a completed cycle verified or transferred a snapshot.
            Ok(SyncOutcome::Completed { .. }) => {
                *self.last_sync.lock().unwrap() = Some(Utc::now());
            }
            Ok(_) => {}
            Err(_) => {
                // Leave no half-merged working copy behind.
                let _ = std::fs::remove_file(self.work_path());
            }
        }
        result
    }

    /// The critical section, entered only while holding leadership.
    async fn leader_cycle(&self) -> Result<SyncOutcome, SyncError> {
        let last_meta = self.load_metadata();
        let (changed, observed) = self.backend.has_changed(last_meta.as_ref()).await;
        let pending = self.tracker.pending();
        // Operations logged after this point are not part of the cycle and
        // must survive it.
        let merged_through = pending.last().map(|op| op.sequence_id);

        if !changed && pending.is_empty() {
            self.set_phase(SyncPhase::Finalizing);
            debug!("Remote unchanged and no pending operations");
            return Ok(SyncOutcome::Completed {
                downloaded: false,
                uploaded: false,
            });
        }

        self.set_phase(SyncPhase::Downloading);
        let work = self.work_path();
        let downloaded = self.backend.download_database(&work).await?;

        if !downloaded {
            return self.bootstrap_upload().await;
        }

        // A malformed snapshot is repaired from configured DDL; if that is
        // impossible, the local cache becomes authoritative for this cycle.
        let mut local_authoritative = false;
        if let Err(e) = self.ensure_schema_blocking(&work).await {
            warn!(
                "Downloaded snapshot failed schema check ({}); uploading local cache as authoritative",
                e
            );
            tokio::fs::copy(&self.config.local_db_path, &work)
                .await
                .map_err(|e| SyncError::Io(format!("Failed to stage local cache: {}", e)))?;
            local_authoritative = true;
        }

        let uploaded = if local_authoritative {
            // The local cache already reflects every pending operation.
            self.set_phase(SyncPhase::Uploading);
            self.backend.upload_database(&work).await?;
            true
        } else if !pending.is_empty() {
            self.set_phase(SyncPhase::Merging);
            self.merge_blocking(&work, pending).await?;
            self.set_phase(SyncPhase::Uploading);
            self.backend.upload_database(&work).await?;
            true
        } else {
            // Remote changed under us with nothing local to contribute: the
            // downloaded snapshot simply becomes the new cache, unmodified.
            false
        };

        self.set_phase(SyncPhase::Finalizing);
        let meta = if uploaded {
            // Observe our own upload while still holding leadership so the
            // next cycle's change check compares against it.
            self.backend.has_changed(None).await.1
        } else {
            observed
        };
        self.store_metadata(meta.as_ref());

        tokio::fs::rename(&work, &self.config.local_db_path)
            .await
            .map_err(|e| SyncError::Io(format!("Failed to replace local cache: {}", e)))?;
        if let Some(through) = merged_through {
            self.tracker.clear_through(through);
        }

        Ok(SyncOutcome::Completed {
            downloaded: true,
            uploaded,
        })
    }

    /// No shared snapshot exists yet: publish the local cache as the first
    /// one. The cache already contains every pending operation's effect.
    async fn bootstrap_upload(&self) -> Result<SyncOutcome, SyncError> {
        if !self.config.local_db_path.exists() {
            self.set_phase(SyncPhase::Finalizing);
            debug!("Neither a shared snapshot nor a local cache exists yet");
            return Ok(SyncOutcome::Completed {
                downloaded: false,
                uploaded: false,
            });
        }

        // The cache file about to be uploaded reflects operations logged up
        // to now; anything logged during the upload must stay queued.
        let published_through = self.tracker.pending().last().map(|op| op.sequence_id);

        self.set_phase(SyncPhase::Uploading);
        self.backend
            .upload_database(&self.config.local_db_path)
            .await?;

        self.set_phase(SyncPhase::Finalizing);
        self.store_metadata(self.backend.has_changed(None).await.1.as_ref());
        if let Some(through) = published_through {
            self.tracker.clear_through(through);
        }
        Ok(SyncOutcome::Completed {
            downloaded: false,
            uploaded: true,
        })
    }

    fn work_path(&self) -> PathBuf {
        self.config.local_db_path.with_extension("sync.tmp")
    }

    fn load_metadata(&self) -> Option<RemoteSnapshotMetadata> {
        let bytes = std::fs::read(&self.config.metadata_path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn store_metadata(&self, meta: Option<&RemoteSnapshotMetadata>) {
        match meta {
            Some(meta) => match serde_json::to_vec_pretty(meta) {
                Ok(body) => {
                    if let Err(e) = std::fs::write(&self.config.metadata_path, body) {
                        warn!("Failed to persist snapshot metadata: {}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize snapshot metadata: {}", e),
            },
            None => {
                let _ = std::fs::remove_file(&self.config.metadata_path);
            }
        }
    }

    async fn ensure_schema_blocking(&self, target: &std::path::Path) -> Result<(), SyncError> {
        let merger = self.merger.clone();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || merger.ensure_schema(&target))
            .await
            .map_err(|e| SyncError::Schema(format!("Schema task panicked: {}", e)))?
    }

    async fn merge_blocking(
        &self,
        target: &std::path::Path,
        operations: Vec<Operation>,
    ) -> Result<(), SyncError> {
        let merger = self.merger.clone();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || merger.merge_operations(&target, &operations))
            .await
            .map_err(|e| SyncError::Merge(format!("Merge task panicked: {}", e)))?
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap() = phase;
    }
}
