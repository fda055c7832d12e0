use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use peersync_core::{
    CoordinationBackend, LeaderClaim, RemoteSnapshotMetadata, SyncError, SyncIntent,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

/// Fixed logical name of the shared snapshot.
const SHARED_DB: &str = "shared.db";
/// Subdirectory holding coordination artifacts.
const COORD_DIR: &str = "coordination";
/// Well-known lock file contended for leadership.
const LOCK_FILE: &str = "leader.lock";
/// Who/when record written by the winner for observability.
const LEADER_RECORD: &str = "leader.json";

/// Coordination backend over a shared filesystem directory.
///
/// Leadership is an exclusive OS advisory lock on `coordination/leader.lock`
/// (flock on Unix, LockFile on Windows), attempted non-blocking and polled
/// until acquired or timeout. A crashed leader's lock is released by the OS
/// when its descriptors close; the leftover who/when record and intent
/// markers are reclaimed by `cleanup_stale` via a process-liveness check.
///
/// Layout under the shared directory:
/// `shared.db`, `shared.db.tmp-{instance}` (upload stages),
/// `coordination/leader.lock`, `coordination/leader.json`,
/// `coordination/intent-{instance}.json`.
pub struct LocalFileBackend {
    shared_dir: PathBuf,
    instance_id: String,
    poll_interval: Duration,
    /// Held while this instance is leader; dropping it releases the OS lock
    lock_handle: Mutex<Option<File>>,
}

impl std::fmt::Debug for LocalFileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileBackend")
            .field("shared_dir", &self.shared_dir)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl LocalFileBackend {
    /// Create a backend rooted at `shared_dir` with a fresh instance id.
    pub fn new(shared_dir: impl AsRef<Path>, poll_interval: Duration) -> Self {
        Self {
            shared_dir: shared_dir.as_ref().to_path_buf(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            poll_interval,
            lock_handle: Mutex::new(None),
        }
    }

    fn coord_dir(&self) -> PathBuf {
        self.shared_dir.join(COORD_DIR)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.shared_dir.join(SHARED_DB)
    }

    fn stage_path(&self) -> PathBuf {
        self.shared_dir
            .join(format!("{}.tmp-{}", SHARED_DB, self.instance_id))
    }

    fn intent_path(&self) -> PathBuf {
        self.coord_dir()
            .join(format!("intent-{}.json", self.instance_id))
    }

    fn ensure_coord_dir(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(self.coord_dir()).map_err(|e| {
            SyncError::Io(format!(
                "Failed to create coordination dir {}: {}",
                self.coord_dir().display(),
                e
            ))
        })
    }

    /// Single non-blocking attempt at the leadership lock.
    fn try_acquire_lock(&self) -> Result<bool, SyncError> {
        let path = self.coord_dir().join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SyncError::Lock(format!("Failed to open lock file: {}", e)))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut handle = self.lock_handle.lock().unwrap();
                *handle = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(SyncError::Lock(format!("Failed to acquire lock: {}", e))),
        }
    }

    fn write_leader_record(&self) {
        let claim = LeaderClaim {
            instance_id: self.instance_id.clone(),
            elected_at: chrono::Utc::now(),
            process_id: std::process::id(),
        };
        let path = self.coord_dir().join(LEADER_RECORD);
        match serde_json::to_vec_pretty(&claim) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    warn!("Failed to write leader record {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize leader record: {}", e),
        }
    }

    fn snapshot_metadata(&self) -> Option<RemoteSnapshotMetadata> {
        let meta = std::fs::metadata(self.snapshot_path()).ok()?;
        // Nanosecond mtime: snapshot sizes often stay identical across
        // small row changes, so coarse timestamps would miss updates.
        let modified_at = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64);
        Some(RemoteSnapshotMetadata {
            version_token: None,
            modified_at,
            size: meta.len(),
        })
    }

    /// Whether a marker body belongs to a peer that is gone: dead process,
    /// or unparseable content.
    fn marker_abandoned(body: &[u8]) -> bool {
        match serde_json::from_slice::<SyncIntent>(body) {
            Ok(intent) => !process_alive(intent.process_id),
            Err(_) => match serde_json::from_slice::<LeaderClaim>(body) {
                Ok(claim) => !process_alive(claim.process_id),
                Err(_) => true,
            },
        }
    }
}

#[async_trait]
impl CoordinationBackend for LocalFileBackend {
    fn backend_name(&self) -> &'static str {
        "local_file"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_available(&self) -> bool {
        self.ensure_coord_dir().is_ok()
    }

    #[instrument(skip(self), level = "debug")]
    async fn register_intent(&self, operation_type: &str) -> Result<bool, SyncError> {
        self.ensure_coord_dir()?;
        let intent = SyncIntent {
            instance_id: self.instance_id.clone(),
            operation_type: operation_type.to_string(),
            timestamp: chrono::Utc::now(),
            process_id: std::process::id(),
        };
        let body = serde_json::to_vec_pretty(&intent)
            .map_err(|e| SyncError::Serialization(format!("Failed to serialize intent: {}", e)))?;
        std::fs::write(self.intent_path(), body)
            .map_err(|e| SyncError::Io(format!("Failed to write intent marker: {}", e)))?;
        debug!("Registered sync intent for {}", self.instance_id);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn elect_leader(&self, timeout: Duration) -> Result<bool, SyncError> {
        // Re-entrant: already holding the lock counts as elected.
        if self.lock_handle.lock().unwrap().is_some() {
            return Ok(true);
        }
        self.ensure_coord_dir()?;

        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire_lock()? {
                self.write_leader_record();
                debug!("Instance {} acquired leadership", self.instance_id);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!("Leadership held elsewhere, timed out after {:?}", timeout);
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.poll_interval.min(remaining)).await;
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn download_database(&self, dest: &Path) -> Result<bool, SyncError> {
        let src = self.snapshot_path();
        if !src.exists() {
            debug!("No shared snapshot yet, nothing to download");
            return Ok(false);
        }

        // Stage next to the destination so readers of `dest` only ever see
        // the old or the complete new file.
        let tmp = dest.with_extension("download.tmp");
        tokio::fs::copy(&src, &tmp).await.map_err(|e| {
            SyncError::Download(format!("Failed to copy shared snapshot: {}", e))
        })?;
        tokio::fs::rename(&tmp, dest).await.map_err(|e| {
            SyncError::Download(format!("Failed to finalize download: {}", e))
        })?;
        debug!("Downloaded shared snapshot to {}", dest.display());
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn upload_database(&self, src: &Path) -> Result<(), SyncError> {
        let stage = self.stage_path();
        tokio::fs::copy(src, &stage)
            .await
            .map_err(|e| SyncError::Upload(format!("Failed to stage snapshot: {}", e)))?;
        tokio::fs::rename(&stage, self.snapshot_path())
            .await
            .map_err(|e| SyncError::Upload(format!("Failed to publish snapshot: {}", e)))?;
        debug!("Published shared snapshot from {}", src.display());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_leadership(&self) {
        if let Some(file) = self.lock_handle.lock().unwrap().take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!("Failed to unlock leader lock: {}", e);
            }
            let record = self.coord_dir().join(LEADER_RECORD);
            // Only remove the record if it is still ours.
            let ours = std::fs::read(&record)
                .ok()
                .and_then(|b| serde_json::from_slice::<LeaderClaim>(&b).ok())
                .map(|c| c.instance_id == self.instance_id)
                .unwrap_or(false);
            if ours {
                if let Err(e) = std::fs::remove_file(&record) {
                    warn!("Failed to remove leader record: {}", e);
                }
            }
            debug!("Instance {} released leadership", self.instance_id);
        }
        if let Err(e) = std::fs::remove_file(self.intent_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove intent marker: {}", e);
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn cleanup_stale(&self, max_age: Duration) {
        let coord = self.coord_dir();
        let entries = match std::fs::read_dir(&coord) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_marker = (name.starts_with("intent-") && name.ends_with(".json"))
                || name == LEADER_RECORD;
            if !is_marker || name == format!("intent-{}.json", self.instance_id) {
                continue;
            }
            let abandoned = std::fs::read(entry.path())
                .map(|body| Self::marker_abandoned(&body))
                .unwrap_or(false);
            if abandoned {
                debug!("Removing abandoned coordination marker {}", name);
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("Failed to remove stale marker {}: {}", name, e);
                }
            }
        }

        // Upload stages from crashed peers are reclaimed by age alone.
        if let Ok(entries) = std::fs::read_dir(&self.shared_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(&format!("{}.tmp-", SHARED_DB))
                    || name.ends_with(&self.instance_id)
                {
                    continue;
                }
                let expired = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if expired {
                    debug!("Removing abandoned upload stage {}", name);
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!("Failed to remove stale stage {}: {}", name, e);
                    }
                }
            }
        }
    }

    #[instrument(skip(self, last), level = "debug")]
    async fn has_changed(
        &self,
        last: Option<&RemoteSnapshotMetadata>,
    ) -> (bool, Option<RemoteSnapshotMetadata>) {
        let current = self.snapshot_metadata();
        match (last, &current) {
            (Some(last), Some(current)) => (last.differs_from(current), Some(current.clone())),
            // Missing either side: report changed, never miss an update.
            _ => (true, current),
        }
    }
}

/// Check whether a process is still running.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs only a liveness/permission check.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(pid as i32, 0) };
    // EPERM means the process exists but belongs to someone else.
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a liveness primitive, treat peers as alive and rely on age-based
/// cleanup of their upload stages.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (LocalFileBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalFileBackend::new(dir.path(), Duration::from_millis(10));
        (backend, dir)
    }

    #[tokio::test]
    async fn election_is_exclusive_between_instances() {
        let (first, dir) = setup();
        let second = LocalFileBackend::new(dir.path(), Duration::from_millis(10));

        assert!(first.elect_leader(Duration::from_millis(100)).await.unwrap());
        // Re-entrant for the holder.
        assert!(first.elect_leader(Duration::from_millis(100)).await.unwrap());
        // Bounded wait for the loser.
        assert!(!second.elect_leader(Duration::from_millis(100)).await.unwrap());

        first.release_leadership().await;
        assert!(second.elect_leader(Duration::from_millis(100)).await.unwrap());
        second.release_leadership().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_leader_under_contention() {
        let dir = TempDir::new().unwrap();
        let mut handles = vec![];
        for _ in 0..8 {
            let backend = Arc::new(LocalFileBackend::new(dir.path(), Duration::from_millis(5)));
            handles.push(tokio::spawn(async move {
                backend.elect_leader(Duration::from_millis(50)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn download_is_a_noop_before_bootstrap() {
        let (backend, dir) = setup();
        let dest = dir.path().join("cache.db");
        assert!(!backend.download_database(&dest).await.unwrap());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (backend, dir) = setup();
        let src = dir.path().join("cache.db");
        std::fs::write(&src, b"snapshot-v1").unwrap();

        backend.upload_database(&src).await.unwrap();
        // No stage left behind under a temporary name.
        assert!(!backend.stage_path().exists());

        let dest = dir.path().join("other.db");
        assert!(backend.download_database(&dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"snapshot-v1");
    }

    #[tokio::test]
    async fn change_detection_is_conservative() {
        let (backend, dir) = setup();

        // No snapshot at all: changed.
        let (changed, meta) = backend.has_changed(None).await;
        assert!(changed);
        assert!(meta.is_none());

        let src = dir.path().join("cache.db");
        std::fs::write(&src, b"snapshot-v1").unwrap();
        backend.upload_database(&src).await.unwrap();

        // No prior metadata: changed.
        let (changed, meta) = backend.has_changed(None).await;
        assert!(changed);
        let meta = meta.unwrap();
        assert_eq!(meta.size, 11);

        // Same metadata: unchanged.
        let (changed, _) = backend.has_changed(Some(&meta)).await;
        assert!(!changed);

        // Different size: changed.
        std::fs::write(&src, b"snapshot-v2-longer").unwrap();
        backend.upload_database(&src).await.unwrap();
        let (changed, _) = backend.has_changed(Some(&meta)).await;
        assert!(changed);
    }

    #[tokio::test]
    async fn cleanup_removes_markers_of_dead_peers() {
        let (backend, dir) = setup();
        backend.register_intent("idle").await.unwrap();

        // A peer marker with a process id no live process can own.
        let dead = SyncIntent {
            instance_id: "peer".to_string(),
            operation_type: "manual".to_string(),
            timestamp: chrono::Utc::now(),
            process_id: 999_999_999,
        };
        let peer_path = dir.path().join(COORD_DIR).join("intent-peer.json");
        std::fs::write(&peer_path, serde_json::to_vec(&dead).unwrap()).unwrap();

        backend.cleanup_stale(Duration::from_secs(600)).await;
        assert!(!peer_path.exists());
        // Our own live intent survives.
        assert!(backend.intent_path().exists());
        backend.release_leadership().await;
        assert!(!backend.intent_path().exists());
    }

    #[tokio::test]
    async fn stale_leader_record_is_reclaimed() {
        let (backend, dir) = setup();
        let record = dir.path().join(COORD_DIR).join(LEADER_RECORD);
        std::fs::create_dir_all(dir.path().join(COORD_DIR)).unwrap();
        let claim = LeaderClaim {
            instance_id: "crashed".to_string(),
            elected_at: chrono::Utc::now(),
            process_id: 999_999_999,
        };
        std::fs::write(&record, serde_json::to_vec(&claim).unwrap()).unwrap();

        backend.cleanup_stale(Duration::from_secs(600)).await;
        assert!(!record.exists());
        // The crashed peer's OS lock died with it, so election succeeds.
        assert!(backend.elect_leader(Duration::from_millis(100)).await.unwrap());
        backend.release_leadership().await;
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (backend, _dir) = setup();
        assert!(backend.elect_leader(Duration::from_millis(100)).await.unwrap());
        backend.release_leadership().await;
        backend.release_leadership().await;
    }
}
