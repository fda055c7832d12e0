use std::path::{Path, PathBuf};

use async_trait::async_trait;
use peersync_core::SyncError;
use tracing::{debug, warn};

/// How many stamped snapshots of each granularity to keep.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub daily: usize,
    pub monthly: usize,
    pub yearly: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            monthly: 12,
            yearly: 5,
        }
    }
}

/// Retention-policy snapshotting of the authoritative database, independent
/// of the sync cycle. The application invokes it on its own schedule.
#[async_trait]
pub trait BackupManager: Send + Sync {
    /// Snapshot `snapshot` under the current retention stamps. Returns the
    /// path of the daily copy when one was newly created, `None` when all
    /// stamps for the current date already exist.
    async fn run_backup(&self, snapshot: &Path) -> Result<Option<PathBuf>, SyncError>;
}

/// Filesystem backup manager: `daily/`, `monthly/`, and `yearly/`
/// subdirectories hold date-stamped copies, copy-if-absent per stamp,
/// pruned oldest-first beyond the configured keep counts.
#[derive(Debug)]
pub struct LocalBackupManager {
    root: PathBuf,
    policy: RetentionPolicy,
}

impl LocalBackupManager {
    pub fn new(root: impl AsRef<Path>, policy: RetentionPolicy) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            policy,
        }
    }

    /// Copy `snapshot` to `{root}/{tier}/backup-{stamp}.db` unless that
    /// stamp already exists, then prune the tier down to `keep` files.
    fn snapshot_tier(
        &self,
        snapshot: &Path,
        tier: &str,
        stamp: &str,
        keep: usize,
    ) -> Result<Option<PathBuf>, SyncError> {
        let dir = self.root.join(tier);
        std::fs::create_dir_all(&dir)
            .map_err(|e| SyncError::Io(format!("Failed to create backup dir: {}", e)))?;

        let target = dir.join(format!("backup-{}.db", stamp));
        let created = if target.exists() {
            None
        } else {
            std::fs::copy(snapshot, &target)
                .map_err(|e| SyncError::Io(format!("Failed to copy backup: {}", e)))?;
            debug!("Created {} backup {}", tier, target.display());
            Some(target)
        };

        self.prune(&dir, keep);
        Ok(created)
    }

    /// Remove the oldest stamped files beyond `keep`. Stamps sort
    /// lexicographically in date order, so name order is age order.
    fn prune(&self, dir: &Path, keep: usize) {
        let mut names: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("backup-"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => return,
        };
        names.sort();
        while names.len() > keep {
            let oldest = names.remove(0);
            debug!("Pruning expired backup {}", oldest.display());
            if let Err(e) = std::fs::remove_file(&oldest) {
                warn!("Failed to prune backup {}: {}", oldest.display(), e);
            }
        }
    }
}

#[async_trait]
impl BackupManager for LocalBackupManager {
    async fn run_backup(&self, snapshot: &Path) -> Result<Option<PathBuf>, SyncError> {
        let now = chrono::Utc::now();
        let daily = self.snapshot_tier(
            snapshot,
            "daily",
            &now.format("%Y-%m-%d").to_string(),
            self.policy.daily,
        )?;
        self.snapshot_tier(
            snapshot,
            "monthly",
            &now.format("%Y-%m").to_string(),
            self.policy.monthly,
        )?;
        self.snapshot_tier(
            snapshot,
            "yearly",
            &now.format("%Y").to_string(),
            self.policy.yearly,
        )?;
        Ok(daily)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LocalBackupManager, TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("cache.db");
        std::fs::write(&db, b"data").unwrap();
        let manager = LocalBackupManager::new(dir.path().join("backups"), RetentionPolicy::default());
        (manager, dir, db)
    }

    #[tokio::test]
    async fn creates_all_three_tiers() {
        let (manager, dir, db) = setup();
        let created = manager.run_backup(&db).await.unwrap();
        assert!(created.is_some());
        for tier in ["daily", "monthly", "yearly"] {
            let entries: Vec<_> = std::fs::read_dir(dir.path().join("backups").join(tier))
                .unwrap()
                .flatten()
                .collect();
            assert_eq!(entries.len(), 1, "expected one {} backup", tier);
        }
    }

    #[tokio::test]
    async fn same_day_backup_is_a_noop() {
        let (manager, _dir, db) = setup();
        assert!(manager.run_backup(&db).await.unwrap().is_some());
        assert!(manager.run_backup(&db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prunes_beyond_keep_count() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("cache.db");
        std::fs::write(&db, b"data").unwrap();
        let root = dir.path().join("backups");
        let manager = LocalBackupManager::new(
            &root,
            RetentionPolicy {
                daily: 2,
                monthly: 12,
                yearly: 5,
            },
        );

        // Seed old stamped files; lexicographic order is age order.
        std::fs::create_dir_all(root.join("daily")).unwrap();
        std::fs::write(root.join("daily/backup-2020-01-01.db"), b"old").unwrap();
        std::fs::write(root.join("daily/backup-2020-01-02.db"), b"old").unwrap();

        manager.run_backup(&db).await.unwrap();
        let mut names: Vec<String> = std::fs::read_dir(root.join("daily"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        // The very oldest was pruned.
        assert_eq!(names[0], "backup-2020-01-02.db");
    }
}
