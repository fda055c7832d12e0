use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Sync strategy selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// No coordination: every sync trigger is a successful no-op.
    LocalOnly,
    /// Leader-election sync through a shared coordination medium.
    LeaderElection,
}

/// Which coordination medium to use, with its medium-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Shared filesystem directory (local disk or network mount).
    LocalFile { shared_dir: PathBuf },
    /// S3-compatible object store. Credentials come from the ambient AWS
    /// credential chain; `endpoint` overrides for R2/minio-style stores.
    CloudObject {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
    },
}

/// Complete configuration for the sync engine.
///
/// Constructed explicitly by the application and injected into the manager;
/// nothing in the engine reads global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    pub backend: BackendConfig,

    /// Path of the local cache database
    pub local_db_path: PathBuf,
    /// Where the last-seen remote snapshot metadata is persisted
    pub metadata_path: PathBuf,

    /// Age past which coordination artifacts from peers are presumed
    /// abandoned and safe to remove
    #[serde(with = "duration_secs", default = "defaults::staleness")]
    pub staleness: Duration,
    /// Cloud election settle interval between candidate upload and re-list
    #[serde(with = "duration_millis", default = "defaults::settle")]
    pub settle: Duration,
    /// Local election lock poll interval
    #[serde(with = "duration_millis", default = "defaults::poll_interval")]
    pub poll_interval: Duration,

    #[serde(with = "duration_secs", default = "defaults::manual_timeout")]
    pub manual_timeout: Duration,
    #[serde(with = "duration_secs", default = "defaults::idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_secs", default = "defaults::shutdown_timeout")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration_secs", default = "defaults::periodic_interval")]
    pub periodic_interval: Duration,

    /// DDL executed to create missing structure in a downloaded snapshot
    #[serde(default)]
    pub schema_sql: Option<String>,
    /// Tables the merger expects to find in a well-formed snapshot
    #[serde(default)]
    pub expected_tables: Vec<String>,
}

mod defaults {
    use std::time::Duration;

    pub fn staleness() -> Duration {
        Duration::from_secs(600)
    }
    pub fn settle() -> Duration {
        Duration::from_millis(1500)
    }
    pub fn poll_interval() -> Duration {
        Duration::from_millis(250)
    }
    pub fn manual_timeout() -> Duration {
        Duration::from_secs(120)
    }
    pub fn idle_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn periodic_interval() -> Duration {
        Duration::from_secs(300)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl SyncConfig {
    /// Build a configuration with default timings for the given strategy,
    /// backend, and local cache path. The metadata file lands next to the
    /// cache as `sync-metadata.json`.
    pub fn new(
        strategy: SyncStrategy,
        backend: BackendConfig,
        local_db_path: impl Into<PathBuf>,
    ) -> Self {
        let local_db_path = local_db_path.into();
        let metadata_path = local_db_path
            .parent()
            .map(|p| p.join("sync-metadata.json"))
            .unwrap_or_else(|| PathBuf::from("sync-metadata.json"));
        Self {
            strategy,
            backend,
            local_db_path,
            metadata_path,
            staleness: defaults::staleness(),
            settle: defaults::settle(),
            poll_interval: defaults::poll_interval(),
            manual_timeout: defaults::manual_timeout(),
            idle_timeout: defaults::idle_timeout(),
            shutdown_timeout: defaults::shutdown_timeout(),
            periodic_interval: defaults::periodic_interval(),
            schema_sql: None,
            expected_tables: Vec::new(),
        }
    }

    /// Validate internal consistency before constructing the engine.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.local_db_path.as_os_str().is_empty() {
            return Err(SyncError::Config("local_db_path must not be empty".into()));
        }
        if self.staleness.is_zero() {
            return Err(SyncError::Config("staleness must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("poll_interval must be non-zero".into()));
        }
        match &self.backend {
            BackendConfig::LocalFile { shared_dir } => {
                if shared_dir.as_os_str().is_empty() {
                    return Err(SyncError::Config("shared_dir must not be empty".into()));
                }
            }
            BackendConfig::CloudObject { bucket, .. } => {
                if bucket.is_empty() {
                    return Err(SyncError::Config("bucket must not be empty".into()));
                }
            }
        }
        Ok(())
    }
}
