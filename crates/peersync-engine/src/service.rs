use std::sync::Arc;

use chrono::{DateTime, Utc};
use peersync_cloud::CloudObjectBackend;
use peersync_core::{
    BackendConfig, CoordinationBackend, OperationKind, SyncConfig, SyncError, SyncStrategy,
};
use peersync_local::LocalFileBackend;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::manager::{LeaderElectionSyncManager, SyncOutcome, SyncPhase};
use crate::scheduler::SyncScheduler;
use crate::tracker::OperationTracker;

/// Snapshot of the engine's state for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub strategy: SyncStrategy,
    pub backend: &'static str,
    pub phase: SyncPhase,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_operations: usize,
    pub coordination_available: bool,
}

/// Construct the coordination backend selected by typed configuration.
/// Called once at startup; nothing is looked up globally afterwards.
pub async fn backend_from_config(config: &SyncConfig) -> Arc<dyn CoordinationBackend> {
    match &config.backend {
        BackendConfig::LocalFile { shared_dir } => {
            Arc::new(LocalFileBackend::new(shared_dir, config.poll_interval))
        }
        BackendConfig::CloudObject {
            bucket,
            prefix,
            endpoint,
            region,
        } => Arc::new(
            CloudObjectBackend::connect(
                bucket.clone(),
                prefix.clone(),
                endpoint.clone(),
                region.clone(),
                config.settle,
                config.staleness,
            )
            .await,
        ),
    }
}

/// The interface the application layer consumes: operation tracking after
/// every committed local write, the four sync triggers, and polled status.
pub struct SyncService {
    config: SyncConfig,
    tracker: Arc<OperationTracker>,
    manager: Arc<LeaderElectionSyncManager>,
    scheduler: SyncScheduler,
}

impl SyncService {
    /// Build a service with a backend constructed from the configuration.
    pub async fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let backend = backend_from_config(&config).await;
        Self::new(config, backend)
    }

    /// Build a service around an explicitly injected backend.
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn CoordinationBackend>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let tracker = Arc::new(OperationTracker::new());
        let manager = Arc::new(LeaderElectionSyncManager::new(
            config.clone(),
            backend,
            tracker.clone(),
        ));
        let scheduler = SyncScheduler::new(
            manager.clone(),
            tracker.clone(),
            config.manual_timeout,
            config.idle_timeout,
            config.shutdown_timeout,
            config.periodic_interval,
        );
        Ok(Self {
            config,
            tracker,
            manager,
            scheduler,
        })
    }

    /// Record a committed local write for the next sync cycle.
    pub fn track_operation(
        &self,
        kind: OperationKind,
        table: &str,
        local_id: i64,
        payload: Map<String, Value>,
    ) {
        self.tracker.log(kind, table, local_id, payload);
    }

    pub async fn trigger_manual_sync(&self) -> Result<SyncOutcome, SyncError> {
        self.scheduler.manual().await
    }

    pub async fn trigger_idle_sync(&self) -> bool {
        self.scheduler.idle().await
    }

    pub async fn trigger_shutdown_sync(&self) -> bool {
        self.scheduler.shutdown().await
    }

    /// Run one periodic-style sync immediately, outside the spawned loop.
    pub async fn trigger_periodic_sync(&self) -> bool {
        self.scheduler.periodic().await
    }

    /// Spawn the periodic trigger loop; drop the handle to detach it.
    pub fn start_periodic_sync(&self) -> tokio::task::JoinHandle<()> {
        self.scheduler.spawn_periodic()
    }

    pub async fn status(&self) -> SyncStatus {
        let backend = self.manager.backend();
        SyncStatus {
            strategy: self.config.strategy,
            backend: backend.backend_name(),
            phase: self.manager.phase(),
            last_sync_time: self.manager.last_sync_time(),
            pending_operations: self.tracker.pending_count(),
            coordination_available: backend.is_available().await,
        }
    }
}
