use std::sync::Arc;
use std::time::Duration;

use peersync_core::SyncError;
use tracing::{debug, warn};

use crate::manager::{LeaderElectionSyncManager, SyncOutcome};
use crate::tracker::OperationTracker;

/// Trigger semantics over the manager.
///
/// Manual syncs always run (a verification round-trip even with nothing
/// pending) and surface their result. Idle and shutdown syncs run only when
/// operations are pending and fail silently; shutdown may briefly block the
/// caller up to its timeout and then proceeds regardless, since data safety
/// comes from operations remaining queued. The periodic loop re-arms a fixed
/// interval after each attempt completes, so the interval never drifts
/// against a slow attempt.
pub struct SyncScheduler {
    manager: Arc<LeaderElectionSyncManager>,
    tracker: Arc<OperationTracker>,
    manual_timeout: Duration,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
    periodic_interval: Duration,
}

impl SyncScheduler {
    pub fn new(
        manager: Arc<LeaderElectionSyncManager>,
        tracker: Arc<OperationTracker>,
        manual_timeout: Duration,
        idle_timeout: Duration,
        shutdown_timeout: Duration,
        periodic_interval: Duration,
    ) -> Self {
        Self {
            manager,
            tracker,
            manual_timeout,
            idle_timeout,
            shutdown_timeout,
            periodic_interval,
        }
    }

    /// User-requested sync: long timeout, runs even with zero pending
    /// operations, and reports explicit success or failure.
    pub async fn manual(&self) -> Result<SyncOutcome, SyncError> {
        self.manager.sync(self.manual_timeout, "manual").await
    }

    /// Idle-time sync: only worth an attempt when something is pending.
    /// Failures are logged and retried on a later trigger.
    pub async fn idle(&self) -> bool {
        if self.tracker.pending_count() == 0 {
            return true;
        }
        match self.manager.sync(self.idle_timeout, "idle").await {
            Ok(_) => true,
            Err(e) => {
                debug!("Idle sync failed, will retry on a later trigger: {}", e);
                false
            }
        }
    }

    /// Best-effort sync on shutdown. Blocks the caller up to the shutdown
    /// timeout; a failure leaves operations queued for the next start.
    pub async fn shutdown(&self) -> bool {
        if self.tracker.pending_count() == 0 {
            return true;
        }
        match self.manager.sync(self.shutdown_timeout, "shutdown").await {
            Ok(_) => true,
            Err(e) => {
                warn!("Shutdown sync failed; operations remain queued: {}", e);
                false
            }
        }
    }

    /// One periodic tick, also usable as a direct trigger. Failures are
    /// logged and retried next interval.
    pub async fn periodic(&self) -> bool {
        Self::periodic_tick(&self.manager, self.idle_timeout).await
    }

    /// Spawn the periodic loop. Each iteration sleeps the full interval
    /// after the previous attempt has completed, success or failure.
    pub fn spawn_periodic(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let interval = self.periodic_interval;
        let timeout = self.idle_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                Self::periodic_tick(&manager, timeout).await;
            }
        })
    }

    async fn periodic_tick(manager: &LeaderElectionSyncManager, timeout: Duration) -> bool {
        match manager.sync(timeout, "periodic").await {
            Ok(_) => true,
            Err(e) => {
                debug!("Periodic sync failed, retrying next interval: {}", e);
                false
            }
        }
    }
}
