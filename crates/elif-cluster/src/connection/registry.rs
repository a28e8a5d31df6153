//! Connection registry and routing policy
//!
//! Holds the primary and the replicas, keeps a derived view of the replicas that
//! were healthy at the last recomputation, and picks the handle that serves a read
//! or a write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::handle::ConnectionHandle;
use crate::error::{ClusterError, ClusterResult};

/// Primary and replica handles of one cluster
pub struct ConnectionRegistry {
    primary: RwLock<Option<Arc<ConnectionHandle>>>,
    replicas: RwLock<Vec<Arc<ConnectionHandle>>>,
    healthy_replicas: RwLock<Vec<Arc<ConnectionHandle>>>,
    refresh_interval: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry without a refresh loop
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            primary: RwLock::new(None),
            replicas: RwLock::new(Vec::new()),
            healthy_replicas: RwLock::new(Vec::new()),
            refresh_interval,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            refresher: Mutex::new(None),
        }
    }

    /// Create a registry and start its periodic healthy-replica refresh
    pub fn start(refresh_interval: Duration) -> Arc<Self> {
        let registry = Arc::new(Self::new(refresh_interval));
        registry.start_refresher();
        registry
    }

    /// Spawn the refresh loop. No-op if it is already running.
    pub fn start_refresher(self: &Arc<Self>) {
        let mut refresher = self.refresher.lock();
        if refresher.is_some() || self.is_closed() {
            return;
        }

        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.refresh_interval;

        *refresher = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = weak.upgrade() else { break };
                        registry.recompute_healthy_replicas();
                    }
                }
            }
        }));
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn primary(&self) -> Option<Arc<ConnectionHandle>> {
        self.primary.read().clone()
    }

    /// Install a new primary, quitting the one it replaces
    ///
    /// Once the registry is shut down the handle is quit instead and `Closed` is returned.
    pub async fn set_primary(&self, handle: Arc<ConnectionHandle>) -> ClusterResult<()> {
        let previous = {
            let mut primary = self.primary.write();
            if self.is_closed() {
                None
            } else {
                info!(endpoint = %handle.endpoint(), "Setting primary");
                Some(primary.replace(Arc::clone(&handle)))
            }
        };

        match previous {
            None => {
                handle.quit().await;
                Err(ClusterError::Closed)
            }
            Some(Some(previous)) => {
                info!(endpoint = %previous.endpoint(), "Releasing replaced primary");
                previous.quit().await;
                Ok(())
            }
            Some(None) => Ok(()),
        }
    }

    /// Append a replica; it is routable right away if it is healthy
    ///
    /// Once the registry is shut down the handle is quit instead and `Closed` is returned.
    pub async fn add_replica(&self, handle: Arc<ConnectionHandle>) -> ClusterResult<()> {
        let accepted = {
            let mut replicas = self.replicas.write();
            if self.is_closed() {
                false
            } else {
                info!(endpoint = %handle.endpoint(), "Adding replica");
                replicas.push(Arc::clone(&handle));
                true
            }
        };

        if !accepted {
            handle.quit().await;
            return Err(ClusterError::Closed);
        }

        self.recompute_healthy_replicas();
        Ok(())
    }

    /// Snapshot of every registered replica
    pub fn replicas(&self) -> Vec<Arc<ConnectionHandle>> {
        self.replicas.read().clone()
    }

    /// Snapshot of the replicas considered healthy at the last recomputation
    pub fn healthy_replicas(&self) -> Vec<Arc<ConnectionHandle>> {
        self.healthy_replicas.read().clone()
    }

    /// Rebuild the healthy-replica view from the replicas' liveness flags
    pub fn recompute_healthy_replicas(&self) {
        // hold the replica list while swapping the view so concurrent recomputes
        // cannot publish an older snapshot over a newer one
        let replicas = self.replicas.read();
        let healthy: Vec<_> = replicas
            .iter()
            .filter(|handle| handle.is_connected())
            .cloned()
            .collect();

        debug!(
            total = replicas.len(),
            healthy = healthy.len(),
            "Recomputed healthy replicas"
        );
        *self.healthy_replicas.write() = healthy;
    }

    /// Pick a handle for a read: a random healthy replica, else the writer
    pub fn select_reader(&self) -> Option<Arc<ConnectionHandle>> {
        let chosen = self
            .healthy_replicas
            .read()
            .choose(&mut rand::thread_rng())
            .cloned();

        match chosen {
            Some(handle) => Some(handle),
            None => self.select_writer(),
        }
    }

    /// Pick the handle for a write: the primary, if set and connected
    pub fn select_writer(&self) -> Option<Arc<ConnectionHandle>> {
        self.primary
            .read()
            .as_ref()
            .filter(|handle| handle.is_connected())
            .cloned()
    }

    /// Stop the refresh loop and quit every handle
    ///
    /// Idempotent. Always completes; individual handles log their own failures.
    pub async fn shutdown(&self) {
        // flip the flag under both write locks so no install can slip in after the snapshot
        let (primary, replicas) = {
            let primary = self.primary.write();
            let replicas = self.replicas.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            (primary.clone(), replicas.clone())
        };

        self.shutdown.cancel();
        let refresher = self.refresher.lock().take();
        if let Some(refresher) = refresher {
            if let Err(err) = refresher.await {
                error!(error = %err, "Healthy-replica refresher terminated abnormally");
            }
        }

        if let Some(primary) = primary {
            primary.quit().await;
        }
        for replica in replicas {
            replica.quit().await;
        }

        self.recompute_healthy_replicas();
        info!("Connection registry shut down");
    }

    #[cfg(test)]
    pub(crate) fn clear_replicas(&self) {
        self.replicas.write().clear();
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("primary", &self.primary())
            .field("replicas", &self.replicas.read().len())
            .field("healthy_replicas", &self.healthy_replicas.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutor;

    fn idle_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_millis(50))
    }

    fn handle(name: &str, connected: bool) -> Arc<ConnectionHandle> {
        let handle = ConnectionHandle::new(
            format!("{}:5432", name),
            Box::new(MockExecutor::new(name)),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        handle.set_connected(connected);
        Arc::new(handle)
    }

    #[tokio::test]
    async fn test_add_replica_is_immediately_eligible() {
        let registry = idle_registry();
        registry.add_replica(handle("replica", true)).await.unwrap();

        assert_eq!(registry.healthy_replicas().len(), 1);
        assert!(registry.select_reader().is_some());
    }

    #[tokio::test]
    async fn test_add_unhealthy_replica_is_not_eligible() {
        let registry = idle_registry();
        registry.add_replica(handle("replica", false)).await.unwrap();

        assert_eq!(registry.replicas().len(), 1);
        assert!(registry.healthy_replicas().is_empty());
    }

    #[tokio::test]
    async fn test_reader_always_picks_a_healthy_replica() {
        let registry = idle_registry();
        let primary = handle("primary", true);
        registry.set_primary(Arc::clone(&primary)).await.unwrap();

        let healthy_a = handle("replica-a", true);
        let healthy_b = handle("replica-b", true);
        let down = handle("replica-c", false);
        registry.add_replica(Arc::clone(&healthy_a)).await.unwrap();
        registry.add_replica(Arc::clone(&down)).await.unwrap();
        registry.add_replica(Arc::clone(&healthy_b)).await.unwrap();

        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..200 {
            let reader = registry.select_reader().unwrap();
            assert!(!Arc::ptr_eq(&reader, &primary));
            assert!(!Arc::ptr_eq(&reader, &down));
            seen_a |= Arc::ptr_eq(&reader, &healthy_a);
            seen_b |= Arc::ptr_eq(&reader, &healthy_b);
        }
        assert!(seen_a && seen_b);
    }

    #[tokio::test]
    async fn test_reader_falls_back_to_writer() {
        let registry = idle_registry();
        registry.add_replica(handle("replica", true)).await.unwrap();
        assert!(registry.select_reader().is_some());

        // replica goes down; no primary yet, so nothing can serve reads
        registry.replicas()[0].set_connected(false);
        registry.recompute_healthy_replicas();
        assert!(registry.select_reader().is_none());
        assert!(registry.select_writer().is_none());

        let primary = handle("primary", true);
        registry.set_primary(Arc::clone(&primary)).await.unwrap();

        let reader = registry.select_reader().unwrap();
        let writer = registry.select_writer().unwrap();
        assert!(Arc::ptr_eq(&reader, &writer));
        assert!(Arc::ptr_eq(&reader, &primary));
    }

    #[tokio::test]
    async fn test_writer_requires_connected_primary() {
        let registry = idle_registry();
        assert!(registry.select_writer().is_none());

        let primary = handle("primary", true);
        registry.set_primary(Arc::clone(&primary)).await.unwrap();
        assert!(registry.select_writer().is_some());

        primary.set_connected(false);
        assert!(registry.select_writer().is_none());
    }

    #[tokio::test]
    async fn test_writer_never_uses_replica() {
        let registry = idle_registry();
        registry.add_replica(handle("replica", true)).await.unwrap();

        assert!(registry.select_writer().is_none());
    }

    #[tokio::test]
    async fn test_set_primary_quits_previous() {
        let registry = idle_registry();
        let old = handle("old-primary", true);
        let new = handle("new-primary", true);

        registry.set_primary(Arc::clone(&old)).await.unwrap();
        registry.set_primary(Arc::clone(&new)).await.unwrap();

        assert!(old.is_closed());
        assert!(!old.is_connected());
        assert!(Arc::ptr_eq(&registry.select_writer().unwrap(), &new));
    }

    #[tokio::test]
    async fn test_recompute_with_no_replicas_clears_view() {
        let registry = idle_registry();
        registry.add_replica(handle("replica", true)).await.unwrap();
        assert_eq!(registry.healthy_replicas().len(), 1);

        registry.clear_replicas();
        registry.recompute_healthy_replicas();

        assert!(registry.healthy_replicas().is_empty());
    }

    #[tokio::test]
    async fn test_refresher_and_shutdown() {
        let executor = MockExecutor::new("replica");
        let replica = ConnectionHandle::connect(
            "replica:5432",
            Box::new(executor.clone()),
            Duration::from_secs(1),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        let registry = ConnectionRegistry::start(Duration::from_millis(20));
        registry.add_replica(Arc::clone(&replica)).await.unwrap();
        registry.set_primary(handle("primary", true)).await.unwrap();

        // replica fails its probes; the refresher notices without any caller help
        executor.set_ping_mode(crate::testing::PingMode::Failing("down".to_string()));
        time::sleep(Duration::from_millis(200)).await;
        assert!(registry.healthy_replicas().is_empty());

        executor.set_ping_mode(crate::testing::PingMode::Healthy);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.healthy_replicas().len(), 1);

        registry.shutdown().await;
        assert!(registry.is_closed());
        assert!(!replica.is_connected());
        assert!(registry.select_reader().is_none());
        assert!(registry.select_writer().is_none());
        assert!(registry.healthy_replicas().is_empty());
        assert_eq!(executor.close_calls(), 1);

        // second shutdown is a no-op
        registry.shutdown().await;
        assert_eq!(executor.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_install_after_shutdown_is_rejected() {
        let registry = ConnectionRegistry::start(Duration::from_millis(20));
        registry.shutdown().await;

        let executor = MockExecutor::new("late-replica");
        let late = ConnectionHandle::connect(
            "late-replica:5432",
            Box::new(executor.clone()),
            Duration::from_secs(1),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        assert!(matches!(
            registry.add_replica(Arc::clone(&late)).await,
            Err(ClusterError::Closed)
        ));
        assert!(late.is_closed());
        assert!(registry.replicas().is_empty());
        assert!(registry.select_reader().is_none());

        // the rejected handle stops probing
        let calls = executor.ping_calls();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.ping_calls(), calls);
        assert_eq!(executor.close_calls(), 1);

        let primary = handle("late-primary", true);
        assert!(matches!(
            registry.set_primary(Arc::clone(&primary)).await,
            Err(ClusterError::Closed)
        ));
        assert!(primary.is_closed());
        assert!(registry.select_writer().is_none());
    }
}
