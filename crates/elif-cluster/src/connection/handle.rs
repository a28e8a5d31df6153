//! Connection handle with background liveness monitoring
//!
//! A handle owns the executor of one endpoint and keeps an atomic `connected` flag
//! fresh by probing the endpoint every `probe_interval`. Failed endpoints are probed
//! forever at the same interval; that is the only recovery mechanism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backends::SqlExecutor;
use crate::error::{ClusterError, ClusterResult};

/// A single long-lived connection to one endpoint
pub struct ConnectionHandle {
    endpoint: String,
    executor: Box<dyn SqlExecutor>,
    probe_timeout: Duration,
    probe_interval: Duration,
    connected: AtomicBool,
    probing: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    /// Create an idle handle: not connected, no monitor running
    pub fn new(
        endpoint: impl Into<String>,
        executor: Box<dyn SqlExecutor>,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            executor,
            probe_timeout,
            probe_interval,
            connected: AtomicBool::new(false),
            probing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Probe the endpoint once and, on success, start the liveness monitor
    ///
    /// When the first probe fails the executor is closed and no monitor is started.
    pub async fn connect(
        endpoint: impl Into<String>,
        executor: Box<dyn SqlExecutor>,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> ClusterResult<Arc<Self>> {
        let handle = Arc::new(Self::new(endpoint, executor, probe_timeout, probe_interval));

        if let Err(err) = handle.probe().await {
            warn!(endpoint = %handle.endpoint, error = %err, "Initial probe failed");
            handle.closed.store(true, Ordering::Release);
            handle.executor.close().await;
            return Err(err);
        }

        handle.set_connected(true);
        handle.start_monitor();
        info!(endpoint = %handle.endpoint, "Connection established");

        Ok(handle)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn executor(&self) -> &dyn SqlExecutor {
        self.executor.as_ref()
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Run one liveness probe bounded by the probe timeout
    ///
    /// Returns `Ok(ProbeOutcome::Skipped)` without probing if another probe is
    /// already in flight.
    pub async fn probe(&self) -> ClusterResult<ProbeOutcome> {
        if self
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(endpoint = %self.endpoint, "Probe already in flight, skipping");
            return Ok(ProbeOutcome::Skipped);
        }
        let _guard = ProbeGuard(&self.probing);

        match time::timeout(self.probe_timeout, self.executor.ping()).await {
            Ok(result) => result.map(|()| ProbeOutcome::Completed),
            Err(_) => Err(ClusterError::ProbeTimeout {
                timeout: self.probe_timeout,
            }),
        }
    }

    /// Probe and record the outcome in the liveness flag
    ///
    /// A skipped probe leaves the flag as it is; the probe in flight owns the update.
    pub async fn update_status(&self) -> bool {
        let connected = match self.probe().await {
            Ok(ProbeOutcome::Completed) => true,
            Ok(ProbeOutcome::Skipped) => return self.is_connected(),
            Err(err) => {
                debug!(endpoint = %self.endpoint, error = %err, "Probe failed");
                false
            }
        };

        if self.is_closed() {
            return false;
        }

        let was_connected = self.connected.swap(connected, Ordering::AcqRel);
        if was_connected != connected {
            if connected {
                info!(endpoint = %self.endpoint, "Connection recovered");
            } else {
                warn!(endpoint = %self.endpoint, "Connection lost");
            }
        }

        connected
    }

    /// Spawn the liveness monitor. No-op if one is already running.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() || self.is_closed() {
            return;
        }

        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.probe_interval;

        *monitor = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(handle) = weak.upgrade() else { break };
                        handle.update_status().await;
                    }
                }
            }
        }));
    }

    /// Stop the monitor, release the executor and mark the handle disconnected
    ///
    /// Idempotent; safe to call on a handle whose monitor never started.
    pub async fn quit(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                error!(endpoint = %self.endpoint, error = %err, "Liveness monitor terminated abnormally");
            }
        }

        self.executor.close().await;
        self.set_connected(false);
        info!(endpoint = %self.endpoint, "Connection closed");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of a probe that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered within the timeout
    Completed,
    /// Another probe was already in flight; nothing was sent
    Skipped,
}

struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, PingMode};

    fn idle_handle(executor: &MockExecutor, probe_timeout: Duration) -> ConnectionHandle {
        ConnectionHandle::new(
            "dummy:5432",
            Box::new(executor.clone()),
            probe_timeout,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let executor = MockExecutor::new("dummy");
        let handle = idle_handle(&executor, Duration::from_secs(1));

        assert!(handle.probe().await.is_ok());
        assert_eq!(executor.ping_calls(), 1);
    }

    #[tokio::test]
    async fn test_probe_fail_returns_executor_error() {
        let executor = MockExecutor::new("dummy").with_ping_mode(PingMode::Failing("something fails".to_string()));
        let handle = idle_handle(&executor, Duration::from_secs(1));

        let err = handle.probe().await.unwrap_err();
        assert_eq!(err.to_string(), "something fails");
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let executor = MockExecutor::new("dummy").with_ping_mode(PingMode::Hanging);
        let handle = idle_handle(&executor, Duration::from_millis(100));

        match handle.probe().await {
            Err(ClusterError::ProbeTimeout { timeout }) => assert_eq!(timeout, Duration::from_millis(100)),
            other => panic!("expected probe timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_probe_is_skipped() {
        let executor = MockExecutor::new("dummy").with_ping_mode(PingMode::Hanging);
        let handle = Arc::new(idle_handle(&executor, Duration::from_millis(300)));

        let in_flight = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.probe().await })
        };
        time::sleep(Duration::from_millis(50)).await;

        // second probe returns immediately instead of stacking on the wedged endpoint
        assert!(matches!(handle.probe().await, Ok(ProbeOutcome::Skipped)));
        assert_eq!(executor.ping_calls(), 1);

        let first = in_flight.await.unwrap();
        assert!(matches!(first, Err(ClusterError::ProbeTimeout { .. })));

        // guard released; the next probe really runs
        executor.set_ping_mode(PingMode::Healthy);
        assert!(matches!(handle.probe().await, Ok(ProbeOutcome::Completed)));
        assert_eq!(executor.ping_calls(), 2);
    }

    #[tokio::test]
    async fn test_update_status_leaves_flag_while_probe_in_flight() {
        let executor = MockExecutor::new("dummy").with_ping_mode(PingMode::Hanging);
        let handle = Arc::new(idle_handle(&executor, Duration::from_millis(300)));

        let in_flight = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.probe().await })
        };
        time::sleep(Duration::from_millis(50)).await;

        // the wedged probe has not reported yet, so a down handle stays down
        assert!(!handle.update_status().await);
        assert!(!handle.is_connected());

        handle.set_connected(true);
        assert!(handle.update_status().await);
        assert!(handle.is_connected());
        assert_eq!(executor.ping_calls(), 1);

        let _ = in_flight.await.unwrap();
    }

    #[tokio::test]
    async fn test_update_status_with_ping_ok() {
        let executor = MockExecutor::new("dummy");
        let handle = idle_handle(&executor, Duration::from_secs(1));

        assert!(handle.update_status().await);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_update_status_with_ping_error() {
        let executor = MockExecutor::new("dummy").with_ping_mode(PingMode::Failing("something fails".to_string()));
        let handle = idle_handle(&executor, Duration::from_secs(1));
        handle.set_connected(true);

        assert!(!handle.update_status().await);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_connected_flag() {
        let executor = MockExecutor::new("dummy");
        let handle = idle_handle(&executor, Duration::from_secs(1));

        assert!(!handle.is_connected());
        handle.set_connected(true);
        assert!(handle.is_connected());
        handle.set_connected(false);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_quit_is_idempotent() {
        let executor = MockExecutor::new("dummy");
        let handle = ConnectionHandle::connect(
            "dummy:5432",
            Box::new(executor.clone()),
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        handle.quit().await;
        handle.quit().await;

        assert!(handle.is_closed());
        assert!(!handle.is_connected());
        assert_eq!(executor.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_quit_without_monitor() {
        let executor = MockExecutor::new("dummy");
        let handle = idle_handle(&executor, Duration::from_secs(1));
        handle.set_connected(true);

        handle.quit().await;

        assert!(handle.is_closed());
        assert!(!handle.is_connected());
        assert_eq!(executor.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_quit_stops_probing() {
        let executor = MockExecutor::new("dummy");
        let handle = ConnectionHandle::connect(
            "dummy:5432",
            Box::new(executor.clone()),
            Duration::from_secs(1),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        time::sleep(Duration::from_millis(100)).await;
        handle.quit().await;
        let calls = executor.ping_calls();

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.ping_calls(), calls);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_monitor_tracks_liveness() {
        let executor = MockExecutor::new("dummy");
        let handle = Arc::new(idle_handle(&executor, Duration::from_secs(1)));
        handle.start_monitor();

        // wait for the monitor to kick in
        time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_connected());

        executor.set_ping_mode(PingMode::Failing("something fails".to_string()));
        time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_connected());

        // failed endpoints keep being probed and recover on their own
        executor.set_ping_mode(PingMode::Healthy);
        time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_connected());

        handle.quit().await;
    }

    #[tokio::test]
    async fn test_connect_timeout_starts_nothing() {
        let executor = MockExecutor::new("dummy").with_ping_mode(PingMode::Hanging);

        let result = ConnectionHandle::connect(
            "dummy:5432",
            Box::new(executor.clone()),
            Duration::from_millis(50),
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Err(ClusterError::ProbeTimeout { .. })));
        assert_eq!(executor.close_calls(), 1);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.ping_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_marks_connected() {
        let executor = MockExecutor::new("dummy");
        let handle = ConnectionHandle::connect(
            "dummy:5432",
            Box::new(executor.clone()),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert!(handle.is_connected());
        assert!(!handle.is_closed());
        assert_eq!(handle.endpoint(), "dummy:5432");

        handle.quit().await;
    }
}
