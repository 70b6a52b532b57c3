//! Server shutdown: stop accepting, drain the hub, then stop background tasks.

use std::time::Duration;

use tether::Hub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Close reason sent to every connection on shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Owns the server's shutdown token and the order in which things stop.
///
/// 1. [`shutdown`](Self::shutdown) cancels the token.
/// 2. [`drain_hub`](Self::drain_hub), used as the listener's graceful-shutdown
///    signal, closes every connection and waits for the registry to empty.
/// 3. [`join_tasks`](Self::join_tasks) waits for background tasks that watch
///    the token.
///
/// Both waits are bounded by the same grace period.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    hub: Hub,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator for `hub`.
    pub fn new(hub: Hub, grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            hub,
            grace,
        }
    }

    /// Token that background tasks stop on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for shutdown to be initiated, then close every connection with
    /// [`SHUTDOWN_REASON`] and wait for the hub to drain.
    ///
    /// Returns `false` if connections were still open when the grace period
    /// ran out.
    pub async fn drain_hub(&self) -> bool {
        self.token.cancelled().await;
        info!(
            connections = self.hub.connection_count(),
            grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
            "draining hub"
        );
        let drained = self.hub.shutdown(SHUTDOWN_REASON, self.grace).await;
        if !drained {
            warn!(
                remaining = self.hub.connection_count(),
                "connections still open after shutdown grace period"
            );
        }
        drained
    }

    /// Cancel the token and wait up to the grace period for `handles`.
    pub async fn join_tasks(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown();
        let count = handles.len();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!(count, "background tasks still running after {:?}", self.grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tether::transport::memory::{self, MemoryPeer};
    use tether::transport::{CloseFrame, Frame};
    use tether::{HubConfig, NoopHandler};
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn hub() -> Hub {
        Hub::new(
            HubConfig {
                close_linger_ms: 10,
                ..HubConfig::default()
            },
            NoopHandler,
        )
    }

    async fn connect(hub: &Hub) -> MemoryPeer {
        let (transport, peer) = memory::pair();
        let expected = hub.connection_count() + 1;
        let registering = hub.clone();
        drop(tokio::spawn(async move {
            registering.register(transport, HashMap::new()).await
        }));
        timeout(WAIT, async {
            while hub.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        peer
    }

    #[tokio::test]
    async fn token_propagation() {
        let coord = ShutdownCoordinator::new(hub(), WAIT);
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn drain_hub_waits_for_shutdown_then_closes_connections() {
        let hub = hub();
        let mut peer = connect(&hub).await;
        let coord = std::sync::Arc::new(ShutdownCoordinator::new(hub.clone(), WAIT));

        let draining = tokio::spawn({
            let coord = coord.clone();
            async move { coord.drain_hub().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());
        assert_eq!(hub.connection_count(), 1);

        coord.shutdown();
        assert!(timeout(WAIT, draining).await.unwrap().unwrap());
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.is_shutting_down());
        assert_eq!(
            timeout(WAIT, peer.next_frame()).await.unwrap(),
            Some(Frame::Close(Some(CloseFrame::normal(SHUTDOWN_REASON))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drain_hub_gives_up_after_grace() {
        let hub = hub();
        let peer = connect(&hub).await;
        peer.pause_writes();
        let coord = ShutdownCoordinator::new(hub.clone(), Duration::from_millis(100));

        coord.shutdown();
        assert!(!coord.drain_hub().await);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn join_tasks_cancels_and_waits() {
        let coord = ShutdownCoordinator::new(hub(), WAIT);
        let token = coord.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        });

        coord.join_tasks(vec![handle]).await;
        assert!(rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn join_tasks_gives_up_after_grace() {
        let coord = ShutdownCoordinator::new(hub(), Duration::from_millis(100));
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let started = tokio::time::Instant::now();
        coord.join_tasks(vec![handle]).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
