//! The hub facade: registration, routing, pub/sub and shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tether_pubsub::PubSub;
use tether_shard::ShardedMap;
use tokio::sync::{Notify, mpsc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::connection::Connection;
use crate::errors::{HubError, Result};
use crate::fanout;
use crate::handler::Handler;
use crate::message::{Broadcast, Outbound, Predicate};
use crate::pump::{inbound, outbound};
use crate::transport::Transport;

/// Reason sent to connections admitted while shutdown was starting.
const SHUTDOWN_REASON: &str = "server shutting down";

pub(crate) struct HubInner {
    config: HubConfig,
    handler: Arc<dyn Handler>,
    registry: ShardedMap<String, Arc<Connection>>,
    pubsub: PubSub,
    broadcast_tx: mpsc::UnboundedSender<Broadcast>,
    shutdown: CancellationToken,
    fanout_stop: CancellationToken,
    drained: Notify,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.fanout_stop.cancel();
    }
}

/// Handle to a connection hub.
///
/// Cheap to clone; every clone refers to the same registry. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Build a hub and start its fan-out engine and pub/sub workers.
    pub fn new(config: HubConfig, handler: impl Handler) -> Self {
        let config = config.normalized();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let fanout_stop = CancellationToken::new();
        let inner = Arc::new(HubInner {
            registry: ShardedMap::new(config.shard_count),
            pubsub: PubSub::new(config.pubsub()),
            handler: Arc::new(handler),
            broadcast_tx,
            shutdown: CancellationToken::new(),
            fanout_stop: fanout_stop.clone(),
            drained: Notify::new(),
            config,
        });
        drop(tokio::spawn(fanout::run(
            Arc::downgrade(&inner),
            broadcast_rx,
            fanout_stop,
        )));
        info!(
            shards = inner.config.shard_count,
            max_frame_size = inner.config.max_frame_size,
            outbound_capacity = inner.config.outbound_capacity,
            "hub started"
        );
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<HubInner>) -> Self {
        Self { inner }
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub(crate) fn handler(&self) -> &dyn Handler {
        self.inner.handler.as_ref()
    }

    pub(crate) fn registry(&self) -> &ShardedMap<String, Arc<Connection>> {
        &self.inner.registry
    }

    /// Admit a connection and drive it until it closes.
    ///
    /// `on_connect` runs once the connection is registered and its outbound
    /// pump is started, before any inbound frame is read. Returns the
    /// connection id after teardown has finished.
    pub async fn register<T: Transport>(
        &self,
        transport: T,
        attributes: HashMap<String, Value>,
    ) -> Result<String> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        let remote_addr = transport.remote_addr();
        let (sink, source) = transport.split();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_capacity);
        let conn = Arc::new(Connection::new(
            Uuid::now_v7().to_string(),
            tx,
            self.inner.pubsub.subscriber(),
            remote_addr,
            attributes,
            Arc::downgrade(&self.inner),
        ));
        let id = conn.id().to_owned();

        if self.inner.registry.insert(id.clone(), conn.clone()).is_some() {
            warn!(conn_id = %id, "replaced existing connection with the same id");
        }
        counter!("tether_connections_total").increment(1);
        gauge!("tether_connections_active").increment(1.0);
        info!(conn_id = %id, remote_addr = ?remote_addr, "connection registered");

        let outbound = tokio::spawn(outbound::run(self.clone(), conn.clone(), rx, sink));
        let mut guard = TeardownGuard {
            hub: self.clone(),
            conn: conn.clone(),
            outbound: Some(outbound),
        };
        if self.is_shutting_down() {
            conn.disconnect(SHUTDOWN_REASON);
        }
        self.inner.handler.on_connect(self, &conn);
        inbound::run(self, &conn, source).await;
        if let Some(task) = guard.start() {
            if let Err(err) = task.await {
                warn!(conn_id = %id, error = %err, "teardown task failed");
            }
        }
        Ok(id)
    }

    /// Runs once per connection, after the inbound pump has stopped.
    async fn teardown(self, conn: Arc<Connection>, outbound: JoinHandle<()>) {
        if let Err(err) = outbound.await {
            warn!(conn_id = %conn.id(), error = %err, "outbound pump panicked");
        }
        let _ = self
            .inner
            .registry
            .remove_if(conn.id(), |current| Arc::ptr_eq(current, &conn));
        self.inner.handler.on_disconnect(&self, &conn);
        conn.clear_attributes();

        counter!("tether_disconnections_total").increment(1);
        gauge!("tether_connections_active").decrement(1.0);
        histogram!("tether_connection_duration_seconds").record(conn.age().as_secs_f64());
        info!(
            conn_id = %conn.id(),
            dropped = conn.dropped_messages(),
            "connection closed"
        );
        self.inner.drained.notify_waiters();
    }

    /// Look up a live connection.
    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.registry.get(id)
    }

    /// Visit every registered connection. The visitor may call back into the
    /// hub.
    pub fn for_each_connection(&self, mut visitor: impl FnMut(&Arc<Connection>)) {
        self.inner.registry.for_each(|_, conn| visitor(conn));
    }

    /// Number of registered connections, including ones still tearing down.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    fn require(&self, id: &str) -> Result<Arc<Connection>> {
        self.connection(id)
            .ok_or_else(|| HubError::ConnectionNotFound(id.to_owned()))
    }

    /// Queue a text frame for one connection.
    pub fn send_text(&self, id: &str, text: impl Into<String>) -> Result<()> {
        self.require(id)?.write_text(text)
    }

    /// Queue a binary frame for one connection.
    pub fn send_binary(&self, id: &str, data: impl Into<Bytes>) -> Result<()> {
        self.require(id)?.write_binary(data)
    }

    /// Queue a text frame for every connection.
    pub fn broadcast_text(&self, text: impl Into<String>) {
        self.broadcast(text_message(text), None);
    }

    /// Queue a binary frame for every connection.
    pub fn broadcast_binary(&self, data: impl Into<Bytes>) {
        self.broadcast(Outbound::Binary(data.into()), None);
    }

    /// Queue a text frame for every connection matching `filter` at delivery
    /// time.
    pub fn broadcast_text_where<F>(&self, text: impl Into<String>, filter: F)
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.broadcast(text_message(text), Some(Arc::new(filter)));
    }

    /// Queue a binary frame for every connection matching `filter` at
    /// delivery time.
    pub fn broadcast_binary_where<F>(&self, data: impl Into<Bytes>, filter: F)
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.broadcast(Outbound::Binary(data.into()), Some(Arc::new(filter)));
    }

    fn broadcast(&self, message: Outbound, filter: Option<Predicate>) {
        if self
            .inner
            .broadcast_tx
            .send(Broadcast::new(message, filter))
            .is_err()
        {
            debug!("broadcast dropped, fan-out engine stopped");
        }
    }

    /// Close one connection with `reason`.
    pub fn disconnect(&self, id: &str, reason: impl Into<String>) -> Result<()> {
        self.require(id)?.disconnect(reason);
        Ok(())
    }

    /// Close every open connection matching `filter`. Returns how many were
    /// asked to close.
    pub fn disconnect_where<F>(&self, reason: &str, filter: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut count = 0;
        self.inner.registry.for_each(|_, conn| {
            if conn.is_open() && filter(conn.as_ref()) {
                conn.disconnect(reason);
                count += 1;
            }
        });
        count
    }

    /// Close every open connection.
    pub fn disconnect_all(&self, reason: &str) -> usize {
        self.disconnect_where(reason, |_| true)
    }

    /// Publish to a pub/sub topic.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.inner.pubsub.publish(topic, payload)?;
        Ok(())
    }

    /// Subscribe a connection to a topic. The subscription ends with the
    /// connection.
    pub fn subscribe<F>(&self, id: &str, topic: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.require(id)?.subscribe(topic, handler)
    }

    /// Unsubscribe a connection from a topic. Returns whether it was
    /// subscribed.
    pub fn unsubscribe(&self, id: &str, topic: &str) -> Result<bool> {
        Ok(self.require(id)?.unsubscribe(topic))
    }

    /// Subscribers listening on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.pubsub.subscriber_count(topic)
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> Vec<String> {
        self.inner.pubsub.topics()
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Refuse new connections, close every open one with `reason`, and wait
    /// up to `grace` for the registry to drain. Stops the fan-out engine.
    ///
    /// Returns `true` if every connection finished closing in time.
    pub async fn shutdown(&self, reason: &str, grace: Duration) -> bool {
        self.inner.shutdown.cancel();
        let closing = self.disconnect_all(reason);
        info!(closing, "hub shutting down");

        let deadline = tokio::time::Instant::now() + grace;
        let drained = loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if self.inner.registry.is_empty() {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    remaining = self.inner.registry.len(),
                    "shutdown grace period expired"
                );
                break false;
            }
        };
        self.inner.fanout_stop.cancel();
        drained
    }

    /// Report a per-connection fault to the handler.
    pub(crate) fn report(&self, conn: &Arc<Connection>, err: &HubError) {
        match err {
            HubError::Transport(transport) => {
                counter!("tether_transport_errors_total").increment(1);
                warn!(conn_id = %conn.id(), error = %transport, "transport error");
            }
            HubError::OutboundBufferFull(_) => {
                warn!(conn_id = %conn.id(), "outbound buffer full, message dropped");
            }
            other => debug!(conn_id = %conn.id(), error = %other, "connection error"),
        }
        self.inner.handler.on_error(self, conn, err);
    }
}

/// Tears a connection down exactly once, whether `register` finishes or its
/// future is dropped mid-flight.
struct TeardownGuard {
    hub: Hub,
    conn: Arc<Connection>,
    outbound: Option<JoinHandle<()>>,
}

impl TeardownGuard {
    /// Fire the close guard, detach pub/sub and spawn the rest of the
    /// teardown. Returns `None` if it already started.
    fn start(&mut self) -> Option<JoinHandle<()>> {
        let outbound = self.outbound.take()?;
        let _ = self.conn.begin_close();
        self.conn.subscriber().close();
        let teardown = self.hub.clone().teardown(self.conn.clone(), outbound);
        match Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(teardown)),
            Err(_) => {
                let _ = self
                    .hub
                    .inner
                    .registry
                    .remove_if(self.conn.id(), |current| Arc::ptr_eq(current, &self.conn));
                warn!(conn_id = %self.conn.id(), "connection dropped outside a runtime");
                None
            }
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Some(task) = self.start() {
            debug!(conn_id = %self.conn.id(), "registration cancelled, tearing down");
            drop(task);
        }
    }
}

fn text_message(text: impl Into<String>) -> Outbound {
    let text: String = text.into();
    Outbound::Text(text.into())
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connection_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
