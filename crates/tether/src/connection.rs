//! Connection record.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tether_pubsub::Subscriber;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, HubError, Result};
use crate::handler::CloseReply;
use crate::hub::{Hub, HubInner};
use crate::message::Outbound;
use crate::transport::CloseFrame;

/// Close code reserved for TLS failures; never sent on the wire.
const CLOSE_TLS: u16 = 1015;

/// Progress of the close handshake from this side.
#[derive(Debug)]
enum CloseHandshake {
    /// Nothing decided yet; a normal close frame is sent on the way out.
    Pending,
    /// Send this frame on the way out.
    Reply(CloseFrame),
    /// The peer's close is not answered.
    Suppressed,
    /// A close frame has already been written.
    Sent,
}

/// One registered connection.
///
/// Shared as `Arc<Connection>` between the registry, both pumps and the
/// application. Once the connection starts closing every write is rejected
/// with [`HubError::ConnectionClosed`].
pub struct Connection {
    id: String,
    /// Cleared exactly once. The compare-and-swap on this flag is the
    /// teardown guard.
    open: AtomicBool,
    tx: mpsc::Sender<Outbound>,
    attributes: RwLock<HashMap<String, Value>>,
    cancel: CancellationToken,
    handshake: Mutex<CloseHandshake>,
    subscriber: Subscriber,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
    dropped_messages: AtomicU64,
    hub: Weak<HubInner>,
}

impl Connection {
    pub(crate) fn new(
        id: String,
        tx: mpsc::Sender<Outbound>,
        subscriber: Subscriber,
        remote_addr: Option<SocketAddr>,
        attributes: HashMap<String, Value>,
        hub: Weak<HubInner>,
    ) -> Self {
        Self {
            id,
            open: AtomicBool::new(true),
            tx,
            attributes: RwLock::new(attributes),
            cancel: CancellationToken::new(),
            handshake: Mutex::new(CloseHandshake::Pending),
            subscriber,
            remote_addr,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
            hub,
        }
    }

    /// Unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the connection still accepts writes.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Remote peer address, if the transport reported one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Store an attribute, returning the previous value.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.write().insert(key.into(), value.into())
    }

    /// Clone out an attribute.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    /// Attribute as a string, when it is one.
    pub fn attribute_str(&self, key: &str) -> Option<String> {
        self.attributes
            .read()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Remove an attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    /// Whether an attribute is set.
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.read().contains_key(key)
    }

    /// Snapshot of every attribute.
    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes.read().clone()
    }

    /// Queue a text frame.
    ///
    /// A full queue drops the message and is reported through
    /// [`Handler::on_error`](crate::Handler::on_error), not returned.
    pub fn write_text(self: &Arc<Self>, text: impl Into<String>) -> Result<()> {
        let text: String = text.into();
        self.write(Outbound::Text(text.into()))
    }

    /// Queue a binary frame. Same delivery rules as [`write_text`](Self::write_text).
    pub fn write_binary(self: &Arc<Self>, data: impl Into<Bytes>) -> Result<()> {
        self.write(Outbound::Binary(data.into()))
    }

    /// Ask the outbound pump to send a close frame with `reason` and stop.
    ///
    /// Does nothing if the connection is already closing. When the queue is
    /// full the overflow is reported and the close is forced anyway.
    pub fn disconnect(self: &Arc<Self>, reason: impl Into<String>) {
        if !self.is_open() {
            return;
        }
        let reason = reason.into();
        match self.tx.try_send(Outbound::Close(reason.clone())) {
            Ok(()) => debug!(conn_id = %self.id, reason = %reason, "disconnect queued"),
            Err(TrySendError::Full(_)) => {
                self.record_drop();
                self.report(&HubError::OutboundBufferFull(self.id.clone()));
                self.set_reply(CloseFrame::normal(reason));
                let _ = self.begin_close();
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.begin_close();
            }
        }
    }

    /// Listen on a pub/sub topic for the lifetime of this connection.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        if !self.is_open() {
            return Err(HubError::ConnectionClosed(self.id.clone()));
        }
        self.subscriber
            .subscribe(topic, handler)
            .map_err(|_| HubError::ConnectionClosed(self.id.clone()))
    }

    /// Stop listening on a topic. Returns whether a subscription existed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.subscriber.unsubscribe(topic)
    }

    /// Topics this connection listens on.
    pub fn topics(&self) -> Vec<String> {
        self.subscriber.topics()
    }

    fn write(self: &Arc<Self>, message: Outbound) -> Result<()> {
        match self.enqueue(message) {
            Err(err @ HubError::OutboundBufferFull(_)) => {
                self.report(&err);
                Ok(())
            }
            other => other,
        }
    }

    /// Non-blocking enqueue used by unicast and broadcast delivery.
    pub(crate) fn enqueue(&self, message: Outbound) -> Result<()> {
        if !self.is_open() {
            return Err(HubError::ConnectionClosed(self.id.clone()));
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.record_drop();
                Err(HubError::OutboundBufferFull(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(HubError::ConnectionClosed(self.id.clone())),
        }
    }

    fn record_drop(&self) {
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        counter!("tether_outbound_dropped_total").increment(1);
    }

    /// Queue a pong for a peer ping; dropped silently when the queue is full.
    pub(crate) fn queue_pong(&self, data: Bytes) {
        if self.tx.try_send(Outbound::Pong(data)).is_err() {
            debug!(conn_id = %self.id, "pong dropped");
        }
    }

    /// Fire the teardown guard. Returns `true` for the caller that won.
    pub(crate) fn begin_close(&self) -> bool {
        let won = self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.cancel.cancel();
        }
        won
    }

    /// Resolves once teardown has begun.
    pub(crate) async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub(crate) fn clear_attributes(&self) {
        self.attributes.write().clear();
    }

    /// Record the application's answer to a peer close frame.
    pub(crate) fn on_peer_close(&self, reply: CloseReply, code: u16, reason: &str) {
        match reply {
            CloseReply::Echo => self.set_reply(CloseFrame {
                code: sendable_close_code(code),
                reason: reason.to_owned(),
            }),
            CloseReply::Silent => {
                let mut handshake = self.handshake.lock();
                if matches!(*handshake, CloseHandshake::Pending | CloseHandshake::Reply(_)) {
                    *handshake = CloseHandshake::Suppressed;
                }
            }
        }
    }

    fn set_reply(&self, frame: CloseFrame) {
        let mut handshake = self.handshake.lock();
        if matches!(*handshake, CloseHandshake::Pending) {
            *handshake = CloseHandshake::Reply(frame);
        }
    }

    pub(crate) fn mark_close_sent(&self) {
        *self.handshake.lock() = CloseHandshake::Sent;
    }

    /// The close frame still owed to the peer, if any.
    pub(crate) fn take_close_reply(&self) -> Option<CloseFrame> {
        let mut handshake = self.handshake.lock();
        let frame = match std::mem::replace(&mut *handshake, CloseHandshake::Sent) {
            CloseHandshake::Pending => Some(CloseFrame::normal("")),
            CloseHandshake::Reply(frame) => Some(frame),
            CloseHandshake::Suppressed | CloseHandshake::Sent => None,
        };
        drop(handshake);
        frame
    }

    pub(crate) fn hub(&self) -> Option<Hub> {
        self.hub.upgrade().map(Hub::from_inner)
    }

    /// Report a per-connection fault to the handler.
    pub(crate) fn report(self: &Arc<Self>, err: &HubError) {
        match self.hub() {
            Some(hub) => hub.report(self, err),
            None => warn!(conn_id = %self.id, error = %err, "connection fault after hub dropped"),
        }
    }
}

/// Codes that may not appear on the wire are answered with a normal closure.
fn sendable_close_code(code: u16) -> u16 {
    match code {
        CLOSE_NO_STATUS | CLOSE_ABNORMAL | CLOSE_TLS => CLOSE_NORMAL,
        other => other,
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("remote_addr", &self.remote_addr)
            .field("dropped_messages", &self.dropped_messages())
            .finish_non_exhaustive()
    }
}
