//! Application callbacks.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::errors::HubError;
use crate::hub::Hub;

/// How to answer a close frame sent by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseReply {
    /// Echo the close frame back to complete the handshake.
    #[default]
    Echo,
    /// Send nothing; the transport is released without a reply.
    Silent,
}

/// Connection lifecycle and message callbacks.
///
/// Every method has a no-op default. Callbacks run on the pump task of the
/// connection they concern, so a slow callback only delays that connection.
/// Callbacks may call back into the [`Hub`], but must not panic.
#[allow(unused_variables)]
pub trait Handler: Send + Sync + 'static {
    /// The connection is registered and its outbound pump is running.
    fn on_connect(&self, hub: &Hub, conn: &Arc<Connection>) {}

    /// The connection is gone and deregistered. Called exactly once.
    fn on_disconnect(&self, hub: &Hub, conn: &Arc<Connection>) {}

    /// A text frame arrived.
    fn on_text(&self, hub: &Hub, conn: &Arc<Connection>, text: String) {}

    /// A binary frame arrived.
    fn on_binary(&self, hub: &Hub, conn: &Arc<Connection>, data: Bytes) {}

    /// A per-connection fault: full outbound queue or transport failure.
    fn on_error(&self, hub: &Hub, conn: &Arc<Connection>, err: &HubError) {}

    /// The peer started the close handshake.
    fn on_close_frame(
        &self,
        hub: &Hub,
        conn: &Arc<Connection>,
        code: u16,
        reason: &str,
    ) -> CloseReply {
        CloseReply::Echo
    }

    /// The peer answered a keep-alive ping.
    fn on_keepalive_response(&self, hub: &Hub, conn: &Arc<Connection>) {}
}

/// A handler that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl Handler for NoopHandler {}
