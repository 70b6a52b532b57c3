//! Demo connection behaviour.

use std::sync::Arc;

use tether::{Connection, Handler, Hub, HubError};
use tracing::{debug, info, warn};

/// Attribute holding the id from the `/ws/{id}` path.
pub const ID_ATTRIBUTE: &str = "id";
/// First message every connection receives.
pub const WELCOME: &str = "Welcome!";
/// Close reason for an older connection replaced by a newer one with the same id.
pub const DUPLICATE_REASON: &str = "Duplicate ID detected";

/// Greets newcomers, enforces one connection per id, relays chat, and
/// forwards clock ticks.
#[derive(Debug, Clone)]
pub struct DemoHandler {
    clock_topic: String,
}

impl DemoHandler {
    /// Handler that subscribes every connection to `clock_topic`.
    pub fn new(clock_topic: impl Into<String>) -> Self {
        Self {
            clock_topic: clock_topic.into(),
        }
    }
}

impl Handler for DemoHandler {
    fn on_connect(&self, hub: &Hub, conn: &Arc<Connection>) {
        info!(conn_id = %conn.id(), "client connected");
        if let Err(err) = conn.write_text(WELCOME) {
            warn!(conn_id = %conn.id(), error = %err, "failed to send welcome");
            return;
        }

        let newcomer = conn.id().to_owned();
        hub.broadcast_text_where(format!("Welcome! id: {newcomer}"), move |c| {
            c.id() != newcomer
        });

        if let Some(tag) = conn.attribute_str(ID_ATTRIBUTE) {
            if let Err(err) = hub.send_text(conn.id(), format!("Hello {tag}")) {
                warn!(conn_id = %conn.id(), error = %err, "failed to send greeting");
                return;
            }
            let current = conn.id();
            let replaced = hub.disconnect_where(DUPLICATE_REASON, |c| {
                c.id() != current && c.attribute_str(ID_ATTRIBUTE).as_deref() == Some(tag.as_str())
            });
            if replaced > 0 {
                info!(conn_id = %conn.id(), tag = %tag, replaced, "replaced older connections");
            }
        }

        let weak = Arc::downgrade(conn);
        let subscribed = conn.subscribe(self.clock_topic.clone(), move |payload| {
            if let Some(conn) = weak.upgrade() {
                let _ = conn.write_text(String::from_utf8_lossy(&payload).into_owned());
            }
        });
        if let Err(err) = subscribed {
            warn!(conn_id = %conn.id(), error = %err, "failed to subscribe to clock");
        }
    }

    fn on_disconnect(&self, _hub: &Hub, conn: &Arc<Connection>) {
        info!(conn_id = %conn.id(), "client disconnected");
    }

    fn on_text(&self, hub: &Hub, conn: &Arc<Connection>, text: String) {
        debug!(conn_id = %conn.id(), len = text.len(), "relaying message");
        hub.broadcast_text(text);
    }

    fn on_error(&self, _hub: &Hub, conn: &Arc<Connection>, err: &HubError) {
        warn!(conn_id = %conn.id(), error = %err, "connection error");
    }
}
