//! Messages queued for delivery.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;

/// Broadcast filter, evaluated against each connection at delivery time.
pub type Predicate = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// An item on a connection's outbound queue.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(Arc<str>),
    Binary(Bytes),
    /// Send a normal close frame with this reason, then stop.
    Close(String),
    /// Reply to a peer ping.
    Pong(Bytes),
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "Text({} bytes)", text.len()),
            Self::Binary(data) => write!(f, "Binary({} bytes)", data.len()),
            Self::Close(reason) => write!(f, "Close({reason:?})"),
            Self::Pong(data) => write!(f, "Pong({} bytes)", data.len()),
        }
    }
}

/// An item on the hub's broadcast queue.
pub(crate) struct Broadcast {
    pub(crate) message: Outbound,
    pub(crate) filter: Option<Predicate>,
}

impl Broadcast {
    pub(crate) fn new(message: Outbound, filter: Option<Predicate>) -> Self {
        Self { message, filter }
    }

    /// Whether `conn` should receive this broadcast.
    pub(crate) fn accepts(&self, conn: &Connection) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(conn))
    }
}
