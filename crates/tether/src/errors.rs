//! Hub and transport error types.

use std::time::Duration;

use tether_pubsub::PubSubError;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent by a peer that is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for a close frame that carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code for a connection lost without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Errors surfaced by a transport adapter or the pumps driving it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport is already closed.
    #[error("transport closed")]
    Closed,

    /// The peer sent a close frame.
    #[error("peer closed connection (code {code}): {reason}")]
    PeerClosed {
        /// Close code from the peer.
        code: u16,
        /// Close reason from the peer.
        reason: String,
    },

    /// A read or write did not finish in time.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out (`read` or `write`).
        op: &'static str,
        /// Deadline that expired.
        after: Duration,
    },

    /// An inbound frame exceeded the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Any other I/O or protocol failure.
    #[error("transport I/O: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error describes an expected end of the connection.
    pub fn is_normal_closure(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::PeerClosed { code, .. } => is_expected_close_code(*code),
            _ => false,
        }
    }
}

/// Normal, going-away, no-status and abnormal closures are expected.
pub fn is_expected_close_code(code: u16) -> bool {
    matches!(
        code,
        CLOSE_NORMAL | CLOSE_GOING_AWAY | CLOSE_NO_STATUS | CLOSE_ABNORMAL
    )
}

/// Errors returned by [`Hub`](crate::Hub) operations or reported through
/// [`Handler::on_error`](crate::Handler::on_error).
#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    /// No connection with this id is registered.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The connection is closing or closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The connection's outbound queue is full; the message was dropped.
    #[error("outbound buffer full for connection {0}")]
    OutboundBufferFull(String),

    /// Transport failure, fatal to that connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Pub/sub broker rejected the operation.
    #[error(transparent)]
    PubSub(#[from] PubSubError),

    /// The hub is shutting down and accepts no new connections.
    #[error("hub is shutting down")]
    ShuttingDown,
}

/// Convenience alias for hub results.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_closures() {
        assert!(TransportError::Closed.is_normal_closure());
        for code in [1000, 1001, 1005, 1006] {
            let err = TransportError::PeerClosed {
                code,
                reason: String::new(),
            };
            assert!(err.is_normal_closure(), "code {code}");
        }
    }

    #[test]
    fn unexpected_closures() {
        let err = TransportError::PeerClosed {
            code: 1008,
            reason: "policy".into(),
        };
        assert!(!err.is_normal_closure());
        assert!(!TransportError::Io("reset".into()).is_normal_closure());
        assert!(
            !TransportError::Timeout {
                op: "read",
                after: Duration::from_secs(1),
            }
            .is_normal_closure()
        );
    }

    #[test]
    fn display_messages() {
        let err = TransportError::FrameTooLarge {
            size: 600,
            limit: 512,
        };
        assert_eq!(err.to_string(), "frame of 600 bytes exceeds limit of 512");

        let err = HubError::ConnectionNotFound("abc".into());
        assert_eq!(err.to_string(), "connection not found: abc");

        let err = HubError::from(TransportError::Timeout {
            op: "write",
            after: Duration::from_millis(250),
        });
        assert_eq!(err.to_string(), "write timed out after 250ms");
    }

    #[test]
    fn pubsub_error_converts() {
        let err: HubError = PubSubError::Closed.into();
        assert!(matches!(err, HubError::PubSub(PubSubError::Closed)));
    }
}
