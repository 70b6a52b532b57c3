//! Transport abstraction.
//!
//! A transport is a duplex, frame-oriented connection that splits into a
//! [`FrameSink`] owned by the outbound pump and a [`FrameSource`] owned by the
//! inbound pump. Deadlines are applied by the pumps, not by adapters.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{CLOSE_NORMAL, TransportError};

#[cfg(feature = "axum")]
pub mod axum;
pub mod memory;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

#[cfg(feature = "axum")]
pub use self::axum::AxumTransport;
#[cfg(feature = "tungstenite")]
pub use self::tungstenite::TungsteniteTransport;

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// Human readable reason.
    pub reason: String,
}

impl CloseFrame {
    /// A normal-closure frame with `reason`.
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
        }
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Keep-alive probe.
    Ping(Bytes),
    /// Keep-alive acknowledgement.
    Pong(Bytes),
    /// Close handshake.
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Payload length in bytes, used for frame size limits.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
            Self::Close(frame) => frame.as_ref().map_or(0, |f| f.reason.len() + 2),
        }
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one frame.
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Release the write half. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next inbound frame, or `None` once the peer has gone away.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Reject inbound frames whose payload is larger than `limit` bytes.
    fn set_max_frame_size(&mut self, limit: usize);
}

/// A connection that can be registered with a [`Hub`](crate::Hub).
pub trait Transport: Send + 'static {
    /// Write half.
    type Sink: FrameSink;
    /// Read half.
    type Source: FrameSource;

    /// Address of the remote peer, when the adapter knows it.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Split into independently owned halves.
    fn split(self) -> (Self::Sink, Self::Source);
}

/// Check `frame` against `limit`, shared by the adapters.
pub(crate) fn check_frame_size(frame: &Frame, limit: usize) -> Result<(), TransportError> {
    let size = frame.payload_len();
    if size > limit {
        return Err(TransportError::FrameTooLarge { size, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len_per_kind() {
        assert_eq!(Frame::Text("abc".into()).payload_len(), 3);
        assert_eq!(Frame::Binary(Bytes::from_static(&[1, 2])).payload_len(), 2);
        assert_eq!(Frame::Close(None).payload_len(), 0);
        assert_eq!(Frame::Close(Some(CloseFrame::normal("bye"))).payload_len(), 5);
    }

    #[test]
    fn size_check() {
        assert!(check_frame_size(&Frame::Text("x".repeat(256)), 256).is_ok());
        assert_eq!(
            check_frame_size(&Frame::Text("x".repeat(257)), 256),
            Err(TransportError::FrameTooLarge {
                size: 257,
                limit: 256
            })
        );
    }

    #[test]
    fn normal_close_frame() {
        let frame = CloseFrame::normal("done");
        assert_eq!(frame.code, 1000);
        assert_eq!(frame.reason, "done");
    }
}
