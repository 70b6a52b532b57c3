//! Adapter for `axum` WebSocket upgrades.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use super::{CloseFrame, Frame, FrameSink, FrameSource, Transport, check_frame_size};
use crate::errors::TransportError;

/// An upgraded `axum` WebSocket.
pub struct AxumTransport {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl AxumTransport {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            remote_addr: None,
        }
    }

    /// Report `addr` as the remote address (from `ConnectInfo`).
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Transport for AxumTransport {
    type Sink = AxumSink;
    type Source = AxumSource;

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn split(self) -> (AxumSink, AxumSource) {
        let (sink, stream) = self.socket.split();
        (
            AxumSink { inner: sink },
            AxumSource {
                inner: stream,
                limit: None,
            },
        )
    }
}

/// Write half of an [`AxumTransport`].
pub struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(to_message(frame)).await.map_err(io_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(io_error)
    }
}

/// Read half of an [`AxumTransport`].
pub struct AxumSource {
    inner: SplitStream<WebSocket>,
    limit: Option<usize>,
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(err) => return Some(Err(io_error(err))),
        };
        let frame = from_message(message);
        if let Some(limit) = self.limit {
            if let Err(err) = check_frame_size(&frame, limit) {
                return Some(Err(err));
            }
        }
        Some(Ok(frame))
    }

    fn set_max_frame_size(&mut self, limit: usize) {
        self.limit = Some(limit);
    }
}

fn io_error(err: axum::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: c.reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(close) => Frame::Close(close.map(|c| CloseFrame {
            code: c.code,
            reason: c.reason.as_str().to_owned(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frames_map_to_messages() {
        assert!(matches!(
            to_message(Frame::Text("hi".into())),
            Message::Text(t) if t.as_str() == "hi"
        ));
        assert!(matches!(
            to_message(Frame::Close(Some(CloseFrame::normal("bye")))),
            Message::Close(Some(c)) if c.code == 1000 && c.reason.as_str() == "bye"
        ));
    }

    #[test]
    fn messages_map_to_frames() {
        assert_eq!(
            from_message(Message::Binary(Bytes::from_static(b"\x01"))),
            Frame::Binary(Bytes::from_static(b"\x01"))
        );
        assert_eq!(from_message(Message::Close(None)), Frame::Close(None));
    }
}
