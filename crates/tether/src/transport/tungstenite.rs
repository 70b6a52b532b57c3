//! Adapter for `tokio-tungstenite` streams, client or server side.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{CloseFrame, Frame, FrameSink, FrameSource, Transport, check_frame_size};
use crate::errors::TransportError;

/// A `tokio-tungstenite` WebSocket stream.
pub struct TungsteniteTransport<S> {
    stream: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
}

impl<S> TungsteniteTransport<S> {
    /// Wrap an established stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            remote_addr: None,
        }
    }

    /// Report `addr` as the remote address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl<S> Transport for TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = TungsteniteSink<S>;
    type Source = TungsteniteSource<S>;

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.stream.split();
        (
            TungsteniteSink { inner: sink },
            TungsteniteSource {
                inner: stream,
                limit: None,
            },
        )
    }
}

/// Write half of a [`TungsteniteTransport`].
pub struct TungsteniteSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(to_message(frame)).await.map_err(map_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(map_error(err)),
        }
    }
}

/// Read half of a [`TungsteniteTransport`].
pub struct TungsteniteSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    limit: Option<usize>,
}

#[async_trait]
impl<S> FrameSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(map_error(err))),
            };
            // Raw frames only appear when writing; nothing to dispatch.
            let Some(frame) = from_message(message) else {
                continue;
            };
            if let Some(limit) = self.limit {
                if let Err(err) = check_frame_size(&frame, limit) {
                    return Some(Err(err));
                }
            }
            return Some(Ok(frame));
        }
    }

    fn set_max_frame_size(&mut self, limit: usize) {
        self.limit = Some(limit);
    }
}

fn map_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(other.to_string()),
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
            code: CloseCode::from(c.code),
            reason: c.reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    let frame = match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(close) => Frame::Close(close.map(|c| CloseFrame {
            code: u16::from(c.code),
            reason: c.reason.as_str().to_owned(),
        })),
        Message::Frame(_) => return None,
    };
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_round_trips() {
        let message = to_message(Frame::Close(Some(CloseFrame {
            code: 4001,
            reason: "custom".into(),
        })));
        assert_eq!(
            from_message(message),
            Some(Frame::Close(Some(CloseFrame {
                code: 4001,
                reason: "custom".into(),
            })))
        );
    }

    #[test]
    fn closed_errors_are_closed() {
        assert_eq!(map_error(WsError::ConnectionClosed), TransportError::Closed);
        assert_eq!(map_error(WsError::AlreadyClosed), TransportError::Closed);
    }
}
