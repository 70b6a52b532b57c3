//! In-process transport.
//!
//! [`pair`] returns a [`MemoryTransport`] to register with a hub and the
//! [`MemoryPeer`] that plays the remote side. The peer can inject frames and
//! read errors, observe every frame the hub writes, and stall or fail the
//! write half.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};

use super::{CloseFrame, Frame, FrameSink, FrameSource, Transport, check_frame_size};
use crate::errors::TransportError;

/// Shared write-side switches controlled by the peer.
struct WriteControl {
    failure: Mutex<Option<TransportError>>,
    paused: watch::Sender<bool>,
    stalled: Notify,
}

/// Create a connected transport and peer.
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (paused, _) = watch::channel(false);
    let control = Arc::new(WriteControl {
        failure: Mutex::new(None),
        paused,
        stalled: Notify::new(),
    });
    let transport = MemoryTransport {
        sink: MemorySink {
            tx: Some(outbound_tx),
            control: control.clone(),
        },
        source: MemorySource {
            rx: inbound_rx,
            limit: None,
        },
        remote_addr: None,
    };
    let peer = MemoryPeer {
        tx: Some(inbound_tx),
        rx: outbound_rx,
        control,
    };
    (transport, peer)
}

/// Hub side of an in-process connection.
pub struct MemoryTransport {
    sink: MemorySink,
    source: MemorySource,
    remote_addr: Option<SocketAddr>,
}

impl MemoryTransport {
    /// Report `addr` as the remote address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Transport for MemoryTransport {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn split(self) -> (MemorySink, MemorySource) {
        (self.sink, self.source)
    }
}

/// Write half of a [`MemoryTransport`].
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    control: Arc<WriteControl>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let failure = self.control.failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        let mut paused = self.control.paused.subscribe();
        let is_paused = *paused.borrow_and_update();
        if is_paused {
            self.control.stalled.notify_one();
            let _ = paused.wait_for(|paused| !*paused).await;
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        drop(self.tx.take());
        Ok(())
    }
}

/// Read half of a [`MemoryTransport`].
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    limit: Option<usize>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let item = self.rx.recv().await?;
        Some(item.and_then(|frame| {
            if let Some(limit) = self.limit {
                check_frame_size(&frame, limit)?;
            }
            Ok(frame)
        }))
    }

    fn set_max_frame_size(&mut self, limit: usize) {
        self.limit = Some(limit);
    }
}

/// Remote side of an in-process connection.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    control: Arc<WriteControl>,
}

impl MemoryPeer {
    /// Deliver `frame` to the hub. Returns `false` once the peer has hung up
    /// or the hub dropped the read half.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// Deliver a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(Frame::Text(text.into()))
    }

    /// Deliver a binary frame.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send_frame(Frame::Binary(data.into()))
    }

    /// Deliver a ping.
    pub fn send_ping(&self, data: impl Into<Bytes>) -> bool {
        self.send_frame(Frame::Ping(data.into()))
    }

    /// Deliver a pong.
    pub fn send_pong(&self, data: impl Into<Bytes>) -> bool {
        self.send_frame(Frame::Pong(data.into()))
    }

    /// Deliver a close frame.
    pub fn send_close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.send_frame(Frame::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
    }

    /// Make the hub's next read fail with `err`.
    pub fn fail_read(&self, err: TransportError) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(Err(err)).is_ok())
    }

    /// Drop the connection without a close frame.
    pub fn hang_up(&mut self) {
        drop(self.tx.take());
    }

    /// Next frame written by the hub, or `None` once the write half is gone.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// A frame already written by the hub, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Make every subsequent write fail with `err`.
    pub fn fail_writes(&self, err: TransportError) {
        *self.control.failure.lock() = Some(err);
    }

    /// Block writes until [`resume_writes`](Self::resume_writes).
    pub fn pause_writes(&self) {
        let _ = self.control.paused.send_replace(true);
    }

    /// Release writes blocked by [`pause_writes`](Self::pause_writes).
    pub fn resume_writes(&self) {
        let _ = self.control.paused.send_replace(false);
    }

    /// Wait until a write has blocked on [`pause_writes`](Self::pause_writes).
    pub async fn write_stalled(&self) {
        self.control.stalled.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, mut peer) = pair();
        let (mut sink, mut source) = transport.split();

        assert!(peer.send_text("hi"));
        assert_eq!(
            source.next_frame().await.unwrap().unwrap(),
            Frame::Text("hi".into())
        );

        sink.send_frame(Frame::Binary(Bytes::from_static(b"yo")))
            .await
            .unwrap();
        assert_eq!(
            peer.next_frame().await,
            Some(Frame::Binary(Bytes::from_static(b"yo")))
        );
    }

    #[tokio::test]
    async fn hang_up_ends_source() {
        let (transport, mut peer) = pair();
        let (_sink, mut source) = transport.split();
        peer.hang_up();
        assert!(source.next_frame().await.is_none());
        assert!(!peer.send_text("late"));
    }

    #[tokio::test]
    async fn close_ends_peer_stream() {
        let (transport, mut peer) = pair();
        let (mut sink, _source) = transport.split();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(peer.next_frame().await.is_none());
        assert_eq!(
            sink.send_frame(Frame::Text("x".into())).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (transport, peer) = pair();
        let (_sink, mut source) = transport.split();
        source.set_max_frame_size(4);
        assert!(peer.send_text("12345"));
        assert_eq!(
            source.next_frame().await.unwrap(),
            Err(TransportError::FrameTooLarge { size: 5, limit: 4 })
        );
    }

    #[tokio::test]
    async fn injected_failures() {
        let (transport, peer) = pair();
        let (mut sink, mut source) = transport.split();

        assert!(peer.fail_read(TransportError::Io("reset".into())));
        assert_eq!(
            source.next_frame().await.unwrap(),
            Err(TransportError::Io("reset".into()))
        );

        peer.fail_writes(TransportError::Io("broken pipe".into()));
        assert_eq!(
            sink.send_frame(Frame::Text("x".into())).await,
            Err(TransportError::Io("broken pipe".into()))
        );
    }

    #[tokio::test]
    async fn paused_writes_block_until_resumed() {
        let (transport, mut peer) = pair();
        let (mut sink, _source) = transport.split();
        peer.pause_writes();

        let writer = tokio::spawn(async move {
            sink.send_frame(Frame::Text("held".into())).await.unwrap();
            sink
        });

        timeout(Duration::from_secs(2), peer.write_stalled())
            .await
            .unwrap();
        assert!(peer.try_next_frame().is_none());

        peer.resume_writes();
        let _sink = writer.await.unwrap();
        assert_eq!(peer.next_frame().await, Some(Frame::Text("held".into())));
    }

    #[test]
    fn remote_addr_is_optional() {
        let (transport, _peer) = pair();
        assert!(transport.remote_addr().is_none());
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let transport = transport.with_remote_addr(addr);
        assert_eq!(transport.remote_addr(), Some(addr));
    }
}
