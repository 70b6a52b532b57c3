//! Outbound pump: drains the queue onto the transport and sends keep-alives.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{debug, trace};

use crate::config::HubConfig;
use crate::connection::Connection;
use crate::errors::{HubError, TransportError};
use crate::hub::Hub;
use crate::message::Outbound;
use crate::transport::{CloseFrame, Frame, FrameSink};

/// Write one frame under the write deadline.
async fn write<S: FrameSink>(
    sink: &mut S,
    frame: Frame,
    deadline: Duration,
) -> Result<(), TransportError> {
    match timeout(deadline, sink.send_frame(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            op: "write",
            after: deadline,
        }),
    }
}

/// Drain `rx` until a close directive, a write failure, or teardown.
///
/// On exit fires the teardown guard, sends the close frame still owed to the
/// peer, and releases the sink.
pub(crate) async fn run<S: FrameSink>(
    hub: Hub,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: S,
) {
    let config = hub.config().clone();
    let write_timeout = config.write_timeout();
    let period = config.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failed = false;

    loop {
        tokio::select! {
            biased;
            item = rx.recv() => {
                let frame = match item {
                    Some(Outbound::Text(text)) => Frame::Text(text.to_string()),
                    Some(Outbound::Binary(data)) => Frame::Binary(data),
                    Some(Outbound::Pong(data)) => Frame::Pong(data),
                    Some(Outbound::Close(reason)) => {
                        failed = send_close(&hub, &conn, &mut sink, reason, &config).await;
                        break;
                    }
                    None => {
                        failed = send_close(&hub, &conn, &mut sink, String::new(), &config).await;
                        break;
                    }
                };
                if let Err(err) = write(&mut sink, frame, write_timeout).await {
                    hub.report(&conn, &HubError::Transport(err));
                    failed = true;
                    break;
                }
            }
            _ = keepalive.tick() => {
                trace!(conn_id = %conn.id(), "keep-alive ping");
                if let Err(err) = write(&mut sink, Frame::Ping(Bytes::new()), write_timeout).await {
                    debug!(conn_id = %conn.id(), error = %err, "keep-alive ping failed");
                    failed = true;
                    break;
                }
            }
            () = conn.closed() => break,
        }
    }

    let _ = conn.begin_close();
    if !failed {
        if let Some(frame) = conn.take_close_reply() {
            match write(&mut sink, Frame::Close(Some(frame)), write_timeout).await {
                Ok(()) => sleep(config.close_linger()).await,
                Err(err) => debug!(conn_id = %conn.id(), error = %err, "close handshake not sent"),
            }
        }
    }
    if let Err(err) = sink.close().await {
        debug!(conn_id = %conn.id(), error = %err, "transport close failed");
    }
    trace!(conn_id = %conn.id(), "outbound pump stopped");
}

/// Send the close directive's frame. Returns whether the write failed.
async fn send_close<S: FrameSink>(
    hub: &Hub,
    conn: &Arc<Connection>,
    sink: &mut S,
    reason: String,
    config: &HubConfig,
) -> bool {
    conn.mark_close_sent();
    let frame = Frame::Close(Some(CloseFrame::normal(reason)));
    match write(sink, frame, config.write_timeout()).await {
        Ok(()) => {
            sleep(config.close_linger()).await;
            false
        }
        Err(err) => {
            hub.report(conn, &HubError::Transport(err));
            true
        }
    }
}
