//! Inbound pump: reads frames and dispatches them to the handler.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, instrument, trace};

use crate::connection::Connection;
use crate::errors::{CLOSE_NO_STATUS, HubError, TransportError, is_expected_close_code};
use crate::hub::Hub;
use crate::transport::{Frame, FrameSource};

/// Read until the peer goes away, a read fails, or teardown begins.
#[instrument(skip_all, fields(conn_id = %conn.id()))]
pub(crate) async fn run<S: FrameSource>(hub: &Hub, conn: &Arc<Connection>, mut source: S) {
    let idle = hub.config().idle_timeout();
    source.set_max_frame_size(hub.config().max_frame_size);
    let handler = hub.handler();

    loop {
        let next = tokio::select! {
            biased;
            () = conn.closed() => {
                trace!("teardown signalled");
                break;
            }
            next = timeout(idle, source.next_frame()) => next,
        };

        let frame = match next {
            Err(_) => {
                hub.report(
                    conn,
                    &HubError::Transport(TransportError::Timeout {
                        op: "read",
                        after: idle,
                    }),
                );
                break;
            }
            Ok(None) => {
                debug!("peer went away");
                break;
            }
            Ok(Some(Err(err))) => {
                if err.is_normal_closure() {
                    debug!(error = %err, "read ended");
                } else {
                    hub.report(conn, &HubError::Transport(err));
                }
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Text(text) => handler.on_text(hub, conn, text),
            Frame::Binary(data) => handler.on_binary(hub, conn, data),
            Frame::Ping(data) => conn.queue_pong(data),
            Frame::Pong(_) => handler.on_keepalive_response(hub, conn),
            Frame::Close(close) => {
                let (code, reason) = close.map_or((CLOSE_NO_STATUS, String::new()), |c| {
                    (c.code, c.reason)
                });
                debug!(code, reason = %reason, "peer sent close");
                let reply = handler.on_close_frame(hub, conn, code, &reason);
                conn.on_peer_close(reply, code, &reason);
                if !is_expected_close_code(code) {
                    hub.report(
                        conn,
                        &HubError::Transport(TransportError::PeerClosed { code, reason }),
                    );
                }
                break;
            }
        }
    }
}
