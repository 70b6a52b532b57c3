//! Broadcast fan-out engine.

use std::sync::Weak;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::HubError;
use crate::hub::{Hub, HubInner};
use crate::message::Broadcast;

/// Drain the broadcast queue until the hub stops or is dropped.
pub(crate) async fn run(
    hub: Weak<HubInner>,
    mut rx: mpsc::UnboundedReceiver<Broadcast>,
    stop: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let Some(inner) = hub.upgrade() else {
            break;
        };
        deliver(&Hub::from_inner(inner), &item);
    }
    debug!("fan-out engine stopped");
}

/// One registry traversal; the filter is evaluated as each record is visited.
pub(crate) fn deliver(hub: &Hub, item: &Broadcast) {
    let mut recipients = 0;
    hub.registry().for_each(|_, conn| {
        if !conn.is_open() || !item.accepts(conn) {
            return;
        }
        match conn.enqueue(item.message.clone()) {
            Ok(()) => recipients += 1,
            Err(err @ HubError::OutboundBufferFull(_)) => hub.report(conn, &err),
            Err(_) => trace!(conn_id = %conn.id(), "skipping closing connection"),
        }
    });
    counter!("tether_broadcasts_total").increment(1);
    trace!(recipients, "broadcast delivered");
}
