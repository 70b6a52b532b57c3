//! Periodic server-time publisher.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tether::Hub;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Publish the current time to `topic` every `period` until `stop` fires.
pub async fn run_clock(hub: Hub, topic: String, period: Duration, stop: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(topic = %topic, ?period, "clock started");

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                if let Err(err) = hub.publish(&topic, now) {
                    warn!(topic = %topic, error = %err, "failed to publish server time");
                }
            }
        }
    }
    debug!(topic = %topic, "clock stopped");
}
