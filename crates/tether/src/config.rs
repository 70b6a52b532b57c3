//! Hub configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_pubsub::PubSubConfig;
use tracing::warn;

/// Smallest shard count the registry is built with.
pub const MIN_SHARD_COUNT: usize = 2;
/// Smallest inbound frame limit.
pub const MIN_FRAME_SIZE: usize = 256;

/// Tunables for a [`Hub`](crate::Hub).
///
/// Durations are stored in milliseconds so the struct maps directly onto
/// JSON settings files and environment variables.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubConfig {
    /// Registry shard count.
    pub shard_count: usize,
    /// Largest inbound frame payload in bytes.
    pub max_frame_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Deadline for a single outbound write.
    pub write_timeout_ms: u64,
    /// Longest silence tolerated from a peer before the connection is dropped.
    pub idle_timeout_ms: u64,
    /// Interval between keep-alive pings. Must be below `idle_timeout_ms`.
    pub keepalive_interval_ms: u64,
    /// Pause after sending a close frame before the transport is released.
    pub close_linger_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            max_frame_size: 512,
            outbound_capacity: 256,
            write_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            keepalive_interval_ms: 54_000,
            close_linger_ms: 100,
        }
    }
}

impl HubConfig {
    /// Apply floors and fix up inconsistent values.
    pub fn normalized(mut self) -> Self {
        self.shard_count = self.shard_count.max(MIN_SHARD_COUNT);
        self.max_frame_size = self.max_frame_size.max(MIN_FRAME_SIZE);
        self.outbound_capacity = self.outbound_capacity.max(1);
        self.idle_timeout_ms = self.idle_timeout_ms.max(1);
        if self.keepalive_interval_ms == 0 || self.keepalive_interval_ms >= self.idle_timeout_ms {
            let clamped = (self.idle_timeout_ms * 9 / 10).max(1);
            warn!(
                keepalive_interval_ms = self.keepalive_interval_ms,
                idle_timeout_ms = self.idle_timeout_ms,
                clamped,
                "keep-alive interval must be below the idle timeout"
            );
            self.keepalive_interval_ms = clamped;
        }
        self
    }

    /// Outbound write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Inbound idle-read deadline.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Keep-alive ping period.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Post-close linger.
    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    /// Broker sizing derived from the hub's own sizing.
    pub(crate) fn pubsub(&self) -> PubSubConfig {
        PubSubConfig {
            buckets: self.shard_count,
            bucket_buffer: self.outbound_capacity.saturating_mul(2),
        }
    }
}
