//! Broker configuration.

use serde::{Deserialize, Serialize};

/// Sizing for the pub/sub broker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PubSubConfig {
    /// Number of delivery buckets (one worker task each).
    pub buckets: usize,
    /// Pending deliveries each bucket can hold before `publish` fails.
    pub bucket_buffer: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            buckets: 16,
            bucket_buffer: 512,
        }
    }
}

impl PubSubConfig {
    /// Raise zero values to one.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            buckets: self.buckets.max(1),
            bucket_buffer: self.bucket_buffer.max(1),
        }
    }
}
