//! # tether-pubsub
//!
//! In-process topic publish/subscribe.
//!
//! - [`PubSub`]: process-wide broker handle; `publish` routes a payload to
//!   the bucket that owns its topic.
//! - [`Subscriber`]: one subscriber identity (typically one per connection)
//!   holding handlers for any number of topics.
//!
//! Topics hash to a fixed set of buckets. Each bucket is a bounded queue
//! drained by a single worker task, so deliveries for one topic are handled
//! in publish order and never run under a table lock.

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod errors;
pub mod subscriber;

pub use broker::PubSub;
pub use config::PubSubConfig;
pub use errors::{PubSubError, Result};
pub use subscriber::{Handler, Subscriber};
