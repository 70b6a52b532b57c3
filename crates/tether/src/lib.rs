//! # tether
//!
//! A hub for many long-lived duplex connections.
//!
//! Connections are admitted with [`Hub::register`], which runs the inbound
//! pump on the caller's task and an outbound pump on a spawned task. Messages
//! are routed to one connection ([`Hub::send_text`]), to all of them
//! ([`Hub::broadcast_text`]), or to those matching a predicate evaluated at
//! delivery time ([`Hub::broadcast_text_where`]). Each connection also gets a
//! pub/sub identity whose subscriptions are dropped first during teardown.
//!
//! Teardown runs exactly once per connection no matter how many triggers fire
//! (read error, write error, close directive, hub shutdown).

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod errors;
pub mod handler;
pub mod hub;
pub mod transport;

mod fanout;
mod message;
mod pump;

pub use config::HubConfig;
pub use connection::Connection;
pub use errors::{HubError, Result, TransportError};
pub use handler::{CloseReply, Handler, NoopHandler};
pub use hub::Hub;
pub use message::Predicate;
pub use tether_pubsub::PubSubError;
