//! # tether-server
//!
//! Demo WebSocket server for the tether hub.
//!
//! - `GET /ws/{id}` upgrades to a WebSocket and registers the connection with
//!   an `id` attribute taken from the path
//! - `GET /health` reports uptime, connection count and live topics
//! - a clock task publishes RFC 3339 timestamps to a pub/sub topic

#![deny(unsafe_code)]

pub mod clock;
pub mod demo;
pub mod health;
pub mod server;
pub mod settings;
pub mod shutdown;
