//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has started.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Pub/sub topics with at least one subscriber.
    pub topics: Vec<String>,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    connections: usize,
    mut topics: Vec<String>,
) -> HealthResponse {
    topics.sort();
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        topics,
    }
}
