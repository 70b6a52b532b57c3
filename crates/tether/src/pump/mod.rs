//! Per-connection I/O loops.

pub(crate) mod inbound;
pub(crate) mod outbound;
