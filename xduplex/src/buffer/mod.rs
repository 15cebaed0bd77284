//! Buffer management for the connection.
//!
//! This module provides:
//! - OutboundQueue: Unbounded FIFO feeding the sender worker

mod outbound;

pub use outbound::OutboundQueue;
