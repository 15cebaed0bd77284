//! Raw socket abstraction.
//!
//! This module provides the `Socket` trait through which a connection
//! talks to the underlying point-to-point stream. The connection owns its
//! socket exclusively and shares it between its two workers: the sender
//! worker only calls [`Socket::send`], the receiver worker only calls
//! [`Socket::has_data_available`] and [`Socket::receive`]. Every method
//! therefore takes `&self`.
//!
//! # Implementations
//!
//! - `StreamSocket`: Wraps fd-backed std streams (TCP, Unix, vsock)
//! - `MemorySocket`: In-memory connected pair for testing
//! - `NullSocket`: Discards all data (testing)

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;

mod memory;
#[cfg(unix)]
mod stream;

pub use memory::MemorySocket;
#[cfg(unix)]
pub use stream::StreamSocket;

/// A connected, bidirectional byte stream.
pub trait Socket: Send + Sync + 'static {
    /// Writes the whole message, blocking until it has been handed to the OS.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Blocks until some data arrives and returns it.
    ///
    /// Returns an empty vector when the peer closed the stream in an
    /// orderly way.
    fn receive(&self) -> Result<Vec<u8>>;

    /// Returns true if a call to [`Socket::receive`] would not block.
    ///
    /// A pending orderly close or error also counts as available, so the
    /// following `receive` can report it.
    fn has_data_available(&self) -> Result<bool>;
}

/// A socket that discards all writes and never has anything to read.
///
/// Useful for testing or measuring overhead.
#[derive(Debug, Default)]
pub struct NullSocket {
    bytes_written: AtomicUsize,
}

impl NullSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of bytes written.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::Acquire)
    }
}

impl Socket for NullSocket {
    fn send(&self, data: &[u8]) -> Result<()> {
        self.bytes_written.fetch_add(data.len(), Ordering::AcqRel);
        Ok(())
    }

    fn receive(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn has_data_available(&self) -> Result<bool> {
        Ok(false)
    }
}
