//! In-memory connected socket pair.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::Socket;
use crate::error::Result;

#[derive(Debug, Default)]
struct PipeState {
    chunks: VecDeque<Vec<u8>>,
    /// Writer closed its end; reads return empty once drained.
    closed: bool,
    /// Connection was reset; both reads and writes fail.
    reset: bool,
}

/// One direction of a [`MemorySocket`] pair.
#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")
}

/// One end of an in-memory connected socket pair.
///
/// Data written on one end is read on the other. Every `send` is
/// delivered as one chunk, so a `receive` returns exactly what one `send`
/// wrote. This keeps message boundaries observable in tests, which a real
/// stream would not.
#[derive(Debug)]
pub struct MemorySocket {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

impl MemorySocket {
    /// Creates two connected ends.
    pub fn pair() -> (MemorySocket, MemorySocket) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());

        let a = MemorySocket {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
        };
        let b = MemorySocket {
            incoming: a_to_b,
            outgoing: b_to_a,
        };
        (a, b)
    }

    /// Closes the write side; the peer reads an empty message once it has
    /// drained what was already sent.
    pub fn close(&self) {
        self.outgoing.lock().closed = true;
        self.outgoing.readable.notify_all();
    }

    /// Resets the connection in both directions.
    ///
    /// Pending data is discarded and every later `send` or `receive` on
    /// either end fails with `ConnectionReset`.
    pub fn reset(&self) {
        for pipe in [&self.incoming, &self.outgoing] {
            let mut state = pipe.lock();
            state.reset = true;
            state.chunks.clear();
            drop(state);
            pipe.readable.notify_all();
        }
    }

    /// Returns the number of chunks waiting to be read on this end.
    pub fn available(&self) -> usize {
        self.incoming.lock().chunks.len()
    }
}

impl Socket for MemorySocket {
    fn send(&self, data: &[u8]) -> Result<()> {
        let mut state = self.outgoing.lock();
        if state.reset {
            return Err(reset_error().into());
        }
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write side closed").into());
        }
        state.chunks.push_back(data.to_vec());
        drop(state);
        self.outgoing.readable.notify_one();
        Ok(())
    }

    fn receive(&self) -> Result<Vec<u8>> {
        let mut state = self.incoming.lock();
        loop {
            if state.reset {
                return Err(reset_error().into());
            }
            if let Some(chunk) = state.chunks.pop_front() {
                return Ok(chunk);
            }
            if state.closed {
                return Ok(Vec::new());
            }
            state = self
                .incoming
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn has_data_available(&self) -> Result<bool> {
        let state = self.incoming.lock();
        Ok(!state.chunks.is_empty() || state.closed || state.reset)
    }
}
