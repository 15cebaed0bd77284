//! Outbound message queue shared by producers and the sender worker.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    /// Messages waiting to be written, oldest first.
    messages: VecDeque<Vec<u8>>,

    /// Sending-active flag. Guarded by the same mutex as `messages` so that
    /// closing and waiting cannot race.
    open: bool,

    /// Owning connection is gone; nothing will ever drain the queue again.
    /// Unlike `open`, this never goes back to false.
    torn_down: bool,
}

/// Unbounded FIFO of outbound messages.
///
/// Any number of threads may [`push`](Self::push); exactly one consumer
/// (the sender worker) calls [`next_message`](Self::next_message). The
/// condition variable signals "a message arrived or the queue was closed".
#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl OutboundQueue {
    /// Creates an empty, closed queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message and wakes one waiting consumer.
    ///
    /// Fails with a `NotConnected` transport error once the queue has been
    /// torn down.
    pub fn push(&self, message: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        if state.torn_down {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::NotConnected,
                "outbound queue is gone",
            )));
        }
        state.messages.push_back(message);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Returns the next message, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed, even if messages remain.
    /// Wakeups that bring neither a message nor a close are ignored.
    pub fn next_message(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        loop {
            if !state.open {
                return None;
            }
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks the queue as being consumed.
    pub fn open(&self) {
        self.lock().open = true;
    }

    /// Clears the sending flag and wakes every waiting consumer.
    ///
    /// The flag is cleared under the lock and the wakeup is sent after the
    /// lock is released, so a consumer cannot re-enter `wait` after the
    /// flag changed without being notified.
    pub fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        drop(state);
        self.available.notify_all();
    }

    /// Closes the queue for good: later pushes are rejected.
    pub fn tear_down(&self) {
        let mut state = self.lock();
        state.open = false;
        state.torn_down = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Returns the number of queued messages.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Removes and returns every queued message.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.lock().messages.drain(..).collect()
    }

    /// Wakes waiting consumers without changing the queue.
    pub fn wake(&self) {
        self.available.notify_all();
    }
}
