//! Send and receive workers of a connection.
//!
//! This module provides the two worker loops and the state they share
//! with the owning connection. Each loop is driven by a `step` function
//! returning `Result<Step>`; an `Err` is the explicit `Running -> Faulted`
//! transition, after which the whole connection is stopped.

mod receiver;
mod sender;

pub(crate) use receiver::ReceiverLoop;
#[cfg(feature = "async")]
pub(crate) use receiver::panic_message;
pub(crate) use sender::SenderLoop;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::OutboundQueue;
use crate::error::Error;

/// Direction served by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Receive => write!(f, "receive"),
        }
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Worker has not been started.
    Idle,

    /// Worker thread is looping.
    Running,

    /// Worker observed a stop request or an orderly close and exited.
    Stopped,

    /// Worker hit a failure, stopped the connection and exited.
    Faulted,
}

impl WorkerState {
    /// Returns true for `Stopped` and `Faulted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Faulted)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Running,
            2 => WorkerState::Stopped,
            3 => WorkerState::Faulted,
            _ => WorkerState::Idle,
        }
    }
}

/// Atomically readable [`WorkerState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Idle as u8))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Stop,
}

/// State shared between a connection and its workers.
///
/// The sending-active flag lives inside `queue`; the receiving-active flag
/// is polled on every receiver iteration and is therefore atomic.
#[derive(Debug)]
pub(crate) struct Shared<S> {
    pub(crate) socket: S,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) receiving: AtomicBool,
    pub(crate) sender_state: StateCell,
    pub(crate) receiver_state: StateCell,
    failure: Mutex<Option<Error>>,
}

impl<S> Shared<S> {
    pub(crate) fn new(socket: S) -> Self {
        Self {
            socket,
            queue: Arc::new(OutboundQueue::new()),
            receiving: AtomicBool::new(false),
            sender_state: StateCell::new(),
            receiver_state: StateCell::new(),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Clears both active flags and wakes the sender. Idempotent.
    pub(crate) fn stop(&self) {
        self.receiving.store(false, Ordering::Release);
        self.queue.close();
    }

    /// Records `err` unless an earlier failure is already recorded.
    pub(crate) fn record_failure(&self, direction: Direction, err: Error) {
        log::warn!("{} worker failed: {}", direction, err);
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn failure(&self) -> Option<Error> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
