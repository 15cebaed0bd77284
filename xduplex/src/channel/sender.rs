//! Sender worker.
//!
//! Drains the outbound queue and performs blocking socket writes. The
//! queue lock is never held across a write.

use std::sync::Arc;

use super::{Direction, Shared, Step, WorkerState};
use crate::error::Result;
use crate::socket::Socket;

pub(crate) struct SenderLoop<S> {
    shared: Arc<Shared<S>>,
    messages_sent: u64,
}

impl<S: Socket> SenderLoop<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        Self {
            shared,
            messages_sent: 0,
        }
    }

    /// Runs until the queue is closed or a write fails.
    pub(crate) fn run(mut self) {
        log::debug!("Sender worker running");

        loop {
            match self.step() {
                Ok(Step::Continue) => continue,
                Ok(Step::Stop) => {
                    self.shared.sender_state.set(WorkerState::Stopped);
                    break;
                }
                Err(err) => {
                    self.shared.record_failure(Direction::Send, err);
                    self.shared.sender_state.set(WorkerState::Faulted);
                    self.shared.stop();
                    break;
                }
            }
        }

        log::debug!(
            "Sender worker exiting: state={:?}, sent={}, pending={}",
            self.shared.sender_state.get(),
            self.messages_sent,
            self.shared.queue.len()
        );
    }

    fn step(&mut self) -> Result<Step> {
        let Some(message) = self.shared.queue.next_message() else {
            return Ok(Step::Stop);
        };

        self.shared.socket.send(&message)?;
        self.messages_sent += 1;
        log::trace!("Sent message #{}: {} bytes", self.messages_sent, message.len());

        Ok(Step::Continue)
    }
}
