//! Receiver worker.
//!
//! Polls the socket for readable data, performs a blocking read, and hands
//! every message to the handler on this thread. The handler must return
//! promptly; while it runs nothing else is received.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use super::{Direction, Shared, Step, WorkerState};
use crate::error::{Error, Result};
use crate::socket::Socket;

pub(crate) struct ReceiverLoop<S, F> {
    shared: Arc<Shared<S>>,
    handler: F,
    poll_interval: Duration,
    messages_received: u64,
}

impl<S, F> ReceiverLoop<S, F>
where
    S: Socket,
    F: FnMut(Vec<u8>) + Send + 'static,
{
    pub(crate) fn new(shared: Arc<Shared<S>>, handler: F, poll_interval: Duration) -> Self {
        Self {
            shared,
            handler,
            poll_interval,
            messages_received: 0,
        }
    }

    /// Runs until receiving is cleared, the peer closes, or a read fails.
    pub(crate) fn run(mut self) {
        log::debug!("Receiver worker running");

        loop {
            match self.step() {
                Ok(Step::Continue) => continue,
                Ok(Step::Stop) => {
                    self.shared.receiving.store(false, Ordering::Release);
                    self.shared.receiver_state.set(WorkerState::Stopped);
                    break;
                }
                Err(err) => {
                    self.shared.record_failure(Direction::Receive, err);
                    self.shared.receiver_state.set(WorkerState::Faulted);
                    self.shared.stop();
                    break;
                }
            }
        }

        log::debug!(
            "Receiver worker exiting: state={:?}, received={}",
            self.shared.receiver_state.get(),
            self.messages_received
        );
    }

    fn step(&mut self) -> Result<Step> {
        if !self.shared.is_receiving() {
            return Ok(Step::Stop);
        }

        if !self.shared.socket.has_data_available()? {
            thread::sleep(self.poll_interval);
            return Ok(Step::Continue);
        }

        let message = self.shared.socket.receive()?;
        if message.is_empty() {
            log::debug!("Peer closed the connection");
            return Ok(Step::Stop);
        }
        if !self.shared.is_receiving() {
            return Ok(Step::Stop);
        }

        self.messages_received += 1;
        log::trace!(
            "Received message #{}: {} bytes",
            self.messages_received,
            message.len()
        );

        let handler = &mut self.handler;
        panic::catch_unwind(AssertUnwindSafe(|| handler(message)))
            .map_err(|payload| Error::HandlerPanicked(panic_message(payload.as_ref())))?;

        Ok(Step::Continue)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
