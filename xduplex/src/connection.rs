//! Duplex connection over one stream socket.
//!
//! A [`DuplexConnection`] owns a socket and runs up to two worker threads
//! over it: a sender that drains the outbound queue and a receiver that
//! hands inbound messages to a caller-supplied handler. Any failure in
//! either worker stops both directions. Dropping the connection (or
//! calling [`DuplexConnection::shutdown`]) stops the workers and joins
//! their threads.

#[cfg(unix)]
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crate::buffer::OutboundQueue;
use crate::channel::{Direction, ReceiverLoop, SenderLoop, Shared, WorkerState};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::socket::Socket;
#[cfg(unix)]
use crate::socket::StreamSocket;

/// Cloneable producer side of a connection's outbound queue.
///
/// Handles can be moved to other threads or into a receive handler that
/// replies on the same connection.
#[derive(Debug, Clone)]
pub struct SendHandle {
    queue: Arc<OutboundQueue>,
}

impl SendHandle {
    /// Queues `message` for transmission.
    ///
    /// Never blocks beyond lock contention. Zero-length messages are
    /// rejected with [`Error::EmptyMessage`]; once the connection has been
    /// shut down or dropped, every message is rejected with a
    /// `NotConnected` transport error.
    pub fn send(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        let message = message.into();
        if message.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let len = message.len();
        self.queue.push(message)?;
        log::trace!("Queued message: {} bytes", len);
        Ok(())
    }

    /// Returns the number of messages waiting to be written.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Outcome of [`DuplexConnection::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Messages still queued when the sender stopped, oldest first.
    pub undelivered: Vec<Vec<u8>>,

    /// Final sender state.
    pub sender: WorkerState,

    /// Final receiver state.
    pub receiver: WorkerState,

    /// First failure recorded by either worker.
    pub failure: Option<Error>,
}

/// Bidirectional message connection with dedicated send and receive
/// workers.
///
/// # Example
///
/// ```rust,no_run
/// use xduplex::DuplexConnection;
///
/// let mut conn = DuplexConnection::connect("127.0.0.1", 1234)?;
/// conn.start_receiving(|message| println!("got {} bytes", message.len()))?;
/// conn.start_sending()?;
/// conn.send(b"Hello".to_vec())?;
/// # Ok::<(), xduplex::Error>(())
/// ```
pub struct DuplexConnection<S: Socket> {
    shared: Arc<Shared<S>>,
    config: ConnectionConfig,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

#[cfg(unix)]
impl DuplexConnection<StreamSocket<TcpStream>> {
    /// Connects to `address:port` over TCP.
    pub fn connect(address: &str, port: u16) -> Result<Self> {
        Self::connect_with_config(address, port, ConnectionConfig::default())
    }

    pub fn connect_with_config(address: &str, port: u16, config: ConnectionConfig) -> Result<Self> {
        let socket = StreamSocket::connect(address, port)?;
        Ok(Self::with_config(socket, config))
    }
}

impl<S: Socket> DuplexConnection<S> {
    /// Creates a connection over an established socket.
    pub fn new(socket: S) -> Self {
        Self::with_config(socket, ConnectionConfig::default())
    }

    pub fn with_config(socket: S, config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(socket)),
            config,
            sender: None,
            receiver: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Starts the sender worker.
    ///
    /// Messages queued before this call are sent first, in order.
    pub fn start_sending(&mut self) -> Result<()> {
        if self.sender.is_some() {
            return Err(Error::AlreadyStarted(Direction::Send));
        }

        self.shared.queue.open();
        self.shared.sender_state.set(WorkerState::Running);

        let worker = SenderLoop::new(self.shared.clone());
        let spawned = thread::Builder::new()
            .name(self.config.worker_name("send"))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                self.sender = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.queue.close();
                self.shared.sender_state.set(WorkerState::Idle);
                Err(Error::Spawn(Direction::Send, e.to_string()))
            }
        }
    }

    /// Starts the receiver worker.
    ///
    /// `handler` runs on the receiver thread, once per message, in arrival
    /// order. It must not block for long: nothing else is received while it
    /// runs.
    pub fn start_receiving<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        if self.receiver.is_some() {
            return Err(Error::AlreadyStarted(Direction::Receive));
        }

        self.shared.receiving.store(true, Ordering::Release);
        self.shared.receiver_state.set(WorkerState::Running);

        let worker = ReceiverLoop::new(self.shared.clone(), handler, self.config.poll_interval);
        let spawned = thread::Builder::new()
            .name(self.config.worker_name("recv"))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                self.receiver = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.receiving.store(false, Ordering::Release);
                self.shared.receiver_state.set(WorkerState::Idle);
                Err(Error::Spawn(Direction::Receive, e.to_string()))
            }
        }
    }

    /// Queues `message` for transmission. See [`SendHandle::send`].
    pub fn send(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        self.sender().send(message)
    }

    /// Returns a producer handle for this connection's outbound queue.
    pub fn sender(&self) -> SendHandle {
        SendHandle {
            queue: self.shared.queue.clone(),
        }
    }

    /// Reads directly from the socket, bypassing the receiver worker.
    ///
    /// Intended for request/response exchanges while the receiver worker is
    /// not running; reading concurrently with it splits the stream between
    /// the two readers.
    pub fn receive(&self) -> Result<Vec<u8>> {
        self.shared.socket.receive()
    }

    /// Signals both workers to stop. Idempotent and callable from any
    /// thread; does not wait for the workers to exit.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_sending(&self) -> bool {
        self.shared.queue.is_open()
    }

    pub fn is_receiving(&self) -> bool {
        self.shared.is_receiving()
    }

    pub fn sender_state(&self) -> WorkerState {
        self.shared.sender_state.get()
    }

    pub fn receiver_state(&self) -> WorkerState {
        self.shared.receiver_state.get()
    }

    /// Returns the number of messages waiting to be written.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the first failure recorded by either worker.
    pub fn failure(&self) -> Option<Error> {
        self.shared.failure()
    }

    /// Stops both workers, joins them, and returns what was left behind.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.teardown();
        ShutdownReport {
            undelivered: self.shared.queue.drain(),
            sender: self.sender_state(),
            receiver: self.receiver_state(),
            failure: self.failure(),
        }
    }

    /// Stop, wake, then join. Safe to run more than once.
    fn teardown(&mut self) {
        self.shared.stop();
        self.shared.queue.tear_down();

        for (direction, handle) in [
            (Direction::Send, self.sender.take()),
            (Direction::Receive, self.receiver.take()),
        ] {
            let Some(handle) = handle else { continue };
            if handle.thread().id() == thread::current().id() {
                // Dropped from inside the handler; the worker exits on its own.
                continue;
            }
            if handle.join().is_err() {
                log::warn!("{} worker panicked", direction);
            }
        }
    }
}

impl<S: Socket> Drop for DuplexConnection<S> {
    fn drop(&mut self) {
        self.teardown();

        let discarded = self.shared.queue.len();
        if discarded > 0 {
            log::warn!("Discarding {} undelivered messages", discarded);
        }
    }
}
