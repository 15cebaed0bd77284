//! Duplex connection driven by tokio tasks.
//!
//! [`AsyncDuplexConnection`] keeps the contracts of
//! [`DuplexConnection`](crate::DuplexConnection) (FIFO sending, sequential
//! handler calls, fail-closed workers, explicit shutdown) but runs its
//! workers as two tasks:
//!
//! - the sender task drains an unbounded mpsc channel and writes each
//!   message to the write half of the stream;
//! - the receiver task awaits readability instead of polling.
//!
//! Both tasks watch one `CancellationToken`. Dropping the connection
//! cancels it, so tasks never outlive their connection by more than the
//! write or handler call in progress.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::DEFAULT_RECV_BUFFER_SIZE;
use crate::channel::{Direction, StateCell, WorkerState, panic_message};
use crate::connection::ShutdownReport;
use crate::error::{Error, Result};

#[derive(Debug)]
struct Status {
    sending: AtomicBool,
    receiving: AtomicBool,
    /// Messages accepted by a send handle and not yet taken by the sender.
    pending: AtomicUsize,
    sender_state: StateCell,
    receiver_state: StateCell,
    failure: Mutex<Option<Error>>,
}

impl Status {
    fn new() -> Self {
        Self {
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            sender_state: StateCell::new(),
            receiver_state: StateCell::new(),
            failure: Mutex::new(None),
        }
    }

    fn record_failure(&self, direction: Direction, err: Error) {
        log::warn!("{} task failed: {}", direction, err);
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn failure(&self) -> Option<Error> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        self.sending.store(false, Ordering::Release);
        self.receiving.store(false, Ordering::Release);
    }
}

/// Cloneable producer side of an [`AsyncDuplexConnection`].
#[derive(Debug, Clone)]
pub struct AsyncSendHandle {
    tx: UnboundedSender<Vec<u8>>,
    status: Arc<Status>,
}

impl AsyncSendHandle {
    /// Queues `message` for transmission. Never blocks or awaits.
    pub fn send(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        let message = message.into();
        if message.is_empty() {
            return Err(Error::EmptyMessage);
        }
        self.status.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(message).map_err(|_| {
            self.status.pending.fetch_sub(1, Ordering::AcqRel);
            Error::from(io::Error::new(
                io::ErrorKind::NotConnected,
                "outbound queue is gone",
            ))
        })
    }

    /// Returns the number of messages waiting to be written.
    pub fn pending(&self) -> usize {
        self.status.pending.load(Ordering::Acquire)
    }
}

/// Bidirectional message connection driven by two tokio tasks.
///
/// `start_sending` and `start_receiving` must be called from within a
/// tokio runtime.
///
/// Dropping the connection cancels both tasks but does not wait for them;
/// `shutdown().await` is the only way to wait until they have exited.
pub struct AsyncDuplexConnection<S> {
    reader: Option<ReadHalf<S>>,
    writer: Option<WriteHalf<S>>,
    tx: UnboundedSender<Vec<u8>>,
    rx: Option<UnboundedReceiver<Vec<u8>>>,
    status: Arc<Status>,
    token: CancellationToken,
    _guard: DropGuard,
    sender: Option<JoinHandle<UnboundedReceiver<Vec<u8>>>>,
    receiver: Option<JoinHandle<()>>,
    recv_buffer_size: usize,
}

impl AsyncDuplexConnection<TcpStream> {
    /// Connects to `address:port` over TCP.
    pub async fn connect(address: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> AsyncDuplexConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        Self {
            reader: Some(reader),
            writer: Some(writer),
            tx,
            rx: Some(rx),
            status: Arc::new(Status::new()),
            _guard: token.clone().drop_guard(),
            token,
            sender: None,
            receiver: None,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Sets the maximum number of bytes handed to one handler call.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Spawns the sender task.
    pub fn start_sending(&mut self) -> Result<()> {
        if self.writer.is_none() || self.rx.is_none() {
            return Err(Error::AlreadyStarted(Direction::Send));
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::Spawn(Direction::Send, e.to_string()))?;
        let (Some(writer), Some(rx)) = (self.writer.take(), self.rx.take()) else {
            return Err(Error::AlreadyStarted(Direction::Send));
        };

        self.status.sending.store(true, Ordering::Release);
        self.status.sender_state.set(WorkerState::Running);
        self.sender = Some(runtime.spawn(run_sender(
            writer,
            rx,
            self.status.clone(),
            self.token.clone(),
        )));
        Ok(())
    }

    /// Spawns the receiver task.
    ///
    /// `handler` runs on the receiver task, once per read, in arrival
    /// order; it must not block the runtime thread.
    pub fn start_receiving<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        if self.reader.is_none() {
            return Err(Error::AlreadyStarted(Direction::Receive));
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::Spawn(Direction::Receive, e.to_string()))?;
        let Some(reader) = self.reader.take() else {
            return Err(Error::AlreadyStarted(Direction::Receive));
        };

        self.status.receiving.store(true, Ordering::Release);
        self.status.receiver_state.set(WorkerState::Running);
        self.receiver = Some(runtime.spawn(run_receiver(
            reader,
            handler,
            self.status.clone(),
            self.token.clone(),
            self.recv_buffer_size,
        )));
        Ok(())
    }

    /// Queues `message` for transmission. See [`AsyncSendHandle::send`].
    pub fn send(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        self.sender().send(message)
    }

    pub fn sender(&self) -> AsyncSendHandle {
        AsyncSendHandle {
            tx: self.tx.clone(),
            status: self.status.clone(),
        }
    }

    /// Returns the number of messages waiting to be written.
    pub fn pending(&self) -> usize {
        self.status.pending.load(Ordering::Acquire)
    }

    /// Reads once from the stream, bypassing the receiver task.
    ///
    /// Fails with [`Error::AlreadyStarted`] once the receiver task owns the
    /// read half.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(Error::AlreadyStarted(Direction::Receive));
        };
        let mut buf = vec![0u8; self.recv_buffer_size];
        let n = reader.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Cancels both tasks. Idempotent.
    pub fn stop(&self) {
        self.status.clear();
        self.token.cancel();
    }

    pub fn is_sending(&self) -> bool {
        self.status.sending.load(Ordering::Acquire)
    }

    pub fn is_receiving(&self) -> bool {
        self.status.receiving.load(Ordering::Acquire)
    }

    pub fn sender_state(&self) -> WorkerState {
        self.status.sender_state.get()
    }

    pub fn receiver_state(&self) -> WorkerState {
        self.status.receiver_state.get()
    }

    pub fn failure(&self) -> Option<Error> {
        self.status.failure()
    }

    /// Cancels both tasks, waits for them, and returns what was left behind.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.stop();

        let mut rx = self.rx.take();
        if let Some(sender) = self.sender.take() {
            match sender.await {
                Ok(returned) => rx = Some(returned),
                Err(e) => log::warn!("send task ended abnormally: {}", e),
            }
        }
        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = receiver.await {
                log::warn!("receive task ended abnormally: {}", e);
            }
        }

        let mut undelivered = Vec::new();
        if let Some(mut rx) = rx {
            while let Ok(message) = rx.try_recv() {
                undelivered.push(message);
            }
        }

        ShutdownReport {
            undelivered,
            sender: self.sender_state(),
            receiver: self.receiver_state(),
            failure: self.failure(),
        }
    }
}

async fn run_sender<W>(
    mut writer: W,
    mut rx: UnboundedReceiver<Vec<u8>>,
    status: Arc<Status>,
    token: CancellationToken,
) -> UnboundedReceiver<Vec<u8>>
where
    W: AsyncWrite + Unpin,
{
    log::debug!("Sender task running");

    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        status.pending.fetch_sub(1, Ordering::AcqRel);

        let written = async {
            writer.write_all(&message).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            status.record_failure(Direction::Send, e.into());
            status.sender_state.set(WorkerState::Faulted);
            status.clear();
            token.cancel();
            return rx;
        }
        log::trace!("Sent message: {} bytes", message.len());
    }

    status.sending.store(false, Ordering::Release);
    status.sender_state.set(WorkerState::Stopped);
    log::debug!("Sender task exiting");
    rx
}

async fn run_receiver<R, F>(
    mut reader: R,
    mut handler: F,
    status: Arc<Status>,
    token: CancellationToken,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
    F: FnMut(Vec<u8>),
{
    log::debug!("Receiver task running");
    let mut buf = vec![0u8; buffer_size];

    let outcome: Result<()> = loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                log::debug!("Peer closed the connection");
                break Ok(());
            }
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };
        log::trace!("Received message: {} bytes", n);

        let message = buf[..n].to_vec();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
            break Err(Error::HandlerPanicked(panic_message(payload.as_ref())));
        }
    };

    match outcome {
        Ok(()) => {
            status.receiving.store(false, Ordering::Release);
            status.receiver_state.set(WorkerState::Stopped);
        }
        Err(err) => {
            status.record_failure(Direction::Receive, err);
            status.receiver_state.set(WorkerState::Faulted);
            status.clear();
            token.cancel();
        }
    }
    log::debug!("Receiver task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_async_send_in_order() {
        let (local, mut peer) = duplex(1024);
        let mut conn = AsyncDuplexConnection::new(local);

        conn.send(b"Hello ".to_vec()).unwrap();
        conn.start_sending().unwrap();
        conn.send(b"World".to_vec()).unwrap();

        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello World");
        assert!(conn.is_sending());
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_async_receive_and_shutdown() {
        let (local, mut peer) = duplex(1024);
        let mut conn = AsyncDuplexConnection::new(local);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start_receiving(move |m| {
            let _ = tx.send(m);
        })
        .unwrap();

        peer.write_all(b"ping").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"ping");

        let report = conn.shutdown().await;
        assert_eq!(report.receiver, WorkerState::Stopped);
        assert_eq!(report.sender, WorkerState::Idle);
        assert!(report.failure.is_none());
    }

    #[tokio::test]
    async fn test_async_shutdown_returns_undelivered() {
        let (local, _peer) = duplex(1024);
        let conn = AsyncDuplexConnection::new(local);

        conn.send(b"a".to_vec()).unwrap();
        conn.send(b"b".to_vec()).unwrap();
        assert_eq!(conn.send(Vec::new()), Err(Error::EmptyMessage));
        assert_eq!(conn.pending(), 2);

        let report = conn.shutdown().await;
        assert_eq!(report.undelivered, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_async_write_failure_stops_both() {
        let (local, peer) = duplex(1024);
        let mut conn = AsyncDuplexConnection::new(local);
        conn.start_receiving(|_| {}).unwrap();
        conn.start_sending().unwrap();

        drop(peer);
        conn.send(b"nobody listens".to_vec()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.is_sending() || conn.is_receiving() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let report = conn.shutdown().await;
        assert!(report.sender.is_terminal());
        assert!(report.receiver.is_terminal());
    }

    #[tokio::test]
    async fn test_async_handler_panic_faults_receiver() {
        let (local, mut peer) = duplex(64);
        let mut conn = AsyncDuplexConnection::new(local);
        conn.start_receiving(|_| panic!("handler blew up")).unwrap();

        peer.write_all(b"boom").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !conn.receiver_state().is_terminal() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let report = conn.shutdown().await;
        assert_eq!(report.receiver, WorkerState::Faulted);
        assert_eq!(
            report.failure,
            Some(Error::HandlerPanicked("handler blew up".to_string()))
        );
    }

    #[tokio::test]
    async fn test_async_start_twice() {
        let (local, _peer) = duplex(64);
        let mut conn = AsyncDuplexConnection::new(local);

        conn.start_sending().unwrap();
        assert_eq!(
            conn.start_sending(),
            Err(Error::AlreadyStarted(Direction::Send))
        );
    }

    #[tokio::test]
    async fn test_async_receive_passthrough() {
        let (local, mut peer) = duplex(64);
        let mut conn = AsyncDuplexConnection::new(local);

        peer.write_all(b"reply").await.unwrap();
        assert_eq!(conn.receive().await.unwrap(), b"reply");

        conn.start_receiving(|_| {}).unwrap();
        assert!(conn.receive().await.is_err());
    }

    #[test]
    fn test_start_outside_runtime() {
        let (local, _peer) = duplex(64);
        let mut conn = AsyncDuplexConnection::new(local);

        assert_eq!(
            conn.start_sending().unwrap_err().kind(),
            crate::error::ErrorKind::Spawn
        );
        assert!(!conn.is_sending());
        assert_eq!(conn.send(b"kept".to_vec()), Ok(()));
    }
}
