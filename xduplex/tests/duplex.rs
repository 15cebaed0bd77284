//! Integration tests for `DuplexConnection`.
//!
//! Peers are real loopback TCP sockets driven from plain threads, or small
//! `Socket` implementations that inject failures and delays.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use xduplex::{
    ConnectionConfig, DuplexConnection, Error, MemorySocket, NullSocket, Socket, StreamSocket,
    WorkerState,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Returns a connected `(local, peer)` pair of loopback TCP streams.
fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get local address");
    let local = TcpStream::connect(addr).expect("Failed to connect to listener");
    let (peer, _) = listener.accept().expect("Failed to accept connection");
    (local, peer)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Socket whose writes fail after a given number of successes.
struct FailingSocket {
    successes: AtomicUsize,
}

impl FailingSocket {
    fn new(successes: usize) -> Self {
        Self {
            successes: AtomicUsize::new(successes),
        }
    }
}

impl Socket for FailingSocket {
    fn send(&self, _data: &[u8]) -> xduplex::Result<()> {
        let left = self.successes.load(Ordering::Acquire);
        if left == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected").into());
        }
        self.successes.store(left - 1, Ordering::Release);
        Ok(())
    }

    fn receive(&self) -> xduplex::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn has_data_available(&self) -> xduplex::Result<bool> {
        Ok(false)
    }
}

/// Socket whose first write blocks until the test releases it.
struct GatedSocket {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
    writes: Arc<AtomicUsize>,
}

impl Socket for GatedSocket {
    fn send(&self, _data: &[u8]) -> xduplex::Result<()> {
        if self.writes.fetch_add(1, Ordering::AcqRel) == 0 {
            self.entered.wait();
            self.release.wait();
        }
        Ok(())
    }

    fn receive(&self) -> xduplex::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn has_data_available(&self) -> xduplex::Result<bool> {
        Ok(false)
    }
}

#[test]
fn test_fifo_order_over_tcp() {
    init_logger();
    let (local, mut peer) = tcp_pair();
    let mut conn = DuplexConnection::new(StreamSocket::new(local));
    conn.start_sending().unwrap();

    let mut expected = Vec::new();
    for i in 0..500u32 {
        let message = format!("msg-{i:04};").into_bytes();
        expected.extend_from_slice(&message);
        conn.send(message).unwrap();
    }

    let mut received = vec![0u8; expected.len()];
    peer.read_exact(&mut received).expect("Failed to read from stream");
    assert_eq!(received, expected);
}

#[test]
fn test_fifo_order_with_many_producers() {
    init_logger();
    let (local, peer) = MemorySocket::pair();
    let mut conn = DuplexConnection::new(local);
    conn.start_sending().unwrap();

    // The counter and the push happen under one lock, so counter order is
    // enqueue order.
    let order = Arc::new(Mutex::new(0u32));
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let handle = conn.sender();
            let order = order.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let mut next = order.lock().unwrap();
                    handle.send(next.to_be_bytes().to_vec()).unwrap();
                    *next += 1;
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    for expected in 0..800u32 {
        let chunk = peer.receive().unwrap();
        assert_eq!(u32::from_be_bytes(chunk.try_into().unwrap()), expected);
    }
}

#[test]
fn test_receive_callback_sequential_on_one_thread() {
    init_logger();
    let (local, mut peer) = tcp_pair();
    let mut conn = DuplexConnection::with_config(
        StreamSocket::new(local),
        ConnectionConfig::new().with_poll_interval(Duration::from_millis(1)),
    );

    let in_handler = Arc::new(AtomicU32::new(0));
    let (tx, rx) = mpsc::channel();
    {
        let in_handler = in_handler.clone();
        conn.start_receiving(move |message| {
            assert_eq!(in_handler.fetch_add(1, Ordering::AcqRel), 0, "handler re-entered");
            thread::sleep(Duration::from_millis(5));
            tx.send((thread::current().id(), message)).unwrap();
            in_handler.fetch_sub(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    peer.write_all(b"M1").unwrap();
    let (first_thread, first) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    peer.write_all(b"M2").unwrap();
    let (second_thread, second) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(first, b"M1");
    assert_eq!(second, b"M2");
    assert_eq!(first_thread, second_thread);
    assert_ne!(first_thread, thread::current().id());
}

#[test]
fn test_echo_round_trip_over_tcp() {
    init_logger();
    let (local, remote) = tcp_pair();

    let mut server = DuplexConnection::new(StreamSocket::new(remote));
    let replies = server.sender();
    server
        .start_receiving(move |message| replies.send(message).unwrap())
        .unwrap();
    server.start_sending().unwrap();

    let mut client = DuplexConnection::new(StreamSocket::new(local));
    let (tx, rx) = mpsc::channel();
    client.start_receiving(move |m| tx.send(m).unwrap()).unwrap();
    client.start_sending().unwrap();

    client.send(b"hello duplex".to_vec()).unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 12 {
        echoed.extend(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(echoed, b"hello duplex");

    let report = client.shutdown();
    assert!(report.undelivered.is_empty());
    assert!(report.failure.is_none());
}

#[test]
fn test_stop_is_idempotent_from_many_threads() {
    init_logger();
    let mut conn = DuplexConnection::new(NullSocket::new());
    conn.start_sending().unwrap();
    conn.start_receiving(|_| {}).unwrap();

    let conn = Arc::new(conn);
    let stoppers: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    conn.stop();
                }
            })
        })
        .collect();
    for s in stoppers {
        s.join().expect("stop panicked");
    }

    assert!(!conn.is_sending());
    assert!(!conn.is_receiving());
    wait_until("workers to stop", || {
        conn.sender_state() == WorkerState::Stopped
            && conn.receiver_state() == WorkerState::Stopped
    });
}

#[test]
fn test_drop_with_blocked_sender_is_bounded() {
    init_logger();
    let (local, _peer) = tcp_pair();
    let mut conn = DuplexConnection::new(StreamSocket::new(local));
    conn.start_sending().unwrap();
    conn.start_receiving(|_| {}).unwrap();

    // Let the sender settle into waiting on the empty queue.
    thread::sleep(Duration::from_millis(20));

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let started = Instant::now();
        drop(conn);
        tx.send(started.elapsed()).unwrap();
    });

    let elapsed = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("teardown did not finish");
    assert!(elapsed < Duration::from_secs(1));
}

#[test]
fn test_send_failure_stops_both_directions() {
    init_logger();
    let mut conn = DuplexConnection::new(FailingSocket::new(2));
    conn.start_receiving(|_| {}).unwrap();
    conn.start_sending().unwrap();

    for i in 1..=4u8 {
        conn.send(vec![i]).unwrap();
    }

    wait_until("fault to stop the connection", || {
        !conn.is_sending() && !conn.is_receiving()
    });
    assert_eq!(conn.sender_state(), WorkerState::Faulted);

    let report = conn.shutdown();
    assert_eq!(report.sender, WorkerState::Faulted);
    assert_eq!(report.receiver, WorkerState::Stopped);
    assert_eq!(report.undelivered, vec![vec![4u8]]);
    match report.failure {
        Some(Error::Transport { kind, .. }) => assert_eq!(kind, std::io::ErrorKind::BrokenPipe),
        other => panic!("unexpected failure {other:?}"),
    }
}

#[test]
fn test_queued_messages_may_be_dropped_on_stop() {
    init_logger();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let writes = Arc::new(AtomicUsize::new(0));
    let socket = GatedSocket {
        entered: entered.clone(),
        release: release.clone(),
        writes: writes.clone(),
    };

    let mut conn = DuplexConnection::new(socket);
    conn.start_sending().unwrap();
    conn.send(b"in flight".to_vec()).unwrap();
    entered.wait();

    // The sender is inside the first write; these stay queued.
    conn.send(b"queued 1".to_vec()).unwrap();
    conn.send(b"queued 2".to_vec()).unwrap();
    conn.stop();
    release.wait();

    let report = conn.shutdown();
    assert_eq!(writes.load(Ordering::Acquire), 1);
    assert_eq!(report.sender, WorkerState::Stopped);
    assert_eq!(
        report.undelivered,
        vec![b"queued 1".to_vec(), b"queued 2".to_vec()]
    );
}

#[test]
fn test_peer_reset_faults_receiver() {
    init_logger();
    let (local, peer) = MemorySocket::pair();
    let mut conn = DuplexConnection::new(local);
    conn.start_sending().unwrap();
    conn.start_receiving(|_| {}).unwrap();

    peer.reset();

    wait_until("reset to stop the connection", || {
        !conn.is_sending() && !conn.is_receiving()
    });
    assert!(conn.failure().unwrap().is_transport());
}

#[test]
fn test_receive_passthrough_request_response() {
    init_logger();
    let (local, mut peer) = tcp_pair();
    let mut conn = DuplexConnection::new(StreamSocket::new(local));
    conn.start_sending().unwrap();

    let responder = thread::spawn(move || {
        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).expect("Failed to read request");
        assert_eq!(&buf, b"request");
        peer.write_all(b"response").expect("Failed to write response");
    });

    conn.send(b"request".to_vec()).unwrap();
    let mut reply = Vec::new();
    while reply.len() < 8 {
        reply.extend(conn.receive().unwrap());
    }
    assert_eq!(reply, b"response");
    responder.join().expect("Thread panicked");
}
