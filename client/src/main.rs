mod trans_client;

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use vsock::{VsockAddr, VsockStream};
use xduplex::{DuplexConnection, ShutdownReport, Socket, StreamSocket};

use trans_client::{ClientTarget, TransClient};

pub(crate) const MESSAGE_SIZE: usize = 64 * 1024; // 64 KB
pub(crate) const MESSAGE_COUNT: usize = 1024; // 64 MB in total
pub(crate) const PATTERN: u8 = 0xAB;
pub(crate) const ECHO_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const WAIT_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) const DEFAULT_SERVER_CID: u32 = 3; // 2 for host, 103 for qemu, 3 for pvm
const DEFAULT_TARGET: &str = "vsock:3:1234";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut target = DEFAULT_TARGET.to_string();
    let mut use_async = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--async" => use_async = true,
            _ => target = arg,
        }
    }
    let target: ClientTarget = target.parse().expect("Invalid target");

    if use_async {
        let runtime = tokio::runtime::Runtime::new().expect("Failed to start tokio runtime");
        runtime.block_on(TransClient::new(target).run());
        return;
    }

    info!("Connecting to server at {:?}...", target);
    match target {
        ClientTarget::Unix(path) => {
            let stream = UnixStream::connect(&path).expect("Failed to connect to server");
            info!("Connected!");
            run(StreamSocket::new(stream));
        }
        ClientTarget::Tcp(addr) => {
            let stream = TcpStream::connect(addr).expect("Failed to connect to server");
            stream.set_nodelay(true).expect("Failed to set TCP_NODELAY");
            info!("Connected!");
            run(StreamSocket::new(stream));
        }
        ClientTarget::Vsock { cid, port } => {
            let addr = VsockAddr::new(cid, port);
            let stream = VsockStream::connect(&addr).expect("Failed to connect to server");
            info!("Connected!");
            run(StreamSocket::new(stream));
        }
    }
}

/// Sends the batch over a blocking connection and waits for the echoes.
fn run<S: Socket>(socket: S) {
    let mut conn = DuplexConnection::new(socket);
    let (tx, rx) = mpsc::channel();
    let corrupted = Arc::new(AtomicUsize::new(0));

    {
        let corrupted = corrupted.clone();
        conn.start_receiving(move |message| {
            let bad = message.iter().filter(|&&b| b != PATTERN).count();
            corrupted.fetch_add(bad, Ordering::Relaxed);
            let _ = tx.send(message.len());
        })
        .expect("Failed to start receiver");
    }
    conn.start_sending().expect("Failed to start sender");

    info!(
        "Sending {} messages of {} KB...",
        MESSAGE_COUNT,
        MESSAGE_SIZE / 1024
    );
    let total = MESSAGE_SIZE * MESSAGE_COUNT;
    let start = Instant::now();
    for _ in 0..MESSAGE_COUNT {
        conn.send(vec![PATTERN; MESSAGE_SIZE])
            .expect("Failed to queue message");
    }
    while conn.is_sending() && conn.pending() > 0 {
        thread::sleep(WAIT_INTERVAL);
    }
    log_transfer("Send", total, start.elapsed());

    info!("Receiving echoes from server...");
    let deadline = Instant::now() + ECHO_TIMEOUT;
    let mut received = 0;
    while received < total {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(n) => received += n,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                error!("Timed out waiting for echoes");
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                error!("Receiver stopped before all echoes arrived");
                break;
            }
        }
    }
    log_transfer("Receive", received, start.elapsed());

    let report = conn.shutdown();
    log_report(received, total, corrupted.load(Ordering::Relaxed), &report);
}

pub(crate) fn log_transfer(phase: &str, bytes: usize, elapsed: Duration) {
    let speed = (bytes as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON);

    info!("=== {} Complete ===", phase);
    info!("Total: {} MB", bytes / 1024 / 1024);
    info!("Time: {:.2} seconds", elapsed.as_secs_f64());
    info!("Speed: {:.2} MB/s", speed);
}

pub(crate) fn log_report(received: usize, expected: usize, corrupted: usize, report: &ShutdownReport) {
    if received == expected && corrupted == 0 {
        info!("Data matches exactly");
    } else {
        warn!(
            "Data does not match: {} of {} bytes echoed, {} corrupted",
            received, expected, corrupted
        );
    }
    if !report.undelivered.is_empty() {
        warn!("Undelivered messages: {}", report.undelivered.len());
    }
    if let Some(failure) = &report.failure {
        error!("Connection failed: {}", failure);
    }
}
