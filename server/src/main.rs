mod trans_server;

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use vsock::{VsockAddr, VsockListener};
use xduplex::{DuplexConnection, ShutdownReport, Socket, StreamSocket};

use trans_server::{ServerTarget, TransServer};

const DEFAULT_TARGET: &str = "vsock:1234";

/// How often a connection handler checks whether its peer has gone.
pub(crate) const WAIT_INTERVAL: Duration = Duration::from_millis(20);

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
    let target: ServerTarget = target.parse().expect("Invalid target");

    if use_async {
        info!("Starting async echo server on {:?}", target);
        let runtime = tokio::runtime::Runtime::new().expect("Failed to start tokio runtime");
        runtime.block_on(TransServer::new(target).run());
        return;
    }

    info!("Starting echo server on {:?}", target);
    match target {
        ServerTarget::Unix(path) => {
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).expect("Failed to bind Unix Socket");
            info!("Server listening on Unix Socket {:?}", path);
            for stream in listener.incoming() {
                let stream = stream.expect("Failed to accept");
                info!("Accepted Unix connection");
                spawn_echo(StreamSocket::new(stream), "unix".to_string());
            }
        }
        ServerTarget::Tcp(addr) => {
            let listener = TcpListener::bind(addr).expect("Failed to bind TCP Socket");
            info!("Server listening on TCP {:?}", addr);
            for stream in listener.incoming() {
                let stream = stream.expect("Failed to accept");
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                info!("Accepted TCP connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                spawn_echo(StreamSocket::new(stream), peer);
            }
        }
        ServerTarget::Vsock { cid, port } => {
            let addr = VsockAddr::new(cid, port);
            let listener = VsockListener::bind(&addr).expect("Failed to bind to vsock");
            info!("Server listening on {:?}", addr);
            loop {
                let (stream, peer) = listener.accept().expect("Failed to accept connection");
                info!("Accepted Vsock connection from {:?}", peer);
                spawn_echo(StreamSocket::new(stream), format!("{peer:?}"));
            }
        }
    }
}

fn spawn_echo<S: Socket>(socket: S, peer: String) {
    let spawned = thread::Builder::new()
        .name(format!("echo-{peer}"))
        .spawn(move || echo(socket, peer));
    if let Err(e) = spawned {
        warn!("Failed to spawn connection handler: {}", e);
    }
}

/// Echoes every message back until the peer closes the connection.
fn echo<S: Socket>(socket: S, peer: String) {
    let mut conn = DuplexConnection::new(socket);
    let replies = conn.sender();
    let received = Arc::new(AtomicUsize::new(0));

    {
        let received = received.clone();
        let started = conn.start_receiving(move |message| {
            received.fetch_add(message.len(), Ordering::Relaxed);
            if let Err(e) = replies.send(message) {
                warn!("Failed to queue echo: {}", e);
            }
        });
        if let Err(e) = started.and_then(|()| conn.start_sending()) {
            warn!("[{}] Failed to start connection: {}", peer, e);
            return;
        }
    }

    let start = Instant::now();
    while !conn.receiver_state().is_terminal() {
        thread::sleep(WAIT_INTERVAL);
    }
    // Let the sender flush echoes queued before the peer closed.
    while conn.is_sending() && conn.pending() > 0 {
        thread::sleep(WAIT_INTERVAL);
    }
    let elapsed = start.elapsed();

    let report = conn.shutdown();
    log_echo_summary(&peer, received.load(Ordering::Relaxed), elapsed, &report);
}

pub(crate) fn log_echo_summary(
    peer: &str,
    total: usize,
    elapsed: Duration,
    report: &ShutdownReport,
) {
    let speed = (total as f64 / 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON);

    info!("=== Echo Complete [{}] ===", peer);
    info!("Total echoed: {} KB", total / 1024);
    info!("Time: {:.2} seconds", elapsed.as_secs_f64());
    info!("Speed: {:.2} KB/s", speed);
    if !report.undelivered.is_empty() {
        warn!("Undelivered replies: {}", report.undelivered.len());
    }
    if let Some(failure) = &report.failure {
        warn!("Connection failed: {}", failure);
    }
}
