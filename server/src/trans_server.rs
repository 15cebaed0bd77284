use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_vsock::{VsockAddr, VsockListener};
use vsock::VMADDR_CID_ANY;
use xduplex::AsyncDuplexConnection;

use crate::WAIT_INTERVAL;

#[derive(Debug, Clone)]
pub enum ServerTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

impl FromStr for ServerTarget {
    type Err = String;

    /// Accepts `unix:PATH`, `tcp:HOST:PORT`, `vsock:PORT` or `vsock:CID:PORT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("missing scheme in {s:?}"))?;

        match scheme {
            "unix" => Ok(ServerTarget::Unix(PathBuf::from(rest))),
            "tcp" => rest
                .parse()
                .map(ServerTarget::Tcp)
                .map_err(|e| format!("bad tcp address {rest:?}: {e}")),
            "vsock" => {
                let (cid, port) = match rest.split_once(':') {
                    Some((cid, port)) => (
                        cid.parse().map_err(|e| format!("bad vsock cid {cid:?}: {e}"))?,
                        port,
                    ),
                    None => (VMADDR_CID_ANY, rest),
                };
                let port = port
                    .parse()
                    .map_err(|e| format!("bad vsock port {port:?}: {e}"))?;
                Ok(ServerTarget::Vsock { cid, port })
            }
            other => Err(format!("unknown scheme {other:?}")),
        }
    }
}

pub struct TransServer {
    target: ServerTarget,
}

impl TransServer {
    pub fn new(target: ServerTarget) -> Self {
        Self { target }
    }

    pub async fn run(&self) {
        match &self.target {
            ServerTarget::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).expect("Failed to bind Unix Socket");
                info!("Server listening on Unix Socket {:?}", path);
                loop {
                    let (stream, _) = listener.accept().await.expect("Failed to accept");
                    info!("Accepted Unix connection");
                    tokio::spawn(Self::handle_connection(stream, "unix".to_string()));
                }
            }
            ServerTarget::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.expect("Failed to bind TCP Socket");
                info!("Server listening on TCP {:?}", addr);
                loop {
                    let (stream, peer) = listener.accept().await.expect("Failed to accept");
                    info!("Accepted TCP connection from {:?}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    tokio::spawn(Self::handle_connection(stream, peer.to_string()));
                }
            }
            ServerTarget::Vsock { cid, port } => {
                let listener = VsockListener::bind(VsockAddr::new(*cid, *port))
                    .expect("Failed to bind Vsock Socket");
                info!("Server listening on Vsock CID:{} Port:{}", cid, port);
                loop {
                    let (stream, addr) = listener.accept().await.expect("Failed to accept");
                    info!("Accepted Vsock connection from {:?}", addr);
                    tokio::spawn(Self::handle_connection(stream, format!("{addr:?}")));
                }
            }
        }
    }

    /// Echoes every message received on `stream` until the peer closes it.
    pub async fn handle_connection<T>(stream: T, peer: String)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut conn = AsyncDuplexConnection::new(stream);
        let replies = conn.sender();
        let received = Arc::new(AtomicUsize::new(0));

        {
            let received = received.clone();
            conn.start_receiving(move |message| {
                received.fetch_add(message.len(), Ordering::Relaxed);
                if let Err(e) = replies.send(message) {
                    warn!("Failed to queue echo: {}", e);
                }
            })
            .expect("Failed to start receiver");
        }
        conn.start_sending().expect("Failed to start sender");

        let start = Instant::now();
        while !conn.receiver_state().is_terminal() {
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
        while conn.is_sending() && conn.pending() > 0 {
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
        let elapsed = start.elapsed();

        let report = conn.shutdown().await;
        let total = received.load(Ordering::Relaxed);
        crate::log_echo_summary(&peer, total, elapsed, &report);
    }
}
