use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_vsock::{VsockAddr, VsockStream};
use xduplex::AsyncDuplexConnection;

use crate::{
    DEFAULT_SERVER_CID, ECHO_TIMEOUT, MESSAGE_COUNT, MESSAGE_SIZE, PATTERN, WAIT_INTERVAL,
};

#[derive(Debug, Clone)]
pub enum ClientTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

impl FromStr for ClientTarget {
    type Err = String;

    /// Accepts `unix:PATH`, `tcp:HOST:PORT`, `vsock:PORT` or `vsock:CID:PORT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("missing scheme in {s:?}"))?;

        match scheme {
            "unix" => Ok(ClientTarget::Unix(PathBuf::from(rest))),
            "tcp" => rest
                .parse()
                .map(ClientTarget::Tcp)
                .map_err(|e| format!("bad tcp address {rest:?}: {e}")),
            "vsock" => {
                let (cid, port) = match rest.split_once(':') {
                    Some((cid, port)) => (
                        cid.parse().map_err(|e| format!("bad vsock cid {cid:?}: {e}"))?,
                        port,
                    ),
                    None => (DEFAULT_SERVER_CID, rest),
                };
                let port = port
                    .parse()
                    .map_err(|e| format!("bad vsock port {port:?}: {e}"))?;
                Ok(ClientTarget::Vsock { cid, port })
            }
            other => Err(format!("unknown scheme {other:?}")),
        }
    }
}

pub struct TransClient {
    target: ClientTarget,
}

impl TransClient {
    pub fn new(target: ClientTarget) -> Self {
        Self { target }
    }

    pub async fn run(&self) {
        info!("Connecting to target: {:?}", self.target);
        match &self.target {
            ClientTarget::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .expect("Failed to connect Unix Socket");
                info!("Unix socket connected.");
                Self::process_stream(stream).await;
            }
            ClientTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .expect("Failed to connect TCP Socket");
                stream.set_nodelay(true).expect("Failed to set TCP_NODELAY");
                info!("TCP socket connected.");
                Self::process_stream(stream).await;
            }
            ClientTarget::Vsock { cid, port } => {
                let stream = VsockStream::connect(VsockAddr::new(*cid, *port))
                    .await
                    .expect("Failed to connect Vsock Socket");
                info!("Vsock socket connected.");
                Self::process_stream(stream).await;
            }
        }
    }

    /// Sends the batch, then waits until every byte has been echoed back.
    async fn process_stream<T>(stream: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut conn = AsyncDuplexConnection::new(stream);
        let (tx, mut rx) = mpsc::unbounded_channel();
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

        // Send messages and test performance
        let total = MESSAGE_SIZE * MESSAGE_COUNT;
        let start = Instant::now();
        for _ in 0..MESSAGE_COUNT {
            conn.send(vec![PATTERN; MESSAGE_SIZE])
                .expect("Failed to queue message");
        }
        while conn.is_sending() && conn.pending() > 0 {
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
        let elapsed = start.elapsed();
        crate::log_transfer("Send", total, elapsed);

        // Read echoes
        let mut received = 0;
        let waited = tokio::time::timeout(ECHO_TIMEOUT, async {
            while received < total {
                match rx.recv().await {
                    Some(n) => received += n,
                    None => break,
                }
            }
        })
        .await;
        if waited.is_err() {
            error!("Timed out waiting for echoes");
        }
        let elapsed = start.elapsed();
        crate::log_transfer("Receive", received, elapsed);

        let report = conn.shutdown().await;
        crate::log_report(received, total, corrupted.load(Ordering::Relaxed), &report);
    }
}
