//! Integration tests for `AsyncDuplexConnection` over loopback TCP.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use xduplex::{AsyncDuplexConnection, WorkerState};

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (local, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (local.unwrap(), accepted.unwrap().0)
}

#[tokio::test]
async fn test_async_echo_over_tcp() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (local, remote) = tcp_pair().await;

    let mut server = AsyncDuplexConnection::new(remote);
    let replies = server.sender();
    server
        .start_receiving(move |message| replies.send(message).unwrap())
        .unwrap();
    server.start_sending().unwrap();

    let mut client = AsyncDuplexConnection::new(local);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .start_receiving(move |message| {
            let _ = tx.send(message);
        })
        .unwrap();
    client.start_sending().unwrap();

    let mut expected = Vec::new();
    for i in 0..100u32 {
        let message = format!("async-{i:03};").into_bytes();
        expected.extend_from_slice(&message);
        client.send(message).unwrap();
    }

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while echoed.len() < expected.len() {
            echoed.extend(rx.recv().await.unwrap());
        }
    })
    .await
    .expect("echoes did not arrive");
    assert_eq!(echoed, expected);

    let report = client.shutdown().await;
    assert!(report.undelivered.is_empty());
    assert!(report.failure.is_none());
    assert_eq!(report.sender, WorkerState::Stopped);

    let report = server.shutdown().await;
    assert!(report.failure.is_none());
}

#[tokio::test]
async fn test_async_peer_close_stops_receiver() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (local, mut peer) = tcp_pair().await;

    let mut conn = AsyncDuplexConnection::new(local);
    conn.start_receiving(|_| {}).unwrap();
    conn.start_sending().unwrap();

    peer.write_all(b"last words").await.unwrap();
    peer.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.receiver_state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("receiver did not stop");

    assert_eq!(conn.receiver_state(), WorkerState::Stopped);
    assert!(conn.is_sending());

    // The write half still works after the peer stopped writing.
    conn.send(b"bye".to_vec()).unwrap();
    let mut buf = [0u8; 3];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bye");

    let report = conn.shutdown().await;
    assert!(report.failure.is_none());
}
