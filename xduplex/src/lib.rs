//! # XDuplex - A Duplex Message Connection
//!
//! XDuplex turns a point-to-point stream socket into a bidirectional,
//! asynchronous message channel:
//!
//! - **Decoupled sending**: Producers enqueue messages without blocking on I/O
//! - **Ordered delivery**: Messages reach the socket in enqueue order
//! - **Callback reception**: Inbound data is handed to a caller-supplied handler
//! - **Fail-closed workers**: Any transport failure stops both directions
//! - **Deterministic shutdown**: Workers are signalled, woken and joined
//!
//! Framing, encryption and retries belong to the protocol layered on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Protocol Layer (caller)                 │
//! │        send() ▼                        ▲ handler(msg)   │
//! ├─────────────────────────────────────────────────────────┤
//! │                    DuplexConnection                     │
//! │  ┌──────────────────┐            ┌──────────────────┐   │
//! │  │  OutboundQueue   │            │                  │   │
//! │  │ (Mutex+Condvar)  │            │  Receiver worker │   │
//! │  └────────┬─────────┘            │  (poll + read)   │   │
//! │  ┌────────▼─────────┐            │                  │   │
//! │  │  Sender worker   │            │                  │   │
//! │  └────────┬─────────┘            └────────▲─────────┘   │
//! ├───────────┼───────────────────────────────┼─────────────┤
//! │           ▼          Socket trait         │             │
//! │   ┌───────────────────────────────────────────────┐     │
//! │   │    StreamSocket (TCP / Unix / vsock), ...     │     │
//! │   └───────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use xduplex::{DuplexConnection, StreamSocket};
//!
//! let socket = StreamSocket::connect("127.0.0.1", 1234)?;
//! let mut conn = DuplexConnection::new(socket);
//!
//! conn.start_receiving(|message| println!("{} bytes", message.len()))?;
//! conn.start_sending()?;
//! conn.send(b"Hello, World!".to_vec())?;
//!
//! // Stops both workers and joins them.
//! let report = conn.shutdown();
//! ```

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod socket;

#[cfg(feature = "async")]
pub mod asynchronous;

// Re-export commonly used types
pub use channel::{Direction, WorkerState};
pub use config::ConnectionConfig;
pub use connection::{DuplexConnection, SendHandle, ShutdownReport};
pub use error::{Error, ErrorKind, Result};
pub use socket::{MemorySocket, NullSocket, Socket};
#[cfg(unix)]
pub use socket::StreamSocket;

#[cfg(feature = "async")]
pub use asynchronous::{AsyncDuplexConnection, AsyncSendHandle};

/// Default receiver polling interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default maximum bytes returned by one socket read
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Default worker thread name prefix
pub const DEFAULT_THREAD_NAME: &str = "xduplex";
