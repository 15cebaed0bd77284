//! Socket implementation for fd-backed std streams.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

use super::Socket;
use crate::DEFAULT_RECV_BUFFER_SIZE;
use crate::error::Result;

/// Wraps a blocking stream such as `TcpStream`, `UnixStream` or
/// `vsock::VsockStream`.
///
/// Reading and writing go through `&S`, which lets the sender and
/// receiver workers use the same stream concurrently without cloning the
/// file descriptor.
#[derive(Debug)]
pub struct StreamSocket<S> {
    inner: S,
    recv_buffer_size: usize,
}

impl<S> StreamSocket<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Sets the maximum number of bytes returned by one `receive`.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl StreamSocket<TcpStream> {
    /// Connects a TCP stream to `address:port`.
    pub fn connect(address: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((address, port))?;
        stream.set_nodelay(true)?;
        log::debug!("Connected to {}:{}", address, port);
        Ok(Self::new(stream))
    }
}

impl<S> From<S> for StreamSocket<S>
where
    S: AsRawFd,
{
    fn from(inner: S) -> Self {
        Self::new(inner)
    }
}

impl<S> Socket for StreamSocket<S>
where
    S: AsRawFd + Send + Sync + 'static,
    for<'a> &'a S: Read + Write,
{
    fn send(&self, data: &[u8]) -> Result<()> {
        let mut stream = &self.inner;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    fn receive(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.recv_buffer_size];
        let mut stream = &self.inner;
        loop {
            match stream.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn has_data_available(&self) -> Result<bool> {
        Ok(poll_readable(self.inner.as_raw_fd())?)
    }
}

/// Checks readability of `fd` with a zero-timeout `poll(2)`.
#[allow(unsafe_code)]
fn poll_readable(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        // SAFETY: `pfd` outlives the call and the count matches the single entry.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        return Ok(rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0);
    }
}
