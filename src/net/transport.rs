//! Byte-level socket transport.
//!
//! [`Transport`] is the seam between a connection's protocol state and the
//! bytes on the wire. [`Socket`] implements it over a non-blocking mio TCP
//! stream; tests substitute an in-memory implementation.
//!
//! Sockets are edge-triggered under mio, so [`Transport::read_all`] drains
//! until the OS reports `WouldBlock`. Writes never wait: bytes the socket
//! cannot take are queued and go out on the next writable event.

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use thiserror::Error;

const READ_CHUNK: usize = 4096;

/// Largest backlog of unsent output a socket may hold.
pub const MAX_PENDING_OUTPUT: usize = 4 * 1024 * 1024;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening socket could not be created.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying OS error.
        source: io::Error,
    },
    /// Accepting a client failed.
    #[error("accept failed: {0}")]
    Accept(io::Error),
    /// Reading failed.
    #[error("read failed: {0}")]
    Read(io::Error),
    /// Writing failed or wrote zero bytes.
    #[error("write failed: {0}")]
    Write(io::Error),
    /// The peer stopped draining and the output backlog outgrew its cap.
    #[error("write backlog of {queued} bytes exceeds {limit}")]
    WriteStalled {
        /// Bytes waiting to be sent.
        queued: usize,
        /// Backlog cap.
        limit: usize,
    },
    /// The peer closed the stream.
    #[error("peer closed the connection")]
    Closed,
    /// Poll registration failed.
    #[error("poll registration failed: {0}")]
    Register(io::Error),
}

impl TransportError {
    /// OS error code, when the failure came from the OS.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Bind { source, .. } => source.raw_os_error(),
            Self::Accept(err) | Self::Read(err) | Self::Write(err) | Self::Register(err) => {
                err.raw_os_error()
            }
            Self::WriteStalled { .. } | Self::Closed => None,
        }
    }
}

/// Byte I/O over one accepted connection.
pub trait Transport: fmt::Debug {
    /// Read every byte that is immediately available.
    ///
    /// Returns an empty vector on a spurious wakeup. Fails with
    /// [`TransportError::Closed`] once the peer has closed and nothing is
    /// left to deliver.
    fn read_all(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Write `data`, queueing whatever the socket cannot take right now.
    /// Returns the number of bytes accepted, which is all of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Push queued output to the socket. Called on every readiness event.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Bytes queued and not yet written.
    fn pending_output(&self) -> usize {
        0
    }

    /// Close both directions. Calling it again is a no-op.
    fn shutdown(&mut self);

    /// Remote address; `None` when it cannot be determined.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// True once end-of-stream was seen during the last read.
    fn at_eof(&self) -> bool {
        false
    }

    /// Register for readiness.
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    /// Remove from the poll set.
    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }
}

/// A non-blocking TCP client socket.
pub struct Socket {
    stream: MioTcpStream,
    peer: Option<SocketAddr>,
    pending: BytesMut,
    eof: bool,
    shut_down: bool,
}

impl Socket {
    /// Wrap an accepted mio stream.
    #[must_use]
    pub fn new(stream: MioTcpStream, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer,
            pending: BytesMut::new(),
            eof: false,
            shut_down: false,
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("peer", &self.peer)
            .field("pending", &self.pending.len())
            .field("eof", &self.eof)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl Transport for Socket {
    fn read_all(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.eof {
            return Err(TransportError::Closed);
        }

        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    if data.is_empty() {
                        return Err(TransportError::Closed);
                    }
                    break;
                }
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Read(e)),
            }
        }
        Ok(data)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.pending.extend_from_slice(data);
        self.flush()?;
        if self.pending.len() > MAX_PENDING_OUTPUT {
            return Err(TransportError::WriteStalled {
                queued: self.pending.len(),
                limit: MAX_PENDING_OUTPUT,
            });
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(TransportError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )))
                }
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Write(e)),
            }
        }
        Ok(())
    }

    fn pending_output(&self) -> usize {
        self.pending.len()
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        // Last chance for a queued close frame; the peer may already be gone.
        let _ = self.flush();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn at_eof(&self) -> bool {
        self.eof
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

/// The listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: MioTcpListener,
}

impl Listener {
    /// Bind to `host:port`; the first resolved address wins.
    pub fn bind(host: &str, port: u16) -> Result<Self, TransportError> {
        let requested = format!("{host}:{port}");
        let addr = requested
            .to_socket_addrs()
            .map_err(|source| TransportError::Bind {
                addr: requested.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::Bind {
                addr: requested.clone(),
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
            })?;

        let inner = MioTcpListener::bind(addr).map_err(|source| TransportError::Bind {
            addr: requested,
            source,
        })?;
        Ok(Self { inner })
    }

    /// Accept one pending client; `Ok(None)` when the backlog is empty.
    pub fn accept(&self) -> Result<Option<Socket>, TransportError> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => return Ok(Some(Socket::new(stream, Some(peer)))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Accept(e)),
            }
        }
    }

    /// Local bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Register for accept readiness.
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }
}
