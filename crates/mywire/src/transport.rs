//! Non-blocking byte transport.
//!
//! Sockets are switched to non-blocking mode and registered with a
//! per-socket [`polling::Poller`]. Reads and writes that would block wait
//! for readiness, bounded by the configured timeout; exceeding it returns
//! [`Error::Timeout`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use mywire_core::error::ConnectionErrorKind;
use mywire_core::{Error, Result};
use polling::{Event, Poller};

use crate::config::{ClientConfig, Target};
use crate::error::{connection_error, io_connection_error};

/// Largest number of bytes requested from the socket in one read.
pub const MAX_READ: usize = 32768;

const POLL_KEY: usize = 7;

#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// A non-blocking TCP or unix socket with readiness waiting.
pub struct Socket {
    stream: Stream,
    poller: Poller,
    events: Vec<Event>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("stream", &self.stream)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl Socket {
    fn new(stream: Stream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let poller = Poller::new()?;
        poller.add(&stream, Event::none(POLL_KEY))?;
        Ok(Self {
            stream,
            poller,
            events: Vec::with_capacity(1),
            read_timeout: None,
            write_timeout: None,
        })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self.stream, Stream::Unix(_))
    }

    pub(crate) fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Deadline for one read operation, from the read timeout.
    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_timeout.map(|t| Instant::now() + t)
    }

    /// Deadline for one write operation, from the write timeout.
    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_timeout.map(|t| Instant::now() + t)
    }

    /// Block until the socket is readable or `deadline` passes.
    pub fn wait_readable(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.wait(Event::readable(POLL_KEY), deadline)
    }

    /// Block until the socket is writable or `deadline` passes.
    pub fn wait_writable(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.wait(Event::writable(POLL_KEY), deadline)
    }

    fn wait(&mut self, interest: Event, deadline: Option<Instant>) -> Result<()> {
        // Interest is oneshot; re-arm before every wait.
        self.poller.modify(&self.stream, interest)?;

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            self.events.clear();
            match self.poller.wait(&mut self.events, remaining) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(io_connection_error(
                        ConnectionErrorKind::Disconnected,
                        "readiness wait failed",
                        e,
                    ));
                }
            }

            let ready = self.events.iter().any(|ev| {
                ev.key == POLL_KEY
                    && ((interest.readable && ev.readable) || (interest.writable && ev.writable))
            });
            if ready {
                return Ok(());
            }
        }
    }

    /// Read at most `buf.len()` bytes, waiting for data if none is ready.
    ///
    /// The peer closing the connection is an error, never `Ok(0)`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = self.read_deadline();
        loop {
            match self.stream.read(buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        "connection closed by server",
                    ));
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_readable(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(io_connection_error(
                        ConnectionErrorKind::Disconnected,
                        "read failed",
                        e,
                    ));
                }
            }
        }
    }

    /// Write some of `buf`, waiting for writability if the socket is full.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let deadline = self.write_deadline();
        loop {
            match self.stream.write(buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        "connection closed while writing",
                    ));
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(io_connection_error(
                        ConnectionErrorKind::Disconnected,
                        "write failed",
                        e,
                    ));
                }
            }
        }
    }

    pub(crate) fn close(&mut self) {
        let _ = self.poller.delete(&self.stream);
        let _ = self.stream.shutdown();
    }
}

/// The byte stream under a connection: plain, or upgraded to TLS.
#[derive(Debug)]
pub enum Transport {
    Plain(Socket),
    #[cfg(feature = "tls")]
    Tls(Box<crate::tls::TlsStream>),
}

impl Transport {
    /// Open the socket described by the configuration.
    ///
    /// TCP connects try every resolved address, each bounded by the connect
    /// timeout (falling back to the write timeout).
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        match config.target() {
            Target::Unix(path) => {
                tracing::debug!(socket = %path.display(), "Connecting over unix socket");
                let stream = UnixStream::connect(&path).map_err(|e| {
                    connect_failure(format!("failed to connect to {}", path.display()), e)
                })?;
                Self::from_unix(stream)
            }
            Target::Tcp { host, port } => {
                tracing::debug!(host = %host, port = port, "Connecting over TCP");
                let addrs = (host.as_str(), port).to_socket_addrs().map_err(|e| {
                    connect_failure(format!("failed to resolve {}:{}", host, port), e)
                })?;

                let timeout = config.effective_connect_timeout();
                let mut last_err = None;
                for addr in addrs {
                    let attempt = match timeout {
                        Some(t) => TcpStream::connect_timeout(&addr, t),
                        None => TcpStream::connect(addr),
                    };
                    match attempt {
                        Ok(stream) => {
                            stream.set_nodelay(true).ok();
                            return Self::from_tcp(stream);
                        }
                        Err(e) => {
                            tracing::debug!(addr = %addr, error = %e, "Connect attempt failed");
                            last_err = Some(e);
                        }
                    }
                }

                let err = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
                });
                Err(connect_failure(
                    format!("failed to connect to {}:{}", host, port),
                    err,
                ))
            }
        }
    }

    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        Socket::new(Stream::Tcp(stream)).map(Transport::Plain)
    }

    /// Wrap an already connected unix stream.
    pub fn from_unix(stream: UnixStream) -> Result<Self> {
        Socket::new(Stream::Unix(stream)).map(Transport::Plain)
    }

    fn socket(&self) -> &Socket {
        match self {
            Transport::Plain(s) => s,
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.socket(),
        }
    }

    fn socket_mut(&mut self) -> &mut Socket {
        match self {
            Transport::Plain(s) => s,
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.socket_mut(),
        }
    }

    pub fn is_tls(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            #[cfg(feature = "tls")]
            Transport::Tls(_) => true,
        }
    }

    pub fn is_unix(&self) -> bool {
        self.socket().is_unix()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.socket().read_timeout()
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.socket().write_timeout()
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_mut().set_read_timeout(timeout);
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_mut().set_write_timeout(timeout);
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.write(buf),
        }
    }

    /// Write the whole buffer.
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Wrap this transport in a TLS session and complete the TLS handshake.
    pub fn upgrade(self, config: &ClientConfig) -> Result<Transport> {
        match self {
            Transport::Plain(socket) => crate::tls::upgrade(socket, config),
            #[cfg(feature = "tls")]
            Transport::Tls(_) => Err(crate::error::tls_error("transport is already using TLS")),
        }
    }

    /// Shut the socket down. Errors are ignored.
    pub fn close(&mut self) {
        match self {
            Transport::Plain(s) => s.close(),
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.close(),
        }
    }
}

fn connect_failure(msg: String, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::ConnectionRefused => {
            io_connection_error(ConnectionErrorKind::Refused, msg, err)
        }
        _ => io_connection_error(ConnectionErrorKind::Connect, msg, err),
    }
}
