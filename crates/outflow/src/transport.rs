//! # Transport
//!
//! The connection/handshake seam. The state machine only relies on the
//! [`Transport`] call contract; [`TcpTransport`] is a plain TCP
//! implementation used by the demo node and the loopback tests.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::TransportError;

/// Port used when a destination names none.
pub const DEFAULT_PORT: u16 = 1935;

// ─── Connect Target ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything a transport needs to open and authenticate a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub uri: String,
    pub stream_key: String,
    pub credentials: Option<Credentials>,
    /// Identification sent at handshake, e.g. `outflow/0.1.0 (x264)`.
    pub client_name: String,
}

/// Split a destination such as `tcp://host:port/app` into `host:port` and `app`.
pub fn parse_destination(uri: &str) -> Result<(String, String), TransportError> {
    let stripped = uri
        .strip_prefix("tcp://")
        .or_else(|| uri.strip_prefix("rtmp://"))
        .unwrap_or(uri);
    let (authority, path) = match stripped.split_once('/') {
        Some((a, p)) => (a, p),
        None => (stripped, ""),
    };
    if authority.is_empty() {
        return Err(TransportError::Connect(format!("no host in destination '{uri}'")));
    }
    let host_port = if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        authority.to_string()
    } else {
        format!("{authority}:{DEFAULT_PORT}")
    };
    Ok((host_port, path.trim_end_matches('/').to_string()))
}

// ─── Trait ──────────────────────────────────────────────────────────────────

/// Tears a connection down from another thread.
///
/// After `abort`, a write blocked inside the owning transport returns an
/// error and every later write fails.
pub trait AbortHandle: Send + Sync {
    fn abort(&self);
}

/// A persistent outbound connection.
///
/// `write` may be called repeatedly from one thread. In non-blocking mode it
/// returns `Ok(0)` when the socket cannot accept data right now.
pub trait Transport: Send {
    fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Write every byte or fail. A zero-length write in blocking mode is a
    /// closed connection.
    fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => return Err(TransportError::Closed),
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<(), TransportError> {
        Ok(())
    }

    /// Read and throw away any inbound bytes. Returns how many were discarded.
    fn discard_incoming(&mut self) -> Result<usize, TransportError> {
        Ok(0)
    }

    /// A handle that can abort the connected transport while another thread
    /// is blocked in `write`. `None` when the transport cannot be interrupted.
    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>> {
        None
    }

    fn close(&mut self);
}

// ─── TCP ────────────────────────────────────────────────────────────────────

/// TCP transport with a one-line text handshake.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    nonblocking: bool,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpTransport {
            stream: None,
            connect_timeout,
            nonblocking: false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    fn hello_line(target: &ConnectTarget, app: &str) -> String {
        let mut line = format!("OUTFLOW/1 {app} {} {}", target.stream_key, target.client_name);
        if let Some(creds) = &target.credentials {
            line.push_str(&format!(" auth={}:{}", creds.username, creds.password));
        }
        line.push('\n');
        line
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, target: &ConnectTarget) -> Result<(), TransportError> {
        let (host_port, app) = parse_destination(&target.uri)?;
        let addr = host_port
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect(format!("resolve {host_port}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("no address for {host_port}")))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(false)?;
        debug!(%addr, app, "tcp connected");

        self.stream = Some(stream);
        let hello = Self::hello_line(target, &app);
        self.write_all(hello.as_bytes())
            .map_err(|e| TransportError::Handshake(e.to_string()))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let nonblocking = self.nonblocking;
        let stream = self.stream()?;
        match stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if nonblocking && e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransportError::Write(e.to_string())),
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError> {
        self.stream()?.set_nonblocking(nonblocking)?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn discard_incoming(&mut self) -> Result<usize, TransportError> {
        let was_nonblocking = self.nonblocking;
        let stream = self.stream()?;
        if !was_nonblocking {
            stream.set_nonblocking(true)?;
        }
        let mut scratch = [0u8; 2048];
        let mut discarded = 0;
        let result = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Err(TransportError::Closed),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(discarded),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(TransportError::Io(e)),
            }
        };
        if !was_nonblocking {
            stream.set_nonblocking(false)?;
        }
        result
    }

    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>> {
        let stream = self.stream.as_ref()?.try_clone().ok()?;
        Some(Arc::new(TcpAbort { stream }))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Shuts down a cloned handle of the socket, which fails any blocked write.
struct TcpAbort {
    stream: TcpStream,
}

impl AbortHandle for TcpAbort {
    fn abort(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "tcp abort");
        }
    }
}
