use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::tunnel;

/// A connected byte stream carrying RPC traffic. Implements `Read + Write`.
///
/// Reader and writer halves are obtained with [`RpcStream::try_clone`]; a
/// further clone kept aside can [`shutdown`](RpcStream::shutdown) the socket to
/// unblock a thread parked in `read`.
pub struct RpcStream {
    inner: StreamInner,
}

enum StreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for RpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for RpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl From<TcpStream> for RpcStream {
    fn from(stream: TcpStream) -> Self {
        // Small frames dominate RPC traffic.
        let _ = stream.set_nodelay(true);
        Self {
            inner: StreamInner::Tcp(stream),
        }
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for RpcStream {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: StreamInner::Unix(stream),
        }
    }
}

impl RpcStream {
    /// A connected pair of in-process streams, handy for tests and embedding.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((left.into(), right.into()))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            StreamInner::Tcp(stream) => StreamInner::Tcp(stream.try_clone()?),
            #[cfg(unix)]
            StreamInner::Unix(stream) => StreamInner::Unix(stream.try_clone()?),
        };
        Ok(Self { inner })
    }

    /// Shut down both directions. Blocked readers on any clone observe EOF.
    ///
    /// Shutting down an already disconnected stream is not an error.
    pub fn shutdown(&self) -> Result<()> {
        let res = match &self.inner {
            StreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match res {
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    /// Human-readable description of the remote side, for logs.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            StreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp@{addr}"))
                .unwrap_or_else(|_| "tcp@unknown".to_string()),
            #[cfg(unix)]
            StreamInner::Unix(stream) => match stream.peer_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("unix@{}", path.display()),
                    None => "unix@unnamed".to_string(),
                },
                Err(_) => "unix@unknown".to_string(),
            },
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            StreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            StreamInner::Unix(_) => "unix-domain-socket",
        }
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

/// Dial an endpoint (blocking).
///
/// `timeout` bounds the whole bootstrap: TCP connect plus, for `http@`
/// endpoints, the CONNECT exchange. `None` waits indefinitely. Unix domain
/// socket connects complete immediately or fail, so the bound does not apply.
pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<RpcStream> {
    let started = Instant::now();
    let stream = match endpoint {
        Endpoint::Tcp(addr) | Endpoint::Http(addr) => dial_tcp(endpoint, addr, timeout)?,
        Endpoint::Unix(path) => dial_unix(endpoint, path)?,
    };

    if endpoint.is_tunneled() {
        let remaining = match timeout {
            Some(limit) => match limit.checked_sub(started.elapsed()) {
                Some(left) if !left.is_zero() => Some(left),
                _ => {
                    return Err(TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        source: std::io::Error::from(std::io::ErrorKind::TimedOut),
                    })
                }
            },
            None => None,
        };
        stream.set_read_timeout(remaining)?;
        stream.set_write_timeout(remaining)?;
        let mut stream = stream;
        tunnel::connect_tunnel(&mut stream)?;
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        debug!(%endpoint, "tunnel established");
        return Ok(stream);
    }

    debug!(%endpoint, "connected");
    Ok(stream)
}

fn dial_tcp(endpoint: &Endpoint, addr: &str, timeout: Option<Duration>) -> Result<RpcStream> {
    let connect_err = |source| TransportError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };

    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs().map_err(connect_err)? {
        let attempt = match timeout {
            Some(limit) if !limit.is_zero() => TcpStream::connect_timeout(&sock_addr, limit),
            _ => TcpStream::connect(sock_addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream.into()),
            Err(err) => last_err = Some(err),
        }
    }

    Err(connect_err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address resolved to no socket addresses",
        )
    })))
}

#[cfg(unix)]
fn dial_unix(endpoint: &Endpoint, path: &std::path::Path) -> Result<RpcStream> {
    let stream =
        std::os::unix::net::UnixStream::connect(path).map_err(|source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
    Ok(stream.into())
}

#[cfg(not(unix))]
fn dial_unix(endpoint: &Endpoint, _path: &std::path::Path) -> Result<RpcStream> {
    Err(TransportError::Unsupported(format!(
        "{endpoint}: unix domain sockets are not available on this platform"
    )))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn pair_reads_and_writes() {
        let (mut left, mut right) = RpcStream::pair().unwrap();
        left.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn shutdown_unblocks_reader_on_clone() {
        let (left, _right) = RpcStream::pair().unwrap();
        let mut reader = left.try_clone().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).unwrap()
        });

        thread::sleep(Duration::from_millis(20));
        left.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), 0);
        // Repeated shutdown is harmless.
        left.shutdown().unwrap();
    }

    #[test]
    fn connect_tcp_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"ok").unwrap();
        });

        let endpoint = Endpoint::Tcp(addr.to_string());
        let mut stream = connect(&endpoint, Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        assert_eq!(stream.transport_name(), "tcp");
        assert!(stream.peer_label().starts_with("tcp@127.0.0.1"));
        server.join().unwrap();
    }

    #[test]
    fn connect_refused_reports_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::Tcp(addr.to_string());
        let err = connect(&endpoint, Some(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
