use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::RpcStream;

/// A bound listener for one endpoint.
///
/// `accept` hands back the raw stream. For `http@` endpoints the caller is
/// expected to run [`crate::tunnel::accept_tunnel`] on it before anything
/// else; [`RpcListener::requires_tunnel`] tells which.
pub struct RpcListener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocketListener),
}

impl RpcListener {
    /// Bind to an endpoint. `tcp@host:0` picks a free port; see
    /// [`RpcListener::local_endpoint`].
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let inner = match endpoint {
            Endpoint::Tcp(addr) | Endpoint::Http(addr) => {
                let listener = TcpListener::bind(addr.as_str()).map_err(|source| {
                    TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source,
                    }
                })?;
                ListenerInner::Tcp(listener)
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => ListenerInner::Unix(UnixSocketListener::bind(path)?),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(TransportError::Unsupported(format!(
                    "{endpoint}: unix domain sockets are not available on this platform"
                )))
            }
        };

        let mut listener = Self {
            inner,
            endpoint: endpoint.clone(),
        };
        listener.endpoint = listener.local_endpoint()?;
        info!(endpoint = %listener.endpoint, "listening");
        Ok(listener)
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<RpcStream> {
        let stream: RpcStream = match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                stream.into()
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => listener.accept()?,
        };
        debug!(peer = %stream.peer_label(), "accepted connection");
        Ok(stream)
    }

    /// The endpoint actually bound, with the real port for `tcp@host:0`.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(match &self.inner {
            ListenerInner::Tcp(listener) => {
                let addr = listener.local_addr()?.to_string();
                match self.endpoint {
                    Endpoint::Http(_) => Endpoint::Http(addr),
                    _ => Endpoint::Tcp(addr),
                }
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => Endpoint::Unix(listener.path.clone()),
        })
    }

    /// The endpoint this listener was bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether accepted streams must complete an HTTP CONNECT upgrade first.
    pub fn requires_tunnel(&self) -> bool {
        self.endpoint.is_tunneled()
    }
}

impl std::fmt::Debug for RpcListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcListener")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Filesystem-path Unix socket that removes its own path on drop.
#[cfg(unix)]
struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

#[cfg(unix)]
impl UnixSocketListener {
    const SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    fn bind(path: &Path) -> Result<Self> {
        let bind_err = |source| TransportError::Bind {
            endpoint: format!("unix@{}", path.display()),
            source,
        };

        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Stale sockets are replaced; anything else at the path is left alone.
        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(path).map_err(bind_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(Self::SOCKET_MODE))
            .map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(path).map_err(bind_err)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            created_inode: (metadata.dev(), metadata.ino()),
        })
    }

    fn accept(&self) -> Result<RpcStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        Ok(stream.into())
    }
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket()
            && (metadata.dev(), metadata.ino()) == self.created_inode
        {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use super::*;
    use crate::stream::connect;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "muxrpc-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn tcp_port_zero_reports_real_port() {
        let listener = RpcListener::bind(&Endpoint::parse("tcp@127.0.0.1:0").unwrap()).unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        match &endpoint {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0"), "got {addr}"),
            other => panic!("unexpected endpoint {other}"),
        }
        assert_eq!(listener.endpoint(), &endpoint);
        assert!(!listener.requires_tunnel());
    }

    #[test]
    fn http_listener_requires_tunnel() {
        let listener = RpcListener::bind(&Endpoint::parse("http@127.0.0.1:0").unwrap()).unwrap();
        assert!(listener.requires_tunnel());
        assert_eq!(listener.local_endpoint().unwrap().protocol(), "http");
    }

    #[test]
    fn unix_bind_accept_connect_and_cleanup() {
        let dir = temp_dir("uds");
        let sock_path = dir.join("test.sock");
        let endpoint = Endpoint::Unix(sock_path.clone());

        let listener = RpcListener::bind(&endpoint).unwrap();
        assert!(sock_path.exists());
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let client_endpoint = endpoint.clone();
        let handle = thread::spawn(move || {
            let mut client = connect(&client_endpoint, None).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        handle.join().unwrap();

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unix_bind_rejects_regular_file() {
        let dir = temp_dir("uds-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = RpcListener::bind(&Endpoint::Unix(sock_path.clone()));
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert!(sock_path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unix_path_too_long() {
        let long_path = PathBuf::from("/tmp/".to_string() + &"a".repeat(200) + ".sock");
        let result = RpcListener::bind(&Endpoint::Unix(long_path));
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn drop_keeps_replaced_path() {
        let dir = temp_dir("uds-race");
        let sock_path = dir.join("drop.sock");

        let listener = RpcListener::bind(&Endpoint::Unix(sock_path.clone())).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
