use std::fmt;
use std::io::{self, ErrorKind};
use std::net::ToSocketAddrs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, UnixListener};
use mio::{Interest, Registry, Token};
use tracing::{debug, info};

use crate::error::{EventError, Result};
use crate::handle::IoHandle;

/// Port used when a TCP address is given without one.
pub const DEFAULT_TCP_PORT: u16 = 7450;

/// A listen/connect address: `host:port` for TCP, anything else is a socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Tcp { host: String, port: u16 },
    Pipe(PathBuf),
}

impl SocketAddress {
    /// Parse an address string.
    ///
    /// `host:port` is TCP; an empty port (`host:`) asks the OS for a free
    /// one. Strings without a colon, or whose "host" contains a path
    /// separator, are socket paths.
    pub fn parse(address: &str) -> Result<Self> {
        if address.is_empty() {
            return Err(EventError::InvalidAddress("empty address".to_string()));
        }
        if let Some((host, port)) = address.rsplit_once(':') {
            if !host.is_empty() && !host.contains('/') {
                let port = if port.is_empty() {
                    0
                } else {
                    port.parse::<u16>().map_err(|_| {
                        EventError::InvalidAddress(format!("invalid port in {address}"))
                    })?
                };
                let host = host.trim_start_matches('[').trim_end_matches(']');
                return Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                });
            }
        }
        Ok(Self::Pipe(PathBuf::from(address)))
    }

    /// TCP host with the default port.
    pub fn tcp_default(host: &str) -> Self {
        Self::Tcp {
            host: host.to_string(),
            port: DEFAULT_TCP_PORT,
        }
    }

    /// Make socket paths absolute so equal files compare equal.
    pub fn normalize(self) -> Self {
        match self {
            Self::Pipe(path) if path.is_relative() => match std::env::current_dir() {
                Ok(cwd) => Self::Pipe(cwd.join(path)),
                Err(_) => Self::Pipe(path),
            },
            other => other,
        }
    }

    /// Whether this is a TCP address.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    /// Socket path, for pipe addresses.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Pipe(path) => Some(path),
            Self::Tcp { .. } => None,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Pipe(path) => write!(f, "{}", path.display()),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A listening socket registered with the event loop.
///
/// Filesystem sockets are removed on drop, unless the path was replaced by
/// something else in the meantime.
pub struct SocketWatcher {
    listener: Listener,
    address: String,
    path: Option<PathBuf>,
    created_inode: Option<(u64, u64)>,
}

impl SocketWatcher {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `address`.
    ///
    /// For TCP with port 0 the OS picks a port; [`SocketWatcher::address`]
    /// reports the real one.
    pub fn bind(address: &SocketAddress) -> Result<Self> {
        match address {
            SocketAddress::Tcp { host, port } => Self::bind_tcp(host, *port),
            SocketAddress::Pipe(path) => Self::bind_pipe(path),
        }
    }

    fn bind_tcp(host: &str, port: u16) -> Result<Self> {
        let requested = SocketAddress::Tcp {
            host: host.to_string(),
            port,
        }
        .to_string();
        let listener = std::net::TcpListener::bind((host, port)).map_err(|e| EventError::Bind {
            address: requested.clone(),
            source: e,
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let address = SocketAddress::Tcp {
            host: host.to_string(),
            port: local.port(),
        }
        .to_string();

        info!(%address, "listening on tcp socket");

        Ok(Self {
            listener: Listener::Tcp(TcpListener::from_std(listener)),
            address,
            path: None,
            created_inode: None,
        })
    }

    fn bind_pipe(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let address = path.display().to_string();

        // Validate path length
        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(EventError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove a stale socket (nobody accepting), but never a live one or a non-socket file.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(EventError::Bind {
                    address,
                    source: io::Error::new(
                        ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(EventError::Bind {
                    address,
                    source: io::Error::from(ErrorKind::AddrInUse),
                });
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| EventError::Bind {
                address: address.clone(),
                source: e,
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&path).map_err(|e| {
            EventError::Bind {
                address: address.clone(),
                source: e,
            }
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE))
            .map_err(|e| EventError::Bind {
                address: address.clone(),
                source: e,
            })?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| EventError::Bind {
            address: address.clone(),
            source: e,
        })?;
        listener.set_nonblocking(true)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener: Listener::Unix(UnixListener::from_std(listener)),
            address,
            created_inode: Some((created.dev(), created.ino())),
            path: Some(path),
        })
    }

    /// Accept one pending connection; `Ok(None)` when none is waiting.
    pub fn accept(&self) -> Result<Option<IoHandle>> {
        loop {
            let accepted = match &self.listener {
                Listener::Tcp(listener) => listener.accept().map(|(stream, _)| {
                    let _ = stream.set_nodelay(true);
                    IoHandle::from_mio_tcp(stream)
                }),
                Listener::Unix(listener) => listener
                    .accept()
                    .map(|(stream, _)| IoHandle::from_mio_unix(stream)),
            };
            return match accepted {
                Ok(handle) => {
                    debug!(address = %self.address, "accepted connection");
                    Ok(Some(handle))
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => Err(EventError::Accept(err)),
            };
        }
    }

    /// The address this watcher listens on (TCP addresses carry the real port).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether this is a TCP listener.
    pub fn is_tcp(&self) -> bool {
        matches!(self.listener, Listener::Tcp(_))
    }
}

impl Source for SocketWatcher {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match &mut self.listener {
            Listener::Tcp(listener) => listener.register(registry, token, interests),
            Listener::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match &mut self.listener {
            Listener::Tcp(listener) => listener.reregister(registry, token, interests),
            Listener::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match &mut self.listener {
            Listener::Tcp(listener) => listener.deregister(registry),
            Listener::Unix(listener) => listener.deregister(registry),
        }
    }
}

impl Drop for SocketWatcher {
    fn drop(&mut self) {
        let (Some(path), Some((expected_dev, expected_ino))) = (&self.path, self.created_inode)
        else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(?path, "cleaning up socket file");
                let _ = std::fs::remove_file(path);
            } else {
                debug!(?path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

/// Connect to `address` (blocking, bounded by `timeout` for TCP).
///
/// Every resolved TCP address is tried in turn; the last error is reported.
pub fn connect(address: &SocketAddress, timeout: Duration) -> Result<IoHandle> {
    let shown = address.to_string();
    match address {
        SocketAddress::Tcp { host, port } => {
            let candidates = (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|e| EventError::Connect {
                    address: shown.clone(),
                    source: e,
                })?;
            let mut last_err = io::Error::new(ErrorKind::NotFound, "address resolved to nothing");
            for candidate in candidates {
                match std::net::TcpStream::connect_timeout(&candidate, timeout) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        debug!(address = %shown, "connected to tcp socket");
                        return Ok(IoHandle::from_tcp(stream)?);
                    }
                    Err(err) => {
                        debug!(%candidate, error = %err, "tcp connect attempt failed");
                        last_err = err;
                    }
                }
            }
            Err(EventError::Connect {
                address: shown,
                source: last_err,
            })
        }
        SocketAddress::Pipe(path) => {
            let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
                EventError::Connect {
                    address: shown.clone(),
                    source: e,
                }
            })?;
            debug!(?path, "connected to unix domain socket");
            Ok(IoHandle::from_unix(stream)?)
        }
    }
}
