use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// Listening Unix domain socket bound to a filesystem path.
///
/// The socket file is removed on drop, but only if the path still refers to
/// the socket this value created.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `path`, replacing a stale socket file if present.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on `path` with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::symlink_metadata(&path) {
            Ok(existing) if existing.file_type().is_socket() => {
                debug!(?path, "replacing stale broker socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "path exists and is not a unix socket",
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let identity = std::fs::symlink_metadata(&path)
            .map(|m| (m.dev(), m.ino()))
            .map_err(bind_err)?;

        info!(?path, mode = %format!("{mode:o}"), "broker socket listening");
        Ok(Self {
            listener,
            path,
            created_inode: Some(identity),
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect to a listening socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(|e| TransportError::Connect {
                path: path.to_path_buf(),
                source: e,
            })?;
        debug!(?path, "connected to unix domain socket");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect, retrying refused or missing sockets up to `attempts` times.
    ///
    /// Returns the stream together with the number of retries that were
    /// needed, so callers can report a degraded transport.
    pub fn connect_with_retry(
        path: impl AsRef<Path>,
        attempts: u32,
        delay: Duration,
    ) -> Result<(IpcStream, u32)> {
        let path = path.as_ref();
        let mut retries = 0u32;
        loop {
            match Self::connect(path) {
                Ok(stream) => return Ok((stream, retries)),
                Err(TransportError::Connect { source, .. })
                    if retries + 1 < attempts && is_retryable(&source) =>
                {
                    retries += 1;
                    debug!(?path, retries, "socket not ready, retrying connect");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some(identity) = self.created_inode else {
            return;
        };
        let still_ours = std::fs::symlink_metadata(&self.path)
            .map(|m| m.file_type().is_socket() && (m.dev(), m.ino()) == identity)
            .unwrap_or(false);
        if still_ours {
            debug!(path = ?self.path, "removing broker socket");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path was replaced, leaving it");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn bind_accept_connect() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("broker.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = UnixDomainSocket::connect(&path_clone).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
    }

    #[test]
    fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn bind_rejects_existing_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }

    #[test]
    fn default_mode_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("perm.sock");

        let _listener = UnixDomainSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn connect_with_retry_waits_for_late_listener() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("late.sock");

        let bind_path = sock_path.clone();
        let binder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            let listener = UnixDomainSocket::bind(&bind_path).unwrap();
            let _stream = listener.accept().unwrap();
        });

        let (_stream, retries) =
            UnixDomainSocket::connect_with_retry(&sock_path, 50, Duration::from_millis(10))
                .unwrap();
        assert!(retries > 0);
        binder.join().unwrap();
    }

    #[test]
    fn connect_with_retry_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("missing.sock");

        let result =
            UnixDomainSocket::connect_with_retry(&sock_path, 3, Duration::from_millis(1));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
