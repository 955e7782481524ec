//! Unix socket transport setup.
//!
//! # Responsibilities
//! - Clear stale socket files before binding
//! - Bind/dial unix datagram endpoints
//! - Hand a connection's descriptor to lower layers
//!
//! # Design Decisions
//! - A socket file is only unlinked after a trial connect shows nobody is serving it;
//!   a live peer yields `TransportError::InUse` instead of being stolen
//! - No retries: every failure is reported to the caller

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use tokio::net::UnixDatagram;

use crate::net::connection::Connection;
use crate::net::datagram::DatagramSocket;

/// Error type for transport setup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to remove stale socket {}: {source}", path.display())]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is held by a live socket", path.display())]
    InUse { path: PathBuf },
    #[error("{} exists and is not a socket", path.display())]
    NotASocket { path: PathBuf },
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("connection does not expose a file descriptor")]
    DescriptorUnavailable,
}

/// Socket type tried when checking whether a path is still served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Remove a leftover socket file at `path` so it can be bound again.
pub fn clear_stale_socket(path: &Path, kind: SocketKind) -> Result<(), TransportError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TransportError::RemoveStale {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !meta.file_type().is_socket() {
        return Err(TransportError::NotASocket {
            path: path.to_path_buf(),
        });
    }
    if is_live(path, kind) {
        return Err(TransportError::InUse {
            path: path.to_path_buf(),
        });
    }

    fs::remove_file(path).map_err(|source| TransportError::RemoveStale {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

fn is_live(path: &Path, kind: SocketKind) -> bool {
    match kind {
        SocketKind::Stream => std::os::unix::net::UnixStream::connect(path).is_ok(),
        SocketKind::Datagram => std::os::unix::net::UnixDatagram::unbound()
            .and_then(|trial| trial.connect(path))
            .is_ok(),
    }
}

/// Bind a unix datagram socket at `path`, replacing a stale socket file.
///
/// Must be called inside a tokio runtime.
pub fn listen_datagram(path: &Path) -> Result<DatagramSocket, TransportError> {
    clear_stale_socket(path, SocketKind::Datagram)?;
    let socket = UnixDatagram::bind(path).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!(path = %path.display(), "Listening on unix datagram socket");
    Ok(DatagramSocket::new(socket, path.to_path_buf(), None))
}

/// Bind a unix datagram socket at `local` and connect it to `remote`.
///
/// Connections from the returned socket start out addressed to `remote`.
pub fn dial_datagram(local: &Path, remote: &Path) -> Result<DatagramSocket, TransportError> {
    clear_stale_socket(local, SocketKind::Datagram)?;
    let socket = UnixDatagram::bind(local).map_err(|source| TransportError::Bind {
        path: local.to_path_buf(),
        source,
    })?;
    // From here on `DatagramSocket` owns the file and unlinks it on error too.
    let socket = DatagramSocket::new(socket, local.to_path_buf(), Some(remote.to_path_buf()));
    socket
        .connect(remote)
        .map_err(|source| TransportError::Connect {
            path: remote.to_path_buf(),
            source,
        })?;

    tracing::info!(
        local = %local.display(),
        remote = %remote.display(),
        "Dialed unix datagram socket"
    );
    Ok(socket)
}

/// Low-level descriptor behind `conn`, for handing a live socket to a
/// consumer that only accepts descriptors (e.g. a VMM network device).
///
/// The descriptor stays owned by `conn`.
pub fn extract_descriptor(conn: &dyn Connection) -> Result<RawFd, TransportError> {
    conn.raw_fd().ok_or(TransportError::DescriptorUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Address;
    use crate::net::datagram::is_unset_peer;
    use crate::net::stream::StreamConnection;

    #[tokio::test]
    async fn listen_then_close_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gram.sock");

        let socket = listen_datagram(&path).unwrap();
        assert!(path.exists());
        socket.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gram.sock");

        // A socket file left behind by a previous run.
        drop(std::os::unix::net::UnixDatagram::bind(&path).unwrap());
        assert!(path.exists());

        let socket = listen_datagram(&path).unwrap();
        assert_eq!(socket.path(), path.as_path());
    }

    #[tokio::test]
    async fn live_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gram.sock");

        let _live = listen_datagram(&path).unwrap();
        let err = listen_datagram(&path).unwrap_err();
        assert!(matches!(err, TransportError::InUse { .. }), "{err}");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn regular_file_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"keep me").unwrap();

        let err = listen_datagram(&path).unwrap_err();
        assert!(matches!(err, TransportError::NotASocket { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn dial_requires_a_listener() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("client.sock");
        let err = dial_datagram(&local, &dir.path().join("missing.sock")).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn destination_tracks_most_recent_sender() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("server.sock");
        let server = listen_datagram(&server_path).unwrap();
        let conn = server.connection();

        let a = dial_datagram(&dir.path().join("a.sock"), &server_path).unwrap();
        let b = dial_datagram(&dir.path().join("b.sock"), &server_path).unwrap();
        let (a, b) = (a.connection(), b.connection());

        assert!(is_unset_peer(&conn.write(b"early").await.unwrap_err()));

        let mut buf = [0u8; 16];
        a.write(b"from-a").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-a");
        assert_eq!(conn.remote_addr(), Address::Unix(dir.path().join("a.sock")));

        conn.write(b"to-a").await.unwrap();
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to-a");

        b.write(b"from-b").await.unwrap();
        conn.read(&mut buf).await.unwrap();
        conn.write(b"to-b").await.unwrap();
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to-b");
    }

    #[tokio::test]
    async fn closing_an_adapter_keeps_the_shared_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("server.sock");
        let server = listen_datagram(&server_path).unwrap();
        let client = dial_datagram(&dir.path().join("c.sock"), &server_path).unwrap();

        let first = client.connection();
        first.close().await.unwrap();

        let second = client.connection();
        second.write(b"still here").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.connection().read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still here");

        // The closed adapter itself keeps working too.
        first.write(b"again").await.unwrap();
    }

    #[tokio::test]
    async fn descriptor_extraction_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let conn = StreamConnection::connect(&path).await.unwrap();
        let _accepted = listener.accept().await.unwrap();
        let fd = extract_descriptor(&conn).unwrap();
        assert!(fd >= 0);

        conn.close().await.unwrap();
        assert!(matches!(
            extract_descriptor(&conn),
            Err(TransportError::DescriptorUnavailable)
        ));
    }
}
