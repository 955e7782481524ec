//! Unix datagram sockets presented as connections.
//!
//! # Responsibilities
//! - Own a bound unix datagram socket and its filesystem path (`DatagramSocket`)
//! - Hand out connection-shaped adapters over that socket (`DatagramConnection`)
//! - Track the peer to answer: whoever sent the most recent datagram
//!
//! # Design Decisions
//! - Adapters hold a `Weak` reference: the socket belongs to the
//!   `DatagramSocket` that bound it, and dropping that owner closes the
//!   descriptor and unlinks the path. `DatagramConnection::close` therefore
//!   leaves the socket alone.
//! - The write destination lives in an `ArcSwapOption`, so a reader task and
//!   a writer task may share one adapter.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::net::UnixDatagram;

use crate::net::connection::{Address, Connection, ConnectionId, Deadlines};

/// Returned (wrapped in `io::Error`) when a datagram adapter is written to
/// before any packet told it where to send.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("datagram peer is unset: no packet has been received yet")]
pub struct UnsetPeer;

/// True if `err` is the unset-peer error.
pub fn is_unset_peer(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|e| e.is::<UnsetPeer>())
}

/// Where replies go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Peer {
    Path(PathBuf),
    /// Last sender was an unbound socket; there is no address to reply to.
    Unnamed,
}

/// A bound unix datagram socket and the path it occupies.
///
/// Dropping it closes the socket (once no adapter operation is in flight)
/// and removes the socket file.
pub struct DatagramSocket {
    socket: Arc<UnixDatagram>,
    path: PathBuf,
    peer: Option<PathBuf>,
}

impl DatagramSocket {
    pub(crate) fn new(socket: UnixDatagram, path: PathBuf, peer: Option<PathBuf>) -> Self {
        Self {
            socket: Arc::new(socket),
            path,
            peer,
        }
    }

    pub(crate) fn connect(&self, remote: &Path) -> io::Result<()> {
        self.socket.connect(remote)
    }

    /// A new adapter over this socket.
    ///
    /// Adapters of a dialed socket start out addressed to the dial target;
    /// adapters of a listening socket learn their peer from the first read.
    pub fn connection(&self) -> DatagramConnection {
        DatagramConnection {
            id: ConnectionId::new(),
            socket: Arc::downgrade(&self.socket),
            peer: ArcSwapOption::new(self.peer.clone().map(|p| Arc::new(Peer::Path(p)))),
            deadlines: Deadlines::default(),
        }
    }

    /// Path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the socket and remove its file.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("path", &self.path)
            .field("peer", &self.peer)
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Datagram socket closed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove datagram socket file"
            ),
        }
    }
}

/// Connection-shaped view of a shared unix datagram socket.
///
/// Every successful [`read`](Connection::read) retargets subsequent writes
/// to the sender of that datagram.
#[derive(Debug)]
pub struct DatagramConnection {
    id: ConnectionId,
    socket: Weak<UnixDatagram>,
    peer: ArcSwapOption<Peer>,
    deadlines: Deadlines,
}

impl DatagramConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn socket(&self) -> io::Result<Arc<UnixDatagram>> {
        self.socket.upgrade().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                "datagram socket was closed by its owner",
            )
        })
    }
}

#[async_trait]
impl Connection for DatagramConnection {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = self.socket()?;
        let (n, from) = self.deadlines.reading(socket.recv_from(buf)).await?;

        let peer = match from.as_pathname() {
            Some(path) => Peer::Path(path.to_path_buf()),
            None => Peer::Unnamed,
        };
        tracing::trace!(connection_id = %self.id, bytes = n, peer = ?peer, "Datagram received");
        self.peer.store(Some(Arc::new(peer)));
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let socket = self.socket()?;
        let peer = self.peer.load_full();
        match peer.as_deref() {
            None => Err(io::Error::new(io::ErrorKind::NotConnected, UnsetPeer)),
            Some(Peer::Unnamed) => {
                tracing::trace!(
                    connection_id = %self.id,
                    bytes = buf.len(),
                    "Discarding datagram for unnamed peer"
                );
                Ok(buf.len())
            }
            Some(Peer::Path(path)) => self.deadlines.writing(socket.send_to(buf, path)).await,
        }
    }

    async fn close(&self) -> io::Result<()> {
        tracing::trace!(connection_id = %self.id, "Datagram adapter released");
        Ok(())
    }

    fn local_addr(&self) -> Address {
        self.socket
            .upgrade()
            .and_then(|s| s.local_addr().ok())
            .map(|a| Address::from(&a))
            .unwrap_or_default()
    }

    fn remote_addr(&self) -> Address {
        match self.peer.load().as_deref() {
            Some(Peer::Path(path)) => Address::Unix(path.clone()),
            _ => Address::Unspecified,
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.socket()?;
        self.deadlines.set_read(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.socket()?;
        self.deadlines.set_write(deadline);
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.socket.upgrade().map(|s| s.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::listen_datagram;
    use std::time::Duration;

    #[tokio::test]
    async fn write_before_read_fails_with_unset_peer() {
        let dir = tempfile::tempdir().unwrap();
        let socket = listen_datagram(&dir.path().join("srv.sock")).unwrap();
        let conn = socket.connection();

        let err = conn.write(b"hello").await.unwrap_err();
        assert!(is_unset_peer(&err));
        assert_eq!(conn.remote_addr(), Address::Unspecified);
    }

    #[tokio::test]
    async fn unnamed_sender_discards_replies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let socket = listen_datagram(&path).unwrap();
        let conn = socket.connection();

        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"anon", &path).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 4);
        assert_eq!(conn.remote_addr(), Address::Unspecified);
        assert_eq!(conn.write(b"reply").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn adapter_fails_after_owner_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let socket = listen_datagram(&path).unwrap();
        let conn = socket.connection();
        assert_eq!(conn.local_addr(), Address::Unix(path.clone()));

        socket.close();
        assert!(!path.exists());

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(conn.raw_fd().is_none());
    }

    #[tokio::test]
    async fn read_deadline_applies_to_receive() {
        let dir = tempfile::tempdir().unwrap();
        let socket = listen_datagram(&dir.path().join("srv.sock")).unwrap();
        let conn = socket.connection();
        conn.set_deadline(Some(Instant::now() + Duration::from_millis(25)))
            .unwrap();

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
