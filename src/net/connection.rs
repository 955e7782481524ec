//! Duplex connection contract and shared plumbing.
//!
//! # Responsibilities
//! - Define the `Connection` contract every channel adapter satisfies
//! - Address records for local/remote ends
//! - Per-connection read/write deadlines
//! - Generate unique connection IDs for tracing
//!
//! # Design Decisions
//! - Methods take `&self` so a reader task and a writer task can share one
//!   connection; adapters keep their mutable state in atomics
//! - Descriptor extraction is an explicit opt-in capability (`raw_fd`)

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Address {
    /// No address known (unnamed socket, or a peer not yet heard from).
    #[default]
    Unspecified,
    /// Unix-domain socket path.
    Unix(PathBuf),
    /// Address inside the virtual network.
    Inet(SocketAddr),
}

impl Address {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Address::Unspecified)
    }
}

impl From<&tokio::net::unix::SocketAddr> for Address {
    fn from(addr: &tokio::net::unix::SocketAddr) -> Self {
        addr.as_pathname()
            .map(|p| Address::Unix(p.to_path_buf()))
            .unwrap_or_default()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unspecified => f.write_str("-"),
            Address::Unix(p) => write!(f, "{}", p.display()),
            Address::Inet(a) => write!(f, "{}", a),
        }
    }
}

/// A bidirectional byte stream with lifecycle and deadline controls.
///
/// Deadlines are absolute instants; `None` clears the deadline. An operation
/// still pending when its deadline passes fails with `ErrorKind::TimedOut`.
/// A deadline is sampled when an operation starts.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Read into `buf`, returning the number of bytes read (0 at end of stream).
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes written.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release the connection.
    async fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> Address;

    fn remote_addr(&self) -> Address;

    /// Set both the read and the write deadline.
    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    /// Underlying descriptor, for adapters that can hand one out.
    ///
    /// Only setup code that must pass a live socket across a boundary that
    /// cannot take a `Connection` should use this; see
    /// [`extract_descriptor`](crate::net::transport::extract_descriptor).
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Read exactly `buf.len()` bytes.
pub async fn read_exact(conn: &dyn Connection, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match conn.read(buf).await? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            }
            n => buf = &mut buf[n..],
        }
    }
    Ok(())
}

/// Write all of `buf`.
pub async fn write_all(conn: &dyn Connection, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match conn.write(buf).await? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Read and write deadlines of one connection.
#[derive(Debug, Default)]
pub struct Deadlines {
    read: ArcSwapOption<Instant>,
    write: ArcSwapOption<Instant>,
}

impl Deadlines {
    pub fn set_read(&self, deadline: Option<Instant>) {
        self.read.store(deadline.map(Arc::new));
    }

    pub fn set_write(&self, deadline: Option<Instant>) {
        self.write.store(deadline.map(Arc::new));
    }

    /// Run a read operation under the current read deadline.
    pub async fn reading<T, F>(&self, op: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        with_deadline(self.read.load_full().map(|d| *d), op).await
    }

    /// Run a write operation under the current write deadline.
    pub async fn writing<T, F>(&self, op: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        with_deadline(self.write.load_full().map(|d| *d), op).await
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        None => op.await,
        Some(at) => match tokio::time::timeout_at(at.into(), op).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "i/o deadline exceeded",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn unspecified_address_display() {
        assert_eq!(Address::Unspecified.to_string(), "-");
        assert_eq!(Address::Unix("/tmp/x.sock".into()).to_string(), "/tmp/x.sock");
    }

    #[tokio::test]
    async fn expired_deadline_times_out() {
        let deadlines = Deadlines::default();
        deadlines.set_read(Some(Instant::now() + Duration::from_millis(20)));

        let err = deadlines
            .reading(std::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn cleared_deadline_does_not_interfere() {
        let deadlines = Deadlines::default();
        deadlines.set_write(Some(Instant::now()));
        deadlines.set_write(None);

        let n = deadlines.writing(async { Ok::<_, io::Error>(7) }).await.unwrap();
        assert_eq!(n, 7);
    }
}
