//! Connection over any tokio byte stream.
//!
//! For channels that arrive as a generic stream instead of a socket, such
//! as an HTTP connection upgraded to carry guest frames.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::net::connection::{Address, Connection, ConnectionId, Deadlines};

/// Connection over a split async stream.
pub struct PipeConnection<T> {
    id: ConnectionId,
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
    closed: AtomicBool,
    local: Address,
    remote: Address,
    deadlines: Deadlines,
}

impl<T> PipeConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        Self::with_addrs(io, Address::Unspecified, Address::Unspecified)
    }

    pub fn with_addrs(io: T, local: Address, remote: Address) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            id: ConnectionId::new(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            local,
            remote,
            deadlines: Deadlines::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl<T> Connection for PipeConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.deadlines
            .reading(async { self.reader.lock().await.read(buf).await })
            .await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.deadlines
            .writing(async { self.writer.lock().await.write(buf).await })
            .await
    }

    /// Shut down the write side; the stream itself goes with the connection.
    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(connection_id = %self.id, "Pipe connection closed");
        self.writer.lock().await.shutdown().await
    }

    fn local_addr(&self) -> Address {
        self.local.clone()
    }

    fn remote_addr(&self) -> Address {
        self.remote.clone()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.check_open()?;
        self.deadlines.set_read(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.check_open()?;
        self.deadlines.set_write(deadline);
        Ok(())
    }
}

impl<T> fmt::Debug for PipeConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeConnection")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn carries_bytes_both_ways() {
        let (a, mut b) = tokio::io::duplex(64);
        let conn = PipeConnection::new(a);

        conn.write(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert!(conn.raw_fd().is_none());
    }

    #[tokio::test]
    async fn close_ends_the_peer_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        let conn = PipeConnection::new(a);

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);

        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn read_deadline_expires() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = PipeConnection::new(a);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
