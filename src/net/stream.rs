//! Unix stream socket connection.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::net::UnixStream;

use crate::net::connection::{Address, Connection, ConnectionId, Deadlines};

/// Connection over an accepted or dialed unix stream.
#[derive(Debug)]
pub struct StreamConnection {
    id: ConnectionId,
    io: ArcSwapOption<UnixStream>,
    fd: RawFd,
    local: Address,
    remote: Address,
    deadlines: Deadlines,
}

impl StreamConnection {
    pub fn new(stream: UnixStream) -> Self {
        let local = stream.local_addr().map(|a| Address::from(&a)).unwrap_or_default();
        let remote = stream.peer_addr().map(|a| Address::from(&a)).unwrap_or_default();
        Self {
            id: ConnectionId::new(),
            fd: stream.as_raw_fd(),
            io: ArcSwapOption::from_pointee(stream),
            local,
            remote,
            deadlines: Deadlines::default(),
        }
    }

    /// Dial the unix stream socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn handle(&self) -> io::Result<Arc<UnixStream>> {
        self.io
            .load_full()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }
}

#[async_trait]
impl Connection for StreamConnection {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.handle()?;
        self.deadlines
            .reading(async {
                loop {
                    stream.readable().await?;
                    match stream.try_read(buf) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        res => return res,
                    }
                }
            })
            .await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.handle()?;
        self.deadlines
            .writing(async {
                loop {
                    stream.writable().await?;
                    match stream.try_write(buf) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        res => return res,
                    }
                }
            })
            .await
    }

    async fn close(&self) -> io::Result<()> {
        if self.io.swap(None).is_some() {
            tracing::debug!(connection_id = %self.id, "Stream connection closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> Address {
        self.local.clone()
    }

    fn remote_addr(&self) -> Address {
        self.remote.clone()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.handle()?;
        self.deadlines.set_read(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.handle()?;
        self.deadlines.set_write(deadline);
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.io.load().is_some().then_some(self.fd)
    }
}
