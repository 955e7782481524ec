//! Descriptor-backed connection.
//!
//! Wraps an already-open descriptor (a socket or pipe handed over by the VMM
//! or a parent process) in the [`Connection`] contract. The descriptor is
//! switched to non-blocking mode and driven by the tokio reactor, so it must
//! be pollable: regular files are rejected by `AsyncFd::new`.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use crate::net::connection::{Address, Connection, ConnectionId, Deadlines};

/// Connection over an owned file descriptor.
#[derive(Debug)]
pub struct FdConnection {
    id: ConnectionId,
    io: ArcSwapOption<AsyncFd<File>>,
    fd: RawFd,
    local: Address,
    remote: Address,
    deadlines: Deadlines,
}

impl FdConnection {
    /// Take ownership of `fd`. Must be called inside a tokio runtime.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        Self::with_addrs(fd, Address::Unspecified, Address::Unspecified)
    }

    /// Take ownership of `fd`, recording the given address pair.
    pub fn with_addrs(fd: OwnedFd, local: Address, remote: Address) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        let raw = fd.as_raw_fd();
        let io = AsyncFd::new(File::from(fd))?;
        let id = ConnectionId::new();

        tracing::debug!(connection_id = %id, fd = raw, "Descriptor connection opened");

        Ok(Self {
            id,
            io: ArcSwapOption::from_pointee(io),
            fd: raw,
            local,
            remote,
            deadlines: Deadlines::default(),
        })
    }

    /// Adopt a raw descriptor inherited from the parent process.
    ///
    /// # Safety
    ///
    /// `fd` must be open and not owned by anything else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: the caller guarantees exclusive ownership of an open fd.
        Self::new(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn handle(&self) -> io::Result<Arc<AsyncFd<File>>> {
        self.io
            .load_full()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }
}

#[async_trait]
impl Connection for FdConnection {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let io = self.handle()?;
        self.deadlines
            .reading(async {
                loop {
                    let mut guard = io.readable().await?;
                    match guard.try_io(|inner| {
                        let mut file: &File = inner.get_ref();
                        file.read(buf)
                    }) {
                        Ok(res) => return res,
                        Err(_would_block) => continue,
                    }
                }
            })
            .await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let io = self.handle()?;
        self.deadlines
            .writing(async {
                loop {
                    let mut guard = io.writable().await?;
                    match guard.try_io(|inner| {
                        let mut file: &File = inner.get_ref();
                        file.write(buf)
                    }) {
                        Ok(res) => return res,
                        Err(_would_block) => continue,
                    }
                }
            })
            .await
    }

    /// Close the descriptor, reporting the error from `close(2)`.
    ///
    /// If another task is mid-operation on this connection the descriptor is
    /// released once that operation finishes and no error can be reported.
    async fn close(&self) -> io::Result<()> {
        let Some(handle) = self.io.swap(None) else {
            return Ok(());
        };
        tracing::debug!(connection_id = %self.id, fd = self.fd, "Descriptor connection closed");

        match Arc::try_unwrap(handle) {
            Ok(handle) => {
                let raw = handle.into_inner().into_raw_fd();
                // SAFETY: `raw` was just released from its owner and is closed exactly once.
                if unsafe { libc::close(raw) } == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
            Err(_shared) => Ok(()),
        }
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

/// Fail with `EBADF` unless `fd` is an open descriptor.
pub fn check_descriptor(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Put a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl(F_GETFL/F_SETFL) on a descriptor we hold a reference to.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: see above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
