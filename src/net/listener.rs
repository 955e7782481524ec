//! Host-facing unix socket listener with backpressure.
//!
//! # Responsibilities
//! - Bind unix stream endpoints (or adopt an inherited listening descriptor)
//! - Accept incoming connections for the HTTP layer
//! - Enforce max_connections limit via semaphore
//! - Remove the socket file when the listener goes away
//! - Report an accept loop that cannot recover to whoever serves it

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use crate::net::connection::Address;
use crate::net::transport::{clear_stale_socket, SocketKind, TransportError};

/// A bounded unix stream listener.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait until a slot becomes available. Dropping the listener
/// removes the socket file it created.
#[derive(Debug)]
pub struct HostListener {
    /// The underlying unix listener.
    inner: UnixListener,
    /// Socket file to unlink on drop; `None` for inherited descriptors.
    path: Option<PathBuf>,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Where the error that stops the accept loop goes.
    failure_tx: Option<oneshot::Sender<io::Error>>,
    failure_rx: Option<oneshot::Receiver<io::Error>>,
}

/// A listener whose accept loop can break for good.
///
/// `axum::serve` never sees accept errors, so listeners that can fail hand
/// the fatal one over through this channel instead.
pub trait FallibleListener: axum::serve::Listener {
    /// Receiver of the error that stopped accepting; available once.
    fn take_failure(&mut self) -> Option<oneshot::Receiver<io::Error>> {
        None
    }
}

impl HostListener {
    /// Bind a unix stream socket at `path`, replacing a stale socket file.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(path: &Path, max_connections: usize) -> Result<Self, TransportError> {
        clear_stale_socket(path, SocketKind::Stream)?;
        let inner = UnixListener::bind(path).map_err(|source| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(
            path = %path.display(),
            max_connections,
            "Listener bound"
        );

        Ok(Self::new(inner, Some(path.to_path_buf()), max_connections))
    }

    /// Adopt a listening unix socket inherited from the parent process.
    ///
    /// # Safety
    ///
    /// `fd` must be an open, listening unix stream socket owned by nothing
    /// else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd, max_connections: usize) -> io::Result<Self> {
        // SAFETY: guaranteed by the caller.
        let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        let inner = UnixListener::from_std(std_listener)?;

        tracing::info!(fd, max_connections, "Listener adopted from descriptor");

        Ok(Self::new(inner, None, max_connections))
    }

    fn new(inner: UnixListener, path: Option<PathBuf>, max_connections: usize) -> Self {
        let (failure_tx, failure_rx) = oneshot::channel();
        Self {
            inner,
            path,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            failure_tx: Some(failure_tx),
            failure_rx: Some(failure_rx),
        }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream wrapped together with the permit that holds its slot.
    pub async fn accept(&self) -> io::Result<(PermittedStream, Address)> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("listener connection limit closed"))?;

        let (stream, addr) = self.inner.accept().await?;
        let addr = Address::from(&addr);

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((
            PermittedStream {
                stream,
                _permit: permit,
            },
            addr,
        ))
    }

    /// Accept a connection outside the connection limit.
    ///
    /// Used for the guest channel, which takes exactly one peer.
    pub async fn accept_unbounded(&self) -> io::Result<(UnixStream, Address)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((stream, Address::from(&addr)))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Address {
        match &self.path {
            Some(path) => Address::Unix(path.clone()),
            None => self
                .inner
                .local_addr()
                .map(|a| Address::from(&a))
                .unwrap_or_default(),
        }
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

impl Drop for HostListener {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!(path = %path.display(), "Listener closed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove socket file"
                ),
            }
        }
    }
}

impl axum::serve::Listener for HostListener {
    type Io = PermittedStream;
    type Addr = Address;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match HostListener::accept(self).await {
                Ok(accepted) => return accepted,
                // The peer went away before we got to it.
                Err(e) if is_connection_error(&e) => continue,
                Err(e) if is_resource_exhausted(&e) => {
                    tracing::error!(error = %e, "Accept error; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    tracing::error!(
                        address = %HostListener::local_addr(self),
                        error = %e,
                        "Accept failed; listener stopped"
                    );
                    if let Some(tx) = self.failure_tx.take() {
                        let _ = tx.send(e);
                    }
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(HostListener::local_addr(self))
    }
}

impl FallibleListener for HostListener {
    fn take_failure(&mut self) -> Option<oneshot::Receiver<io::Error>> {
        self.failure_rx.take()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Out of descriptors or buffers: clears up as connections close.
fn is_resource_exhausted(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// An accepted stream that holds its connection slot.
///
/// When dropped, the connection slot is released back to the listener.
#[derive(Debug)]
pub struct PermittedStream {
    stream: UnixStream,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for PermittedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PermittedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
