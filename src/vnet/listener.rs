//! Listeners inside the virtual network.
//!
//! Connections to a virtual address are in-memory duplex pipes: `dial` hands
//! one end to the listener bound at that address and returns the other.

use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::net::listener::FallibleListener;
use crate::vnet::NetworkError;

/// Pending connections per listener before dialers wait.
const BACKLOG: usize = 64;

/// Buffer size of each in-memory connection direction.
const PIPE_BUFFER: usize = 64 * 1024;

type Incoming = (DuplexStream, SocketAddr);

/// Bound virtual addresses and the queues feeding their listeners.
#[derive(Debug, Default)]
pub struct ListenerTable {
    entries: DashMap<SocketAddr, mpsc::Sender<Incoming>>,
}

impl ListenerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `addr`. The address is released when the listener is dropped.
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<VirtualListener, NetworkError> {
        match self.entries.entry(addr) {
            Entry::Occupied(_) => Err(NetworkError::AddrInUse(addr)),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(BACKLOG);
                slot.insert(tx);
                tracing::debug!(address = %addr, "Virtual listener bound");
                Ok(VirtualListener {
                    addr,
                    incoming: rx,
                    table: Arc::downgrade(self),
                })
            }
        }
    }

    /// Open a connection from `from` to the listener bound at `to`.
    pub async fn dial(&self, from: SocketAddr, to: SocketAddr) -> io::Result<DuplexStream> {
        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {to}"),
            )
        };
        // Clone the sender so no map guard is held across the await.
        let tx = self.entries.get(&to).map(|e| e.value().clone()).ok_or_else(refused)?;

        let (local, remote) = tokio::io::duplex(PIPE_BUFFER);
        tx.send((remote, from)).await.map_err(|_| refused())?;
        Ok(local)
    }

    pub fn is_bound(&self, addr: &SocketAddr) -> bool {
        self.entries.contains_key(addr)
    }
}

/// A listener bound to an address inside the virtual network.
#[derive(Debug)]
pub struct VirtualListener {
    addr: SocketAddr,
    incoming: mpsc::Receiver<Incoming>,
    table: Weak<ListenerTable>,
}

impl VirtualListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the next connection; `None` once the network is gone.
    pub async fn accept(&mut self) -> Option<(DuplexStream, SocketAddr)> {
        self.incoming.recv().await
    }
}

impl Drop for VirtualListener {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.entries.remove(&self.addr);
            tracing::debug!(address = %self.addr, "Virtual listener closed");
        }
    }
}

impl axum::serve::Listener for VirtualListener {
    type Io = DuplexStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match VirtualListener::accept(self).await {
            Some(conn) => conn,
            None => {
                tracing::warn!(address = %self.addr, "Virtual network dropped; listener idle");
                future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.addr)
    }
}

/// Accepting in memory cannot break.
impl FallibleListener for VirtualListener {}
