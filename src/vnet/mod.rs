//! Virtual network stack seam.
//!
//! # Data Flow
//! ```text
//! NetworkConfig ──▶ stack construction (once, immutable)
//!
//! guest channel (Connection) ──▶ accept_packets ──┐
//! GET /connect (HTTP upgrade) ────────────────────┤
//!                                                 ▼
//!                          port.rs (protocol.rs framing)
//!                  ──▶ byte counters, capture.rs, frame subscribers
//!
//! listen(addr) → VirtualListener (listener.rs) → HTTP server
//! router()     → stats / forwarder / dhcp / dns / connect routes (api.rs)
//! ```
//!
//! # Design Decisions
//! - The supervisor only sees the `VirtualNetwork` trait; a real
//!   NAT/DHCP/DNS engine plugs in behind it
//! - `MemoryNetwork` is the in-process stack: it frames and counts traffic
//!   and serves virtual listeners, but never parses packets

pub mod api;
pub mod capture;
pub mod forwarder;
pub mod listener;
pub mod memory;
mod port;
pub mod protocol;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::net::Connection;

pub use forwarder::{ExposeRequest, ForwardError, Forwarder, UnexposeRequest};
pub use listener::{ListenerTable, VirtualListener};
pub use memory::MemoryNetwork;
pub use protocol::Protocol;

/// Error type for virtual network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("address {0} is already bound in the virtual network")]
    AddrInUse(SocketAddr),
    #[error("address {0} is not served by the gateway")]
    AddrNotAvailable(SocketAddr),
    #[error("cannot open capture file {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// The user-space network stack the supervisor attaches channels to.
#[async_trait]
pub trait VirtualNetwork: Send + Sync + fmt::Debug {
    /// Start background services (configured port forwards).
    async fn start(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    /// A listener bound at `addr` inside the virtual network.
    async fn listen(&self, addr: SocketAddr) -> Result<VirtualListener, NetworkError>;

    /// Carry frames between the guest and the stack over `conn`.
    ///
    /// Returns `Ok(())` when the guest closes the channel.
    async fn accept_packets(&self, conn: &dyn Connection) -> io::Result<()>;

    /// HTTP routes controlling the stack.
    fn router(&self) -> axum::Router;

    /// Traffic counters, readable by any task.
    fn counters(&self) -> &ByteCounters;
}

/// Bytes moved between the guest and the stack.
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

/// Point-in-time copy of [`ByteCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ByteCounters {
    pub(crate) fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes sent to the guest.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes received from the guest.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_sent: self.sent(),
            bytes_received: self.received(),
        }
    }
}
