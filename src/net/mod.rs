//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Endpoint descriptor ("unix://…", "unixgram://…", "fd://N")
//!     → endpoint.rs (parse)
//!     → transport.rs (stale-file cleanup, bind/dial)
//!     → listener.rs (host API sockets, accept with backpressure)
//!     → fd.rs / datagram.rs / stream.rs / pipe.rs (raw channel → Connection)
//!     → Hand off to HTTP layer or the virtual network's packet entry point
//! ```
//!
//! # Design Decisions
//! - One `Connection` contract for every raw channel
//! - Socket files are owned by the value that bound them and unlinked on drop
//! - Descriptor access is an explicit capability, never reflection

pub mod connection;
pub mod datagram;
pub mod endpoint;
pub mod fd;
pub mod listener;
pub mod pipe;
pub mod stream;
pub mod transport;

pub use connection::{Address, Connection, ConnectionId};
pub use datagram::{is_unset_peer, DatagramConnection, DatagramSocket, UnsetPeer};
pub use endpoint::{Endpoint, EndpointError};
pub use fd::FdConnection;
pub use listener::HostListener;
pub use pipe::PipeConnection;
pub use stream::StreamConnection;
pub use transport::{dial_datagram, extract_descriptor, listen_datagram, TransportError};
