//! vmnet-proxy: host side of a guest VM's user-space network.
//!
//! # Architecture Overview
//!
//! ```text
//!   host clients                      ┌───────────────────────────────────────────┐
//!   (unix sockets / fd://N)           │               vmnet-proxy                  │
//!   ──────────────────────────────────┼─▶ net::HostListener ─▶ http (root API)     │
//!                                     │                          │ /network/*     │
//!                                     │                          ▼                │
//!                                     │   ┌──────────────────────────────────┐    │
//!                                     │   │ vnet::VirtualNetwork              │    │
//!   guest raw channel                 │   │  gateway_ip:80   → http::gateway  │    │
//!   (fd / unix stream / unixgram)     │   │  host_ip:7777    → stack router   │    │
//!   ◀─────────────────────────────────┼──▶│  accept_packets  ◀─ net adapters  │    │
//!                                     │   └──────────────────────────────────┘    │
//!                                     │                                           │
//!                                     │   lifecycle::Supervisor: one task per     │
//!                                     │   listener + guest loop + signals, shared │
//!                                     │   cancellation, first error wins          │
//!                                     └───────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod vnet;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::{Shutdown, Supervisor, SupervisorError};
pub use vnet::{MemoryNetwork, VirtualNetwork};
