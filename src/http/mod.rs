//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! host unix socket / virtual listener
//!     → server.rs (Axum setup, request id, access log, metrics)
//!     → api.rs      root API: stack routes under /network (+ pprof.rs)
//!     → gateway.rs  gateway surface inside the virtual network
//!     → stack router on the host virtual IP
//!
//! client.rs: HTTP/1.1 over a unix socket (vmnet-ctl, tests)
//! ```

pub mod api;
pub mod client;
pub mod gateway;
pub mod pprof;
pub mod request;
pub mod server;

pub use request::{MakeRequestUuid, RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
