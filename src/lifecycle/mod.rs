//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Start network → Bind host endpoints → Virtual listeners → Guest channel
//!
//! Running (supervisor.rs):
//!     One task per listener + guest loop + signal watcher (+ telemetry)
//!
//! Shutdown (shutdown.rs):
//!     Signal / first task failure / caller request → cancel every task
//!     → listeners dropped (socket files removed) → join all → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: network first, then listeners, then tasks
//! - All-or-nothing: the listener set never runs partially
//! - Errors after cancellation are shutdown noise, not failures
//! - Tasks are never restarted

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;

pub use shutdown::{Shutdown, ShutdownReason};
pub use signals::Signals;
pub use startup::{build_listener_set, GuestChannel, ListenerSet, StartupError};
pub use supervisor::{Running, Supervisor, SupervisorError};
