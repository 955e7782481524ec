//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (byte gauges, request counters)
//!
//! Debug mode adds:
//!     → telemetry.rs (periodic byte counter log)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```

pub mod logging;
pub mod metrics;
pub mod telemetry;

pub use logging::init_logging;
pub use metrics::init_metrics;
