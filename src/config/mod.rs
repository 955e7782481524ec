//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → command-line overrides (main.rs)
//!     → ProxyConfig (validated, immutable)
//!     → moved into the supervisor, borrowed by every task
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the supervisor starts; there is no reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod resolv;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    DnsRecord, DnsZone, ListenerConfig, MacAddress, NetworkConfig, ObservabilityConfig,
    ProxyConfig, Subnet, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
