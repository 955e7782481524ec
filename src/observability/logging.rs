//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Derive the default filter from the configured level and debug flag
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured filter when set
//! - A second initialisation (tests, embedding) is ignored

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Default filter directives for `config`.
pub fn default_directives(config: &ObservabilityConfig) -> String {
    let level = if config.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    format!("vmnet_proxy={level},tower_http={level}")
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_raises_level() {
        let mut config = ObservabilityConfig::default();
        assert_eq!(default_directives(&config), "vmnet_proxy=info,tower_http=info");

        config.debug = true;
        assert_eq!(default_directives(&config), "vmnet_proxy=debug,tower_http=debug");
    }
}
