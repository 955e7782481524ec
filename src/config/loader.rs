//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[listener]\nendpoints = [\"/tmp/api.sock\"]").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.endpoints.len(), 1);
    }

    #[test]
    fn validation_errors_are_joined() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nmtu = 1\n[observability]\nstats_interval_secs = 0").unwrap();

        let err = load_config(file.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Validation failed: "), "{msg}");
        assert!(msg.contains("mtu 1"), "{msg}");
        assert!(msg.contains("stats_interval_secs"), "{msg}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/vmnet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
