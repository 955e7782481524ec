//! Host DNS search domains.

use std::fs;
use std::path::Path;

/// Default resolver configuration path.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Search domains listed in a resolv.conf file.
///
/// Returns an empty list when the file cannot be read or has no `search` line.
pub fn search_domains(path: &Path) -> Vec<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot read resolver configuration");
            return Vec::new();
        }
    };

    let domains = parse_search_domains(&content);
    tracing::debug!(?domains, "Using search domains");
    domains
}

fn parse_search_domains(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| line.strip_prefix("search"))
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .last()
        .map(|rest| rest.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_search_line_wins() {
        let content = "nameserver 1.1.1.1\nsearch old.example\nsearch corp.example  lab.example\n";
        assert_eq!(
            parse_search_domains(content),
            vec!["corp.example".to_string(), "lab.example".to_string()]
        );
    }

    #[test]
    fn no_search_line() {
        assert!(parse_search_domains("nameserver 8.8.8.8\nsearchdomain x\n").is_empty());
    }

    #[test]
    fn unreadable_file_yields_nothing() {
        assert!(search_domains(Path::new("/nonexistent/resolv.conf")).is_empty());
    }
}
