//! Virtual host resolution: selecting the configured host that answers a
//! given `Host` header.

use regex::Regex;
use std::path::PathBuf;

/// A label plus its compiled glob pattern and document root.
///
/// Patterns are compiled once at startup (`*` -> `.*`, anchored,
/// case-insensitive) and matched in insertion order — first match wins. The
/// reserved label `"all"` matches everything regardless of its configured
/// pattern.
pub struct VirtualHost {
    pub label: String,
    pattern: Regex,
    pub root: PathBuf,
}

impl VirtualHost {
    pub fn new(label: &str, root: PathBuf) -> Self {
        let source = if label == "all" {
            ".*".to_string()
        } else {
            format!("^{}$", regex::escape(label).replace("\\*", ".*"))
        };
        let pattern = Regex::new(&format!("(?i){}", source)).unwrap_or_else(|_| {
            Regex::new("(?i)^$").expect("fallback pattern is always valid")
        });
        Self {
            label: label.to_string(),
            pattern,
            root,
        }
    }

    fn matches(&self, hostname: &str) -> bool {
        self.label == "all" || self.pattern.is_match(hostname)
    }
}

/// Table of configured virtual hosts, matched in insertion order.
pub struct VhostTable {
    vhosts: Vec<VirtualHost>,
    default_label: String,
}

impl VhostTable {
    pub fn new(vhosts: Vec<VirtualHost>, default_label: String) -> Self {
        Self {
            vhosts,
            default_label,
        }
    }

    /// Select the first vhost whose pattern matches `hostname`, defaulting to
    /// the configured `default` label.
    pub fn select(&self, hostname: &str) -> Option<&VirtualHost> {
        self.vhosts
            .iter()
            .find(|v| v.matches(hostname))
            .or_else(|| self.vhosts.iter().find(|v| v.label == self.default_label))
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    pub fn all(&self) -> &[VirtualHost] {
        &self.vhosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_in_insertion_order() {
        let table = VhostTable::new(
            vec![
                VirtualHost::new("api.example.com", PathBuf::from("/srv/api")),
                VirtualHost::new("*.example.com", PathBuf::from("/srv/wild")),
            ],
            "api.example.com".to_string(),
        );
        let matched = table.select("api.example.com").unwrap();
        assert_eq!(matched.label, "api.example.com");

        let matched = table.select("cdn.example.com").unwrap();
        assert_eq!(matched.label, "*.example.com");
    }

    #[test]
    fn falls_back_to_default_label() {
        let table = VhostTable::new(
            vec![VirtualHost::new("known.example.com", PathBuf::from("/srv"))],
            "known.example.com".to_string(),
        );
        let matched = table.select("unknown.example.com").unwrap();
        assert_eq!(matched.label, "known.example.com");
    }

    #[test]
    fn all_label_matches_everything() {
        let vhost = VirtualHost::new("all", PathBuf::from("/srv"));
        assert!(vhost.matches("anything.test"));
    }
}
