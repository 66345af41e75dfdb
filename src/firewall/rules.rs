//! Line-oriented firewall rules source.
//!
//! ```text
//! -1              # max connections (negative = unlimited)
//! 93.184.216.34   # literal IPv4 address
//! example.com     # domain, allowed once resolved
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid max connections header: {0:?}")]
    InvalidMaxConnections(String),
}

/// A single classified allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rule {
    /// Literal IPv4 address, allowed as-is.
    Ip(Ipv4Addr),
    /// Fully-qualified, lower-cased domain name (with trailing dot).
    Domain(String),
}

/// Parsed rules: the allowlist entries plus the connection cap used when
/// there are none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    /// Negative means unlimited.
    pub max_connections: i64,
    pub rules: BTreeSet<Rule>,
}

impl RuleSet {
    /// No rules and no connection limit.
    pub fn unrestricted() -> Self {
        Self {
            max_connections: -1,
            rules: BTreeSet::new(),
        }
    }

    /// Loads rules from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads rules from a file, degrading to [`RuleSet::unrestricted`] when
    /// the file is missing or malformed.
    pub fn load_or_unrestricted(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    "failed to load firewall rules from {}: {}, continuing without rules",
                    path.display(),
                    e
                );
                Self::unrestricted()
            }
        }
    }

    /// Parses the rules text. The first meaningful line is the connection
    /// cap; every following line is an IPv4 address or a hostname. Blank
    /// lines and `#` comments are skipped.
    pub fn parse(content: &str) -> Result<Self, RulesError> {
        let mut lines = content
            .lines()
            .map(strip_comment)
            .filter(|line| !line.is_empty());

        let max_connections = match lines.next() {
            Some(header) => header
                .parse::<i64>()
                .map_err(|_| RulesError::InvalidMaxConnections(header.to_string()))?,
            None => -1,
        };

        let mut rules = BTreeSet::new();
        for entry in lines {
            if let Some(rule) = classify(entry) {
                rules.insert(rule);
            }
        }

        debug!(
            "parsed {} firewall rules (max connections: {})",
            rules.len(),
            max_connections
        );

        Ok(Self {
            max_connections,
            rules,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::unrestricted()
    }
}

fn strip_comment(line: &str) -> &str {
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    line.trim()
}

fn classify(entry: &str) -> Option<Rule> {
    match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Some(Rule::Ip(ip)),
        Ok(IpAddr::V6(ip)) => {
            warn!("ignoring IPv6 rule {}: only IPv4 destinations are filtered", ip);
            None
        }
        Err(_) => Some(Rule::Domain(fqdn(entry))),
    }
}

/// Normalizes a domain name to lower-case fully-qualified form.
pub fn fqdn(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that the header is read as the connection cap and entries are
    /// classified into literal addresses and domains.
    #[test]
    fn parse_mixed_rules() {
        let rules = RuleSet::parse("3\n93.184.216.34\nExample.COM\napi.github.com.\n").unwrap();
        assert_eq!(rules.max_connections, 3);
        assert!(rules.rules.contains(&Rule::Ip(Ipv4Addr::new(93, 184, 216, 34))));
        assert!(rules.rules.contains(&Rule::Domain("example.com.".into())));
        assert!(rules.rules.contains(&Rule::Domain("api.github.com.".into())));
        assert_eq!(rules.rules.len(), 3);
    }

    /// Tests that whitespace, blank lines and comments are ignored.
    #[test]
    fn skips_blank_lines_and_comments() {
        let text = "\n# limit\n  -1  \n\n   example.org   # docs\n# 10.0.0.1\n";
        let rules = RuleSet::parse(text).unwrap();
        assert_eq!(rules.max_connections, -1);
        assert_eq!(
            rules.rules.into_iter().collect::<Vec<_>>(),
            vec![Rule::Domain("example.org.".into())]
        );
    }

    #[test]
    fn header_only_means_counting_mode() {
        let rules = RuleSet::parse("2\n").unwrap();
        assert_eq!(rules.max_connections, 2);
        assert!(rules.is_empty());
    }

    #[test]
    fn invalid_header_rejected() {
        assert!(matches!(
            RuleSet::parse("example.com\n"),
            Err(RulesError::InvalidMaxConnections(_))
        ));
    }

    /// Tests that IPv6 literals are dropped rather than treated as domains.
    #[test]
    fn ipv6_literal_ignored() {
        let rules = RuleSet::parse("-1\n2001:db8::1\n").unwrap();
        assert!(rules.is_empty());
    }

    /// Tests that an unreadable source degrades to no rules, unlimited.
    #[test]
    fn missing_file_degrades_to_unrestricted() {
        let dir = tempfile::tempdir().unwrap();
        let rules = RuleSet::load_or_unrestricted(dir.path().join("nope.rules"));
        assert_eq!(rules, RuleSet::unrestricted());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firewall.rules");
        fs::write(&path, "-1\n93.184.216.34\n").unwrap();
        let rules = RuleSet::load(&path).unwrap();
        assert_eq!(rules.max_connections, -1);
        assert_eq!(rules.rules.len(), 1);
    }

    #[test]
    fn fqdn_normalizes() {
        assert_eq!(fqdn("Example.com"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }
}
