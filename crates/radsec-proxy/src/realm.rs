//! Realm matching
//!
//! Realm rules map a User-Name to a destination upstream, in configuration
//! order with first match winning. Three pattern forms, all matched
//! case-insensitively against the whole User-Name:
//!
//! - `*` matches everything (a terminal catch-all rule)
//! - `/pattern` or `/pattern/` is a regular expression
//! - anything else is a domain literal `D`, compiled to `@D$`
//!
//! A matching rule with no server produces a synthesized Access-Reject
//! (optionally carrying a Reply-Message); no matching rule at all means
//! the request is silently dropped.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::RealmEntry;
use crate::error::{ConfigError, ConfigResult};

pub struct Realm {
    /// The configured pattern, for logging.
    pub name: String,
    regex: Regex,
    /// Index of the destination upstream in the startup-frozen table, or
    /// `None` for reject rules.
    pub server: Option<usize>,
    pub reply_message: Option<String>,
}

impl Realm {
    pub fn new(
        pattern: &str,
        server: Option<usize>,
        reply_message: Option<String>,
    ) -> ConfigResult<Realm> {
        let expr = if let Some(stripped) = pattern.strip_prefix('/') {
            // regexp, remove optional trailing / if present
            stripped.strip_suffix('/').unwrap_or(stripped).to_string()
        } else if pattern == "*" {
            ".*".to_string()
        } else {
            format!("@{}$", regex::escape(pattern))
        };
        debug!(pattern, regex = %expr, "compiled realm");

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::RealmPattern {
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Realm {
            name: pattern.to_string(),
            regex,
            server,
            reply_message,
        })
    }

    /// Build the realm list from config entries, turning server names into
    /// indexes into the upstream table.
    pub fn build(
        entries: &[RealmEntry],
        server_index: impl Fn(&str) -> Option<usize>,
    ) -> ConfigResult<Vec<Realm>> {
        entries
            .iter()
            .map(|entry| {
                let server = match &entry.server {
                    Some(name) => Some(server_index(name).ok_or_else(|| {
                        ConfigError::Invalid(format!("no server {name}"))
                    })?),
                    None => None,
                };
                Realm::new(&entry.pattern, server, entry.reply_message.clone())
            })
            .collect()
    }

    pub fn matches(&self, username: &str) -> bool {
        self.regex.is_match(username)
    }
}

/// First matching realm for a User-Name, or `None`.
pub fn find_realm<'a>(realms: &'a [Realm], username: &str) -> Option<&'a Realm> {
    let realm = realms.iter().find(|r| r.matches(username));
    if let Some(realm) = realm {
        debug!(realm = %realm.name, username, "found matching realm");
    }
    realm
}
