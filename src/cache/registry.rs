//! Ordered path-pattern rules deciding what is cacheable.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid cache rule pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A cacheable path pattern with the content type and lifetime of its entries.
#[derive(Debug, Clone)]
pub struct CacheRule {
    pub pattern: Regex,
    pub content_type: String,
    /// `None` never expires.
    pub ttl: Option<Duration>,
}

impl CacheRule {
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Rules in registration order; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<CacheRule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `pattern` and append the rule after every existing one.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        content_type: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<(), RuleError> {
        let compiled = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        self.rules.push(CacheRule {
            pattern: compiled,
            content_type: content_type.into(),
            ttl,
        });
        Ok(())
    }

    /// First rule whose pattern matches `path`, if any.
    pub fn find_rule(&self, path: &str) -> Option<&CacheRule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    pub fn rules(&self) -> &[CacheRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registered_rule_wins() {
        let mut registry = RuleRegistry::new();
        registry
            .add_rule("^/api/", "application/json", Some(Duration::from_secs(60)))
            .expect("valid pattern");
        registry
            .add_rule("^/api/users", "text/plain", None)
            .expect("valid pattern");

        let rule = registry.find_rule("/api/users/7").expect("rule should match");
        assert_eq!(rule.content_type, "application/json");
        assert_eq!(rule.ttl, Some(Duration::from_secs(60)));
    }

    #[test]
    fn unmatched_path_has_no_rule() {
        let mut registry = RuleRegistry::new();
        registry
            .add_rule("^/images/.*\\.png$", "image/png", None)
            .expect("valid pattern");

        assert!(registry.find_rule("/images/logo.svg").is_none());
        assert!(registry.find_rule("/images/logo.png").is_some());
    }

    #[test]
    fn empty_registry_matches_nothing() {
        let registry = RuleRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.find_rule("/").is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected_at_registration() {
        let mut registry = RuleRegistry::new();
        let err = registry
            .add_rule("^/broken(", "text/html", None)
            .expect_err("pattern should not compile");

        assert!(matches!(err, RuleError::InvalidPattern { ref pattern, .. } if pattern == "^/broken("));
        assert_eq!(registry.len(), 0);
    }
}
