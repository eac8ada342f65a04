//! Glob-style key patterns
//!
//! Only `*` is a wildcard. Every other character matches literally, so
//! `search:?q=jcl.*` escapes the `?` and `.` before becoming a regex.

use crate::error::{CacheError, Result};
use regex::Regex;

/// Compiled glob pattern anchored at both ends
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compile a glob pattern
    pub fn new(pattern: &str) -> Result<Self> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?s)^{}$", body))
            .map_err(|e| CacheError::InvalidOptions(format!("bad pattern '{}': {}", pattern, e)))?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// Test a key
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Original glob text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern matches everything
    pub fn is_match_all(&self) -> bool {
        !self.raw.is_empty() && self.raw.chars().all(|c| c == '*')
    }
}

/// One-off glob match; an invalid pattern never matches
pub fn glob_match(pattern: &str, text: &str) -> bool {
    KeyPattern::new(pattern)
        .map(|p| p.matches(text))
        .unwrap_or(false)
}
