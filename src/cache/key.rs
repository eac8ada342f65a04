//! Structured cache keys for knowledge base data

use crate::cache::types::CacheKey;
use serde::{Deserialize, Serialize};

/// Namespace of a cache key; the built-in invalidation strategies target these
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    /// Search results
    Search,

    /// Autocomplete suggestions
    Autocomplete,

    /// Knowledge base entry
    Entry,

    /// Category listings
    Category,

    /// Per-user data (preferences, history)
    User,

    /// Aggregated metrics
    Metrics,

    /// Custom namespace
    Custom(String),
}

impl std::fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyNamespace::Search => write!(f, "search"),
            KeyNamespace::Autocomplete => write!(f, "autocomplete"),
            KeyNamespace::Entry => write!(f, "entry"),
            KeyNamespace::Category => write!(f, "category"),
            KeyNamespace::User => write!(f, "user"),
            KeyNamespace::Metrics => write!(f, "metrics"),
            KeyNamespace::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}

impl KeyNamespace {
    /// Glob covering every key in this namespace
    pub fn pattern(&self) -> String {
        format!("{}:*", self)
    }
}

/// Cache key builder
pub struct CacheKeyBuilder {
    namespace: KeyNamespace,
    identifier: String,
    params: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder
    pub fn new(namespace: KeyNamespace) -> Self {
        Self {
            namespace,
            identifier: String::new(),
            params: Vec::new(),
        }
    }

    /// Set the primary identifier
    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = id.into();
        self
    }

    /// Add a parameter to the key
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Build the cache key
    pub fn build(self) -> CacheKey {
        let mut key = format!("{}:{}", self.namespace, self.identifier);

        if !self.params.is_empty() {
            let params_str: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            key.push('?');
            key.push_str(&params_str.join("&"));
        }

        key
    }
}
