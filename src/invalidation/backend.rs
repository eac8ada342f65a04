//! Remote invalidation collaborator
//!
//! Local removal always happens first; the backend is told afterwards and its
//! failures are only logged by the engine.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Keys, patterns and tags to drop remotely
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cascade: bool,
}

impl InvalidationRequest {
    pub fn keys(keys: Vec<String>, cascade: bool) -> Self {
        Self {
            keys,
            cascade,
            ..Default::default()
        }
    }

    pub fn patterns(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            ..Default::default()
        }
    }

    pub fn tags(tags: Vec<String>) -> Self {
        Self {
            tags,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupPriority {
    High,
    Normal,
    Low,
}

/// Ask the backend to repopulate matching data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupRequest {
    pub patterns: Vec<String>,
    pub priority: WarmupPriority,
    pub batch_size: usize,
}

#[async_trait]
pub trait InvalidationBackend: Send + Sync {
    async fn invalidate(&self, request: &InvalidationRequest) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn warmup(&self, request: &WarmupRequest) -> Result<()>;
}

/// Backend for standalone use; accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

#[async_trait]
impl InvalidationBackend for NoopBackend {
    async fn invalidate(&self, _request: &InvalidationRequest) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn warmup(&self, _request: &WarmupRequest) -> Result<()> {
        Ok(())
    }
}
