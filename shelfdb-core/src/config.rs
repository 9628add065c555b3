// src/config.rs
// Database configuration

use serde::{Deserialize, Serialize};
use crate::error::Result;

/// How `_id` values are generated when a document arrives without one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Per-collection counter: 1, 2, 3, ...
    #[default]
    AutoIncrement,
    /// UUID v4 string wrapped as `DocumentId::ObjectId`
    ObjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub id_strategy: IdStrategy,

    /// When false the planner always answers with a collection scan.
    pub use_indexes: bool,

    /// Upper bound on the number of stages accepted by `aggregate`.
    pub max_pipeline_stages: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            id_strategy: IdStrategy::AutoIncrement,
            use_indexes: true,
            max_pipeline_stages: 64,
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config; missing keys fall back to defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    pub fn with_indexes(mut self, enabled: bool) -> Self {
        self.use_indexes = enabled;
        self
    }

    pub fn with_max_pipeline_stages(mut self, max: usize) -> Self {
        self.max_pipeline_stages = max;
        self
    }
}
