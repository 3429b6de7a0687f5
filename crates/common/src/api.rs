//! Advertised API model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One locally hosted capability offered to aggregators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDefinition {
    /// Unique API identifier (e.g. "image-gen")
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub pricing: Pricing,

    #[serde(default)]
    pub capacity: Capacity,

    #[serde(default)]
    pub execution: ExecutionLimits,

    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,

    #[serde(default, alias = "outputSchema")]
    pub output_schema: Value,

    /// Any further metadata the operator advertises verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Price per call in the token's base units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub amount: u64,

    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    #[serde(default = "default_max_concurrent", alias = "maxConcurrent")]
    pub max_concurrent: u32,

    #[serde(default = "default_queue_size", alias = "queueSize")]
    pub queue_size: u32,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,

    #[serde(default, alias = "maxRetries")]
    pub max_retries: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: 0,
        }
    }
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_queue_size() -> u32 {
    100
}

fn default_timeout_ms() -> u64 {
    60_000
}

/// Source of the APIs the node advertises
pub trait ApiCatalog: Send + Sync {
    fn list_apis(&self) -> Vec<ApiDefinition>;
}

impl ApiCatalog for Vec<ApiDefinition> {
    fn list_apis(&self) -> Vec<ApiDefinition> {
        self.clone()
    }
}
