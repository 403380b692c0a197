//! Project file types.
//!
//! This module defines the structs that map to the `stackweave.yaml` project
//! file: project identity, state backend, engine tuning, providers and stacks.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;

/// The root of a project file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectFile {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Registered providers.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Declared stacks.
    #[serde(default)]
    pub stacks: Vec<StackConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// Process-local, discarded on exit.
    Memory,
}

/// Apply engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum provider operations in flight per stack.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on a retry delay in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Timeout per provider call in seconds (0 disables).
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Grace period for in-flight calls after cancellation, in seconds.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// How long apply waits for an unpublished cross-stack output, in seconds.
    #[serde(default)]
    pub output_wait_secs: u64,
}

/// Provider implementation types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// In-process provider echoing inputs.
    #[default]
    Echo,
    /// External plugin reached over HTTP.
    Http,
}

/// A registered provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Provider id referenced by resources.
    pub name: String,
    /// Implementation type.
    #[serde(rename = "type", default)]
    pub provider_type: ProviderType,
    /// Plugin base URL (http only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds (http only).
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Settings passed to the provider; may read other stacks' outputs
    /// with `$stack`.
    #[serde(default)]
    pub settings: BTreeMap<String, JsonValue>,
}

/// A declared stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Unique stack name.
    pub name: String,
    /// Resources in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Outputs exported to other stacks.
    #[serde(default)]
    pub outputs: BTreeMap<String, JsonValue>,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource id, unique within the stack.
    pub id: String,
    /// Resource kind, e.g. `aws:ec2/vpc`.
    pub kind: String,
    /// Provider override; defaults to the kind's package prefix.
    #[serde(default)]
    pub provider: Option<String>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Input properties; may contain `$ref`, `$stack` and `$concat`.
    #[serde(default)]
    pub inputs: BTreeMap<String, JsonValue>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            output_wait_secs: 0,
        }
    }
}

impl EngineConfig {
    /// Per-call timeout, `None` when disabled.
    #[must_use]
    pub const fn operation_timeout(&self) -> Option<Duration> {
        if self.operation_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.operation_timeout_secs))
        }
    }
}

impl ProjectFile {
    /// Finds a stack by name.
    #[must_use]
    pub fn get_stack(&self, name: &str) -> Option<&StackConfig> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// Returns all stack names.
    #[must_use]
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.name.as_str()).collect()
    }
}

impl ResourceConfig {
    /// Provider id this resource routes to.
    #[must_use]
    pub fn provider_id(&self) -> String {
        self.provider
            .clone()
            .unwrap_or_else(|| crate::model::ProviderId::from_kind(&self.kind).to_string())
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_base_delay_ms() -> u64 {
    200
}

const fn default_retry_max_delay_ms() -> u64 {
    5_000
}

const fn default_operation_timeout_secs() -> u64 {
    300
}

const fn default_cancel_grace_secs() -> u64 {
    30
}

const fn default_provider_timeout_secs() -> u64 {
    30
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Memory => "memory",
        };
        write!(f, "{backend}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.parallelism, 4);
        assert_eq!(engine.max_attempts, 3);
        assert_eq!(engine.operation_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_operation_timeout_can_be_disabled() {
        let engine = EngineConfig {
            operation_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(engine.operation_timeout(), None);
    }

    #[test]
    fn test_resource_provider_defaults_to_kind_prefix() {
        let resource = ResourceConfig {
            id: String::from("vpc"),
            kind: String::from("aws:ec2/vpc"),
            provider: None,
            depends_on: vec![],
            inputs: BTreeMap::new(),
        };
        assert_eq!(resource.provider_id(), "aws");
    }
}
