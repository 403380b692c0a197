//! Persisted state types.
//!
//! A stack's state is a collection of [`StateRecord`]s keyed by resource id,
//! the [`StackOutputs`] published by its last apply, and a bounded history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ProviderId, ResourceId};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept per stack.
pub const MAX_HISTORY: usize = 100;

/// Previously-applied state of one resource.
///
/// A record exists iff the resource was created and not yet deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    #[serde(default = "default_format")]
    pub format: String,
    /// Resource id.
    pub resource_id: ResourceId,
    /// Resource kind.
    pub kind: String,
    /// Provider that created the resource.
    pub provider: ProviderId,
    /// Hash of the resolved inputs last applied.
    pub inputs_hash: String,
    /// Opaque provider-owned state.
    #[serde(default)]
    pub provider_state: JsonValue,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, JsonValue>,
    /// Resolved dependency set at apply time.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// Optimistic concurrency version, starting at 1 once stored.
    #[serde(default)]
    pub version: u64,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

fn default_format() -> String {
    STATE_VERSION.to_string()
}

/// Outputs published by a stack for downstream stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOutputs {
    /// Resolved output values.
    pub values: BTreeMap<String, JsonValue>,
    /// False when some declared outputs could not be resolved.
    pub complete: bool,
    /// When the outputs were published.
    pub published_at: DateTime<Utc>,
}

/// Snapshot of everything stored for a stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// Stack name.
    pub stack: String,
    /// Records keyed by resource id.
    pub records: BTreeMap<ResourceId, StateRecord>,
    /// Last published outputs, if any.
    pub outputs: Option<StackOutputs>,
    /// Recent operations, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// A single entry in a stack's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: StackOperation,
    /// Resources touched by the operation.
    pub resources: Vec<String>,
    /// Whether every node converged.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of stack operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// Converge to the desired state.
    Up,
    /// Delete every resource.
    Destroy,
}

impl StateRecord {
    /// Creates an unsaved record (version 0).
    #[must_use]
    pub fn new(
        resource_id: ResourceId,
        kind: impl Into<String>,
        provider: ProviderId,
        inputs_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            format: default_format(),
            resource_id,
            kind: kind.into(),
            provider,
            inputs_hash: inputs_hash.into(),
            provider_state: JsonValue::Null,
            outputs: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the provider state and outputs.
    #[must_use]
    pub fn with_provider_result(mut self, provider_state: JsonValue, outputs: BTreeMap<String, JsonValue>) -> Self {
        self.provider_state = provider_state;
        self.outputs = outputs;
        self
    }

    /// Sets the resolved dependency set.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Copy of this record keyed as a replaced instance, unsaved.
    ///
    /// The key is derived from the creation time, so retiring the same
    /// record twice yields the same key.
    #[must_use]
    pub fn retire(&self) -> Self {
        let mut retired = self.clone();
        retired.resource_id = self.resource_id.replaced_instance(self.created_at.timestamp_millis());
        retired.version = 0;
        retired.updated_at = Utc::now();
        retired
    }
}

impl StackOutputs {
    /// Creates a new output map.
    #[must_use]
    pub fn new(values: BTreeMap<String, JsonValue>, complete: bool) -> Self {
        Self {
            values,
            complete,
            published_at: Utc::now(),
        }
    }
}

impl StackState {
    /// Creates an empty state for a stack.
    #[must_use]
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ..Self::default()
        }
    }

    /// Gets a record by resource id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Returns true if nothing is recorded for the stack.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.outputs.is_none()
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: StackOperation, resources: Vec<String>, error: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: error.is_none(),
            error,
        }
    }
}

/// Appends an entry, dropping the oldest beyond [`MAX_HISTORY`].
pub fn push_history(history: &mut Vec<HistoryEntry>, entry: HistoryEntry) {
    history.push(entry);
    if history.len() > MAX_HISTORY {
        let excess = history.len() - MAX_HISTORY;
        history.drain(..excess);
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Up => "up",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
