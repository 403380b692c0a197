//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::{Result, StackweaveError, StateError};
use crate::model::ResourceId;

use super::lock::LockInfo;
use super::types::{HistoryEntry, StackOutputs, StackState, StateRecord};

/// Trait for state storage backends.
///
/// Records are versioned: `put_record` and `remove_record` take the version
/// the caller last observed and fail with `StateError::VersionConflict` if
/// the stored version differs. Writes to the same key are serialized.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every record, the published outputs and the history of a stack.
    ///
    /// Returns an empty state if nothing is stored yet.
    async fn load_stack(&self, stack: &str) -> Result<StackState>;

    /// Gets a single record.
    async fn get_record(&self, stack: &str, id: &ResourceId) -> Result<Option<StateRecord>>;

    /// Writes a record if the stored version equals `expected_version`
    /// (`None` meaning no record exists). Returns the stored record with its
    /// new version.
    async fn put_record(&self, stack: &str, record: StateRecord, expected_version: Option<u64>) -> Result<StateRecord>;

    /// Removes a record if the stored version equals `expected_version`.
    async fn remove_record(&self, stack: &str, id: &ResourceId, expected_version: u64) -> Result<()>;

    /// Gets the outputs last published by a stack.
    async fn load_outputs(&self, stack: &str) -> Result<Option<StackOutputs>>;

    /// Publishes a stack's outputs, replacing any previous map.
    async fn publish_outputs(&self, stack: &str, outputs: &StackOutputs) -> Result<()>;

    /// Removes a stack's published outputs.
    async fn clear_outputs(&self, stack: &str) -> Result<()>;

    /// Appends a history entry, keeping the most recent entries.
    async fn append_history(&self, stack: &str, entry: HistoryEntry) -> Result<()>;

    /// Lists stacks with stored records or outputs.
    async fn list_stacks(&self) -> Result<Vec<String>>;

    /// Acquires the advisory lock on a stack.
    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on a stack.
    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>>;

    /// Checks if the stack is locked.
    async fn is_locked(&self, stack: &str) -> Result<bool> {
        Ok(self
            .get_lock_info(stack)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Checks an optimistic write and returns the version to store.
pub(crate) fn next_version(
    stack: &str,
    id: &ResourceId,
    found: Option<u64>,
    expected: Option<u64>,
) -> Result<u64> {
    if found != expected {
        return Err(StackweaveError::State(StateError::VersionConflict {
            stack: stack.to_string(),
            resource: id.to_string(),
            expected,
            found,
        }));
    }
    Ok(found.map_or(1, |v| v + 1))
}

/// Error for a lock held by someone else.
pub(crate) fn locked_by_other(existing: &LockInfo) -> StackweaveError {
    StackweaveError::State(StateError::LockedByOther {
        stack: existing.stack.clone(),
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
    })
}
