//! In-memory state storage backend.
//!
//! Used when embedding the engine and in tests. Nothing survives the process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::Result;
use crate::model::ResourceId;

use super::lock::{generate_holder_id, LockInfo};
use super::store::{locked_by_other, next_version, StateStore};
use super::types::{push_history, HistoryEntry, StackOutputs, StackState, StateRecord};

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    stacks: Mutex<HashMap<String, StackState>>,
    locks: Mutex<HashMap<String, LockInfo>>,
    output_reads: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load_outputs` calls served so far.
    #[must_use]
    pub fn output_reads(&self) -> usize {
        self.output_reads.load(Ordering::SeqCst)
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<String, StackState>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, LockInfo>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_stack(&self, stack: &str) -> Result<StackState> {
        Ok(self
            .stacks()
            .get(stack)
            .cloned()
            .unwrap_or_else(|| StackState::new(stack)))
    }

    async fn get_record(&self, stack: &str, id: &ResourceId) -> Result<Option<StateRecord>> {
        Ok(self
            .stacks()
            .get(stack)
            .and_then(|s| s.records.get(id).cloned()))
    }

    async fn put_record(&self, stack: &str, mut record: StateRecord, expected_version: Option<u64>) -> Result<StateRecord> {
        let mut stacks = self.stacks();
        let state = stacks
            .entry(stack.to_string())
            .or_insert_with(|| StackState::new(stack));
        let found = state.records.get(&record.resource_id).map(|r| r.version);
        record.version = next_version(stack, &record.resource_id, found, expected_version)?;
        debug!("Stored {stack}/{} at version {}", record.resource_id, record.version);
        state.records.insert(record.resource_id.clone(), record.clone());
        Ok(record)
    }

    async fn remove_record(&self, stack: &str, id: &ResourceId, expected_version: u64) -> Result<()> {
        let mut stacks = self.stacks();
        let found = stacks
            .get(stack)
            .and_then(|s| s.records.get(id))
            .map(|r| r.version);
        next_version(stack, id, found, Some(expected_version))?;
        if let Some(state) = stacks.get_mut(stack) {
            state.records.remove(id);
        }
        Ok(())
    }

    async fn load_outputs(&self, stack: &str) -> Result<Option<StackOutputs>> {
        self.output_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.stacks().get(stack).and_then(|s| s.outputs.clone()))
    }

    async fn publish_outputs(&self, stack: &str, outputs: &StackOutputs) -> Result<()> {
        self.stacks()
            .entry(stack.to_string())
            .or_insert_with(|| StackState::new(stack))
            .outputs = Some(outputs.clone());
        Ok(())
    }

    async fn clear_outputs(&self, stack: &str) -> Result<()> {
        if let Some(state) = self.stacks().get_mut(stack) {
            state.outputs = None;
        }
        Ok(())
    }

    async fn append_history(&self, stack: &str, entry: HistoryEntry) -> Result<()> {
        let mut stacks = self.stacks();
        let state = stacks
            .entry(stack.to_string())
            .or_insert_with(|| StackState::new(stack));
        push_history(&mut state.history, entry);
        Ok(())
    }

    async fn list_stacks(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .stacks()
            .values()
            .filter(|s| !s.is_empty())
            .map(|s| s.stack.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        let mut locks = self.locks();
        if let Some(existing) = locks.get(stack) {
            if !existing.is_expired() {
                return Err(locked_by_other(existing));
            }
        }
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock = LockInfo::new(stack, &holder_id);
        locks.insert(stack.to_string(), lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        let mut locks = self.locks();
        if locks.get(stack).is_some_and(|l| l.lock_id == lock_id) {
            locks.remove(stack);
        }
        Ok(())
    }

    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        Ok(self.locks().get(stack).cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StackweaveError, StateError};
    use crate::model::ProviderId;
    use std::collections::BTreeMap;

    fn record(id: &str) -> StateRecord {
        StateRecord::new(ResourceId::new(id), "echo:thing", ProviderId::new("echo"), "hash")
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStateStore::new();
        let stored = store
            .put_record("network", record("vpc"), None)
            .await
            .expect("put");
        assert_eq!(stored.version, 1);

        let loaded = store
            .get_record("network", &ResourceId::new("vpc"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded, stored);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStateStore::new();
        let first = store.put_record("network", record("vpc"), None).await.expect("put");
        store
            .put_record("network", first.clone(), Some(first.version))
            .await
            .expect("update");

        let err = store
            .put_record("network", first.clone(), Some(first.version))
            .await
            .expect_err("stale write");
        assert!(matches!(err, StackweaveError::State(StateError::VersionConflict { .. })));

        let err = store
            .remove_record("network", &ResourceId::new("vpc"), first.version)
            .await
            .expect_err("stale remove");
        assert!(matches!(err, StackweaveError::State(StateError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn test_outputs_and_listing() {
        let store = MemoryStateStore::new();
        assert!(store.load_outputs("network").await.expect("load").is_none());

        let mut values = BTreeMap::new();
        values.insert(String::from("vpcId"), serde_json::json!("vpc-123"));
        store
            .publish_outputs("network", &StackOutputs::new(values, true))
            .await
            .expect("publish");

        assert_eq!(store.list_stacks().await.expect("list"), vec![String::from("network")]);
        store.clear_outputs("network").await.expect("clear");
        assert!(store.list_stacks().await.expect("list").is_empty());
        assert_eq!(store.output_reads(), 1);
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("network", "holder-1").await.expect("lock");
        assert!(store.acquire_lock("network", "holder-2").await.is_err());
        assert!(store.acquire_lock("cluster", "holder-2").await.is_ok());

        store.release_lock("network", &lock.lock_id).await.expect("release");
        assert!(!store.is_locked("network").await.expect("is_locked"));
    }
}
