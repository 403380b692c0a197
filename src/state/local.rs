//! Local file-based state storage backend.
//!
//! Layout under the base directory:
//!
//! ```text
//! stacks/<stack>/resources/<hex(resource id)>.json
//! stacks/<stack>/outputs.json
//! stacks/<stack>/history.json
//! stacks/<stack>/stack.lock
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StackweaveError, StateError};
use crate::model::ResourceId;

use super::lock::{generate_holder_id, KeyLocks, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{locked_by_other, next_version, StateStore};
use super::types::{push_history, HistoryEntry, StackOutputs, StackState, StateRecord};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackweave";

const STACKS_DIR: &str = "stacks";
const RESOURCES_DIR: &str = "resources";
const OUTPUTS_FILE: &str = "outputs.json";
const HISTORY_FILE: &str = "history.json";
const LOCK_FILE: &str = "stack.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Serializes writes per file.
    key_locks: KeyLocks,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.stackweave`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackweaveError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            key_locks: KeyLocks::new(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn stack_dir(&self, stack: &str) -> PathBuf {
        self.base_dir.join(STACKS_DIR).join(stack)
    }

    fn record_path(&self, stack: &str, id: &ResourceId) -> PathBuf {
        self.stack_dir(stack)
            .join(RESOURCES_DIR)
            .join(format!("{}.json", hex::encode(id.as_str())))
    }

    fn outputs_path(&self, stack: &str) -> PathBuf {
        self.stack_dir(stack).join(OUTPUTS_FILE)
    }

    fn history_path(&self, stack: &str) -> PathBuf {
        self.stack_dir(stack).join(HISTORY_FILE)
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        self.stack_dir(stack).join(LOCK_FILE)
    }

    async fn read_history(&self, stack: &str) -> Result<Vec<HistoryEntry>> {
        Ok(read_json(&self.history_path(stack)).await?.unwrap_or_default())
    }
}

/// Reads and parses a JSON file, `None` if it does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StackweaveError::State(StateError::corrupted(format!(
                "Failed to read {}: {e}",
                path.display()
            ))));
        }
    };

    let value = serde_json::from_str(&content).map_err(|e| {
        StackweaveError::State(StateError::corrupted(format!("Failed to parse {}: {e}", path.display())))
    })?;

    Ok(Some(value))
}

/// Writes a JSON file atomically via a temporary file and rename.
async fn write_json_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            StackweaveError::State(StateError::backend(format!(
                "Failed to create state directory {}: {e}",
                parent.display()
            )))
        })?;
    }

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| StackweaveError::State(StateError::serialization(format!("Failed to serialize state: {e}"))))?;

    let temp_path = path.with_extension(format!("{}.tmp", &Uuid::new_v4().simple().to_string()[..8]));

    let mut file = fs::File::create(&temp_path).await.map_err(|e| {
        StackweaveError::State(StateError::backend(format!("Failed to create temp state file: {e}")))
    })?;

    file.write_all(content.as_bytes())
        .await
        .map_err(|e| StackweaveError::State(StateError::backend(format!("Failed to write state file: {e}"))))?;

    file.sync_all()
        .await
        .map_err(|e| StackweaveError::State(StateError::backend(format!("Failed to sync state file: {e}"))))?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| StackweaveError::State(StateError::backend(format!("Failed to rename state file: {e}"))))?;

    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StackweaveError::State(StateError::backend(format!(
            "Failed to delete {}: {e}",
            path.display()
        )))),
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load_stack(&self, stack: &str) -> Result<StackState> {
        let mut state = StackState::new(stack);
        let resources_dir = self.stack_dir(stack).join(RESOURCES_DIR);

        match fs::read_dir(&resources_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await.map_err(|e| {
                    StackweaveError::State(StateError::backend(format!("Failed to list records: {e}")))
                })? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Some(record) = read_json::<StateRecord>(&path).await? {
                        state.records.insert(record.resource_id.clone(), record);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No records for stack {stack}");
            }
            Err(e) => {
                return Err(StackweaveError::State(StateError::backend(format!(
                    "Failed to read {}: {e}",
                    resources_dir.display()
                ))));
            }
        }

        state.outputs = read_json(&self.outputs_path(stack)).await?;
        state.history = self.read_history(stack).await?;

        debug!("Loaded {} record(s) for stack {stack}", state.records.len());
        Ok(state)
    }

    async fn get_record(&self, stack: &str, id: &ResourceId) -> Result<Option<StateRecord>> {
        read_json(&self.record_path(stack, id)).await
    }

    async fn put_record(&self, stack: &str, mut record: StateRecord, expected_version: Option<u64>) -> Result<StateRecord> {
        let path = self.record_path(stack, &record.resource_id);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;

        let found = read_json::<StateRecord>(&path).await?.map(|r| r.version);
        record.version = next_version(stack, &record.resource_id, found, expected_version)?;
        write_json_atomic(&path, &record).await?;

        debug!("Stored {stack}/{} at version {}", record.resource_id, record.version);
        Ok(record)
    }

    async fn remove_record(&self, stack: &str, id: &ResourceId, expected_version: u64) -> Result<()> {
        let path = self.record_path(stack, id);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;

        let found = read_json::<StateRecord>(&path).await?.map(|r| r.version);
        next_version(stack, id, found, Some(expected_version))?;
        remove_if_exists(&path).await?;

        debug!("Removed {stack}/{id}");
        Ok(())
    }

    async fn load_outputs(&self, stack: &str) -> Result<Option<StackOutputs>> {
        read_json(&self.outputs_path(stack)).await
    }

    async fn publish_outputs(&self, stack: &str, outputs: &StackOutputs) -> Result<()> {
        let path = self.outputs_path(stack);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;
        write_json_atomic(&path, outputs).await?;
        info!("Published {} output(s) for stack {stack}", outputs.values.len());
        Ok(())
    }

    async fn clear_outputs(&self, stack: &str) -> Result<()> {
        let path = self.outputs_path(stack);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;
        remove_if_exists(&path).await
    }

    async fn append_history(&self, stack: &str, entry: HistoryEntry) -> Result<()> {
        let path = self.history_path(stack);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;
        let mut history = self.read_history(stack).await?;
        push_history(&mut history, entry);
        write_json_atomic(&path, &history).await
    }

    async fn list_stacks(&self) -> Result<Vec<String>> {
        let root = self.base_dir.join(STACKS_DIR);
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StackweaveError::State(StateError::backend(format!(
                    "Failed to read {}: {e}",
                    root.display()
                ))));
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StackweaveError::State(StateError::backend(format!("Failed to list stacks: {e}"))))?
        {
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            let state = self.load_stack(&name).await?;
            if !state.is_empty() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        let path = self.lock_path(stack);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;

        if let Some(existing) = read_json::<LockInfo>(&path).await? {
            if !existing.is_expired() {
                return Err(locked_by_other(&existing));
            }
            debug!("Expired lock found on {stack}, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(stack, &holder_id);
        write_json_atomic(&path, &lock_info).await?;

        info!(
            "Acquired lock on {stack}: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        let path = self.lock_path(stack);
        let _guard = self.key_locks.lock(&path.to_string_lossy()).await;

        if let Some(existing) = read_json::<LockInfo>(&path).await? {
            if existing.lock_id == lock_id {
                remove_if_exists(&path).await?;
                info!("Released lock on {stack}: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        read_json(&self.lock_path(stack)).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
