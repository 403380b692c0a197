//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for team collaboration. Keys mirror the local layout:
//! `<prefix>stacks/<stack>/resources/<hex(id)>.json` and friends.
//!
//! The version check on records is performed under an in-process key lock;
//! cross-process exclusion relies on the stack lock.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, StackweaveError, StateError};
use crate::model::ResourceId;

use super::lock::{generate_holder_id, KeyLocks, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{locked_by_other, next_version, StateStore};
use super::types::{push_history, HistoryEntry, StackOutputs, StackState, StateRecord};

const OUTPUTS_KEY: &str = "outputs.json";
const HISTORY_KEY: &str = "history.json";
const LOCK_KEY: &str = "stack.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
    /// Serializes writes per key within this process.
    key_locks: KeyLocks,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            key_locks: KeyLocks::new(),
        }
    }

    fn stack_prefix(&self, stack: &str) -> String {
        format!("{}stacks/{stack}/", self.prefix)
    }

    fn record_key(&self, stack: &str, id: &ResourceId) -> String {
        format!("{}resources/{}.json", self.stack_prefix(stack), hex::encode(id.as_str()))
    }

    fn stack_key(&self, stack: &str, file: &str) -> String {
        format!("{}{file}", self.stack_prefix(stack))
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackweaveError::State(StateError::backend(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackweaveError::State(StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackweaveError::State(StateError::backend(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_object(key).await? {
            Some(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                StackweaveError::State(StateError::corrupted(format!("Failed to parse s3://{}/{key}: {e}", self.bucket)))
            }),
            None => Ok(None),
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackweaveError::State(StateError::backend(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StackweaveError::State(StateError::serialization(format!("Failed to serialize state: {e}"))))?;
        self.put_object(key, &content).await
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackweaveError::State(StateError::backend(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Lists every key under a prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| StackweaveError::State(StateError::backend(format!("S3 list error: {e}"))))?;

            keys.extend(response.contents().iter().filter_map(|o| o.key().map(ToString::to_string)));

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load_stack(&self, stack: &str) -> Result<StackState> {
        let mut state = StackState::new(stack);
        let resources_prefix = format!("{}resources/", self.stack_prefix(stack));
        debug!("Loading stack from s3://{}/{resources_prefix}", self.bucket);

        for key in self.list_keys(&resources_prefix).await? {
            if let Some(record) = self.get_json::<StateRecord>(&key).await? {
                state.records.insert(record.resource_id.clone(), record);
            }
        }

        state.outputs = self.get_json(&self.stack_key(stack, OUTPUTS_KEY)).await?;
        state.history = self
            .get_json(&self.stack_key(stack, HISTORY_KEY))
            .await?
            .unwrap_or_default();

        Ok(state)
    }

    async fn get_record(&self, stack: &str, id: &ResourceId) -> Result<Option<StateRecord>> {
        self.get_json(&self.record_key(stack, id)).await
    }

    async fn put_record(&self, stack: &str, mut record: StateRecord, expected_version: Option<u64>) -> Result<StateRecord> {
        let key = self.record_key(stack, &record.resource_id);
        let _guard = self.key_locks.lock(&key).await;

        let found = self.get_json::<StateRecord>(&key).await?.map(|r| r.version);
        record.version = next_version(stack, &record.resource_id, found, expected_version)?;
        self.put_json(&key, &record).await?;

        debug!("Stored s3://{}/{key} at version {}", self.bucket, record.version);
        Ok(record)
    }

    async fn remove_record(&self, stack: &str, id: &ResourceId, expected_version: u64) -> Result<()> {
        let key = self.record_key(stack, id);
        let _guard = self.key_locks.lock(&key).await;

        let found = self.get_json::<StateRecord>(&key).await?.map(|r| r.version);
        next_version(stack, id, found, Some(expected_version))?;
        self.delete_object(&key).await
    }

    async fn load_outputs(&self, stack: &str) -> Result<Option<StackOutputs>> {
        self.get_json(&self.stack_key(stack, OUTPUTS_KEY)).await
    }

    async fn publish_outputs(&self, stack: &str, outputs: &StackOutputs) -> Result<()> {
        let key = self.stack_key(stack, OUTPUTS_KEY);
        let _guard = self.key_locks.lock(&key).await;
        self.put_json(&key, outputs).await?;
        info!("Published {} output(s) for stack {stack}", outputs.values.len());
        Ok(())
    }

    async fn clear_outputs(&self, stack: &str) -> Result<()> {
        let key = self.stack_key(stack, OUTPUTS_KEY);
        let _guard = self.key_locks.lock(&key).await;
        self.delete_object(&key).await
    }

    async fn append_history(&self, stack: &str, entry: HistoryEntry) -> Result<()> {
        let key = self.stack_key(stack, HISTORY_KEY);
        let _guard = self.key_locks.lock(&key).await;
        let mut history: Vec<HistoryEntry> = self.get_json(&key).await?.unwrap_or_default();
        push_history(&mut history, entry);
        self.put_json(&key, &history).await
    }

    async fn list_stacks(&self) -> Result<Vec<String>> {
        let root = format!("{}stacks/", self.prefix);
        let mut names: Vec<String> = self
            .list_keys(&root)
            .await?
            .into_iter()
            .filter(|key| !key.ends_with(LOCK_KEY) && !key.ends_with(HISTORY_KEY))
            .filter_map(|key| {
                key.strip_prefix(&root)
                    .and_then(|rest| rest.split('/').next())
                    .map(ToString::to_string)
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        let key = self.stack_key(stack, LOCK_KEY);
        let _guard = self.key_locks.lock(&key).await;

        if let Some(existing) = self.get_json::<LockInfo>(&key).await? {
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
        self.put_json(&key, &lock_info).await?;

        info!(
            "Acquired lock on {stack}: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        let key = self.stack_key(stack, LOCK_KEY);
        let _guard = self.key_locks.lock(&key).await;

        if let Some(existing) = self.get_json::<LockInfo>(&key).await? {
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released lock on {stack}: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        self.get_json(&self.stack_key(stack, LOCK_KEY)).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(Some("/team/state/")), "team/state/");
        assert_eq!(normalize_prefix(Some("//")), "");
        assert_eq!(normalize_prefix(None), "");
    }

    #[test]
    fn test_record_keys_are_hex_encoded() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        let store = S3StateStore::with_client(Client::from_conf(config), "bucket", Some("prod"));

        assert_eq!(
            store.record_key("network", &ResourceId::new("vpc")),
            "prod/stacks/network/resources/767063.json"
        );
        assert_eq!(store.stack_key("network", OUTPUTS_KEY), "prod/stacks/network/outputs.json");
    }
}
