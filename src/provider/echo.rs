//! In-process provider whose outputs echo its inputs.
//!
//! Every instance gets a generated `id` output. Inputs named in the
//! comma-separated `replace_on` setting force replacement when they change.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::{DiffOutcome, Provider, ProviderContext, ProviderResponse, ProviderResult};
use crate::model::ResolvedInputs;
use crate::state::StateRecord;

/// Setting listing inputs that force replacement.
pub const REPLACE_ON_SETTING: &str = "replace_on";

/// Echo provider.
#[derive(Debug, Default)]
pub struct EchoProvider {
    calls: AtomicUsize,
}

impl EchoProvider {
    /// Creates a new echo provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of create, update and delete calls served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(id: &str, kind: &str, inputs: &ResolvedInputs) -> ProviderResponse {
        let mut outputs: BTreeMap<String, JsonValue> = inputs.clone();
        outputs.insert(String::from("id"), JsonValue::String(id.to_string()));
        ProviderResponse {
            provider_state: json!({ "id": id, "kind": kind, "inputs": inputs }),
            outputs,
        }
    }
}

fn recorded_inputs(current: &StateRecord) -> ResolvedInputs {
    current
        .provider_state
        .get("inputs")
        .and_then(JsonValue::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn instance_id(kind: &str) -> String {
    let short = kind.rsplit(['/', ':']).next().unwrap_or(kind);
    format!("{short}-{}", &Uuid::new_v4().simple().to_string()[..8])
}

#[async_trait]
impl Provider for EchoProvider {
    async fn diff(
        &self,
        ctx: &ProviderContext,
        _kind: &str,
        desired: &ResolvedInputs,
        current: &StateRecord,
    ) -> ProviderResult<DiffOutcome> {
        let previous = recorded_inputs(current);
        if &previous == desired {
            return Ok(DiffOutcome::Noop);
        }

        let replace_on = ctx.settings.get(REPLACE_ON_SETTING).map_or("", String::as_str);
        let forces_replacement = replace_on
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .any(|key| previous.get(key) != desired.get(key));

        Ok(if forces_replacement {
            DiffOutcome::Replace
        } else {
            DiffOutcome::InPlace
        })
    }

    async fn create(&self, _ctx: &ProviderContext, kind: &str, inputs: &ResolvedInputs) -> ProviderResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::respond(&instance_id(kind), kind, inputs))
    }

    async fn update(
        &self,
        _ctx: &ProviderContext,
        kind: &str,
        inputs: &ResolvedInputs,
        current: &StateRecord,
    ) -> ProviderResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = current
            .provider_state
            .get("id")
            .and_then(JsonValue::as_str)
            .map_or_else(|| instance_id(kind), ToString::to_string);
        Ok(Self::respond(&id, kind, inputs))
    }

    async fn delete(&self, _ctx: &ProviderContext, _kind: &str, _current: &StateRecord) -> ProviderResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProviderId, ResourceId};

    fn inputs(cidr: &str, name: &str) -> ResolvedInputs {
        BTreeMap::from([
            (String::from("cidr"), json!(cidr)),
            (String::from("name"), json!(name)),
        ])
    }

    fn ctx_with_replace_on(keys: &str) -> ProviderContext {
        ProviderContext {
            settings: BTreeMap::from([(String::from(REPLACE_ON_SETTING), keys.to_string())]),
            ..ProviderContext::default()
        }
    }

    fn record_for(response: ProviderResponse) -> StateRecord {
        StateRecord::new(ResourceId::new("vpc"), "echo:vpc", ProviderId::new("echo"), "h")
            .with_provider_result(response.provider_state, response.outputs)
    }

    #[tokio::test]
    async fn test_create_echoes_inputs_with_id() {
        let provider = EchoProvider::new();
        let response = provider
            .create(&ProviderContext::default(), "echo:network/vpc", &inputs("10.0.0.0/16", "main"))
            .await
            .expect("create");

        assert_eq!(response.outputs["cidr"], json!("10.0.0.0/16"));
        let id = response.outputs["id"].as_str().expect("id is a string");
        assert!(id.starts_with("vpc-"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_diff_outcomes() {
        let provider = EchoProvider::new();
        let ctx = ctx_with_replace_on("cidr");
        let created = provider
            .create(&ctx, "echo:vpc", &inputs("10.0.0.0/16", "main"))
            .await
            .expect("create");
        let current = record_for(created);

        let same = provider
            .diff(&ctx, "echo:vpc", &inputs("10.0.0.0/16", "main"), &current)
            .await
            .expect("diff");
        assert_eq!(same, DiffOutcome::Noop);

        let renamed = provider
            .diff(&ctx, "echo:vpc", &inputs("10.0.0.0/16", "other"), &current)
            .await
            .expect("diff");
        assert_eq!(renamed, DiffOutcome::InPlace);

        let readdressed = provider
            .diff(&ctx, "echo:vpc", &inputs("10.1.0.0/16", "main"), &current)
            .await
            .expect("diff");
        assert_eq!(readdressed, DiffOutcome::Replace);
    }

    #[tokio::test]
    async fn test_update_keeps_instance_id() {
        let provider = EchoProvider::new();
        let ctx = ProviderContext::default();
        let created = provider
            .create(&ctx, "echo:vpc", &inputs("10.0.0.0/16", "main"))
            .await
            .expect("create");
        let original_id = created.outputs["id"].clone();
        let current = record_for(created);

        let updated = provider
            .update(&ctx, "echo:vpc", &inputs("10.0.0.0/16", "renamed"), &current)
            .await
            .expect("update");
        assert_eq!(updated.outputs["id"], original_id);
        assert_eq!(updated.outputs["name"], json!("renamed"));
    }
}
