//! Provider boundary.
//!
//! Providers own the semantics of resource kinds. The engine only talks to
//! them through the [`Provider`] trait, passing an explicit
//! [`ProviderContext`] with every call.

mod echo;
mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{parse_value, ProjectConfig, ProviderConfig, ProviderType};
use crate::error::{ConfigError, ProviderError, Result};
use crate::model::{Inputs, ProviderId, Reference, ResolvedInputs, Stack, Value};
use crate::resolver::{InputResolution, StackReferenceResolver};
use crate::state::StateRecord;

pub use echo::EchoProvider;
pub use http::HttpProvider;

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Everything a provider may need besides the resource itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderContext {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Stack being applied.
    pub stack: String,
    /// Provider id the call is routed to.
    pub provider: String,
    /// Provider settings, resolved for the stack. Non-string values are
    /// passed as JSON text.
    pub settings: BTreeMap<String, String>,
    /// Credentials, never serialized.
    #[serde(skip)]
    pub credentials: Option<String>,
}

/// How a provider wants to converge a changed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOutcome {
    /// Update the existing instance.
    InPlace,
    /// Create a new instance and delete the old one.
    Replace,
    /// Nothing effectively changed.
    #[serde(alias = "no_op")]
    Noop,
}

/// Result of a create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Opaque provider-owned state stored in the record.
    #[serde(default, rename = "state")]
    pub provider_state: JsonValue,
    /// Outputs exposed to dependents.
    #[serde(default)]
    pub outputs: BTreeMap<String, JsonValue>,
}

/// A provider context for one stack, or the stack outputs its settings
/// still wait on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextResolution {
    /// Every setting is known.
    Ready(ProviderContext),
    /// Settings reference outputs that are not published yet.
    Waiting(Vec<Reference>),
}

/// Operations a provider implements per resource kind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Decides how to converge `current` towards `desired`.
    async fn diff(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        desired: &ResolvedInputs,
        current: &StateRecord,
    ) -> ProviderResult<DiffOutcome>;

    /// Creates a new instance.
    async fn create(&self, ctx: &ProviderContext, kind: &str, inputs: &ResolvedInputs) -> ProviderResult<ProviderResponse>;

    /// Updates an existing instance in place.
    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        inputs: &ResolvedInputs,
        current: &StateRecord,
    ) -> ProviderResult<ProviderResponse>;

    /// Deletes an instance.
    async fn delete(&self, ctx: &ProviderContext, kind: &str, current: &StateRecord) -> ProviderResult<()>;
}

struct Registration {
    provider: Arc<dyn Provider>,
    settings: Inputs,
    credentials: Option<String>,
}

/// Providers keyed by id.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<ProviderId, Registration>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider without settings or credentials.
    pub fn register(&mut self, id: impl Into<ProviderId>, provider: Arc<dyn Provider>) {
        self.register_with(id, provider, BTreeMap::new(), None);
    }

    /// Registers a provider with fixed settings and credentials.
    pub fn register_with(
        &mut self,
        id: impl Into<ProviderId>,
        provider: Arc<dyn Provider>,
        settings: BTreeMap<String, String>,
        credentials: Option<String>,
    ) {
        let settings = settings.into_iter().map(|(k, v)| (k, Value::literal(v))).collect();
        self.register_with_values(id, provider, settings, credentials);
    }

    /// Registers a provider whose settings may read other stacks' outputs.
    ///
    /// Settings are resolved per stack when a call is routed to the provider.
    pub fn register_with_values(
        &mut self,
        id: impl Into<ProviderId>,
        provider: Arc<dyn Provider>,
        settings: Inputs,
        credentials: Option<String>,
    ) {
        let id = id.into();
        debug!("Registering provider {id}");
        self.entries.insert(
            id,
            Registration {
                provider,
                settings,
                credentials,
            },
        );
    }

    /// Builds a registry from configuration.
    ///
    /// `env` looks up environment variables named by `token_env`. Settings
    /// may use `$stack` and `$concat` and the `${project}` and
    /// `${environment}` placeholders.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP provider lacks an endpoint or its client
    /// cannot be created, or if a setting is malformed or uses `$ref`.
    pub fn from_config<F>(project: &ProjectConfig, providers: &[ProviderConfig], env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = Self::new();
        for config in providers {
            let provider: Arc<dyn Provider> = match config.provider_type {
                ProviderType::Echo => Arc::new(EchoProvider::new()),
                ProviderType::Http => {
                    let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                        ConfigError::validation(
                            format!("HTTP provider '{}' requires an endpoint", config.name),
                            format!("providers.{}.endpoint", config.name),
                        )
                    })?;
                    Arc::new(HttpProvider::new(endpoint, Duration::from_secs(config.timeout_secs))?)
                }
            };
            let credentials = config.token_env.as_deref().and_then(&env);
            let settings = parse_settings(project, config)?;
            registry.register_with_values(config.name.as_str(), provider, settings, credentials);
        }
        Ok(registry)
    }

    /// Returns true if a provider is registered under `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Gets a provider by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.entries.get(id).map(|r| Arc::clone(&r.provider))
    }

    /// Registered provider ids.
    #[must_use]
    pub fn ids(&self) -> Vec<&ProviderId> {
        self.entries.keys().collect()
    }

    /// Stacks whose outputs the settings of provider `id` read.
    #[must_use]
    pub fn referenced_stacks(&self, id: &str) -> BTreeSet<String> {
        self.entries
            .get(id)
            .into_iter()
            .flat_map(|r| r.settings.values().flat_map(Value::references))
            .filter_map(|r| match r {
                Reference::Stack { stack, .. } => Some(stack),
                Reference::Resource { .. } => None,
            })
            .collect()
    }

    /// Stacks read by the settings of the providers `stack` uses.
    #[must_use]
    pub fn stacks_read_by_providers_of(&self, stack: &Stack) -> BTreeSet<String> {
        let used: BTreeSet<&str> = stack.resources().iter().map(|r| r.provider.as_str()).collect();
        let mut stacks: BTreeSet<String> = used.into_iter().flat_map(|id| self.referenced_stacks(id)).collect();
        stacks.remove(stack.name());
        stacks
    }

    /// Builds the context for a call routed to provider `id`, with only the
    /// settings that are already literal.
    #[must_use]
    pub fn context(&self, id: &str, project: &ProjectConfig, stack: &str) -> Option<ProviderContext> {
        self.entries.get(id).map(|r| {
            let settings = r
                .settings
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::Literal(json) => Some((k.clone(), render_setting(json.clone()))),
                    _ => None,
                })
                .collect();
            ProviderContext {
                project: project.name.clone(),
                environment: project.environment.clone(),
                stack: stack.to_string(),
                provider: id.to_string(),
                settings,
                credentials: r.credentials.clone(),
            }
        })
    }

    /// Builds the context for a call routed to provider `id`, resolving
    /// settings that read other stacks' outputs.
    ///
    /// Returns `None` if no provider is registered under `id`.
    ///
    /// # Errors
    ///
    /// `UnknownStack` or `UnknownOutput` from the resolver.
    pub async fn resolve_context(
        &self,
        id: &str,
        project: &ProjectConfig,
        stack: &str,
        resolver: &StackReferenceResolver<'_>,
        wait: Duration,
    ) -> Result<Option<ContextResolution>> {
        let Some(registration) = self.entries.get(id) else {
            return Ok(None);
        };
        let Some(mut ctx) = self.context(id, project, stack) else {
            return Ok(None);
        };
        if registration.settings.values().all(|v| matches!(v, Value::Literal(_))) {
            return Ok(Some(ContextResolution::Ready(ctx)));
        }

        match resolver.resolve_inputs(&registration.settings, |_, _| None, wait).await? {
            InputResolution::Resolved(values) => {
                ctx.settings = values.into_iter().map(|(k, v)| (k, render_setting(v))).collect();
                Ok(Some(ContextResolution::Ready(ctx)))
            }
            InputResolution::Unresolved(refs) => Ok(Some(ContextResolution::Waiting(refs))),
        }
    }
}

/// Parses a provider's settings.
fn parse_settings(project: &ProjectConfig, config: &ProviderConfig) -> Result<Inputs> {
    let placeholders = BTreeMap::from([
        ("project", project.name.as_str()),
        ("environment", project.environment.as_str()),
    ]);

    let mut settings = Inputs::new();
    for (key, raw) in &config.settings {
        let value = parse_value(raw, &placeholders)?;
        if let Some(reference) = value.references().into_iter().find(|r| matches!(r, Reference::Resource { .. })) {
            return Err(ConfigError::InvalidReference {
                reference: format!("providers.{}.settings.{key}: {reference}", config.name),
                reason: String::from("provider settings cannot read resource outputs; use $stack"),
            }
            .into());
        }
        settings.insert(key.clone(), value);
    }
    Ok(settings)
}

/// Strings pass through; anything else becomes JSON text.
fn render_setting(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

impl std::fmt::Display for DiffOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match self {
            Self::InPlace => "in-place",
            Self::Replace => "replace",
            Self::Noop => "no-op",
        };
        write!(f, "{outcome}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateStore, StackOutputs, StateStore};
    use serde_json::json;

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: String::from("demo"),
            environment: String::from("staging"),
        }
    }

    #[test]
    fn test_registry_from_config() {
        let providers = vec![
            ProviderConfig {
                name: String::from("echo"),
                provider_type: ProviderType::Echo,
                endpoint: None,
                timeout_secs: 30,
                token_env: Some(String::from("ECHO_TOKEN")),
                settings: BTreeMap::from([
                    (String::from("replace_on"), json!("cidr")),
                    (String::from("retries"), json!(3)),
                ]),
            },
            ProviderConfig {
                name: String::from("aws"),
                provider_type: ProviderType::Http,
                endpoint: Some(String::from("http://localhost:9000")),
                timeout_secs: 10,
                token_env: None,
                settings: BTreeMap::new(),
            },
        ];

        let registry = ProviderRegistry::from_config(&project(), &providers, |name| {
            (name == "ECHO_TOKEN").then(|| String::from("secret"))
        })
        .expect("registry");

        assert!(registry.contains("echo"));
        assert!(registry.contains("aws"));
        assert!(!registry.contains("kubernetes"));

        let ctx = registry.context("echo", &project(), "network").expect("context");
        assert_eq!(ctx.environment, "staging");
        assert_eq!(ctx.stack, "network");
        assert_eq!(ctx.credentials.as_deref(), Some("secret"));
        assert_eq!(ctx.settings.get("replace_on").map(String::as_str), Some("cidr"));
        assert_eq!(ctx.settings.get("retries").map(String::as_str), Some("3"));
    }

    fn kubernetes(settings: BTreeMap<String, JsonValue>) -> Vec<ProviderConfig> {
        vec![ProviderConfig {
            name: String::from("kubernetes"),
            provider_type: ProviderType::Echo,
            endpoint: None,
            timeout_secs: 30,
            token_env: None,
            settings,
        }]
    }

    #[tokio::test]
    async fn test_settings_read_stack_outputs() {
        let providers = kubernetes(BTreeMap::from([
            (String::from("kubeconfig"), json!({ "$stack": "cluster.kubeconfig" })),
            (String::from("namespace"), json!("${environment}-mesh")),
        ]));
        let registry = ProviderRegistry::from_config(&project(), &providers, |_| None).expect("registry");
        assert_eq!(registry.referenced_stacks("kubernetes"), BTreeSet::from([String::from("cluster")]));

        let mut mesh = Stack::new("mesh");
        mesh.declare("kubernetes:helm/release", "istiod", Inputs::new(), Vec::<String>::new())
            .expect("declare");
        assert_eq!(registry.stacks_read_by_providers_of(&mesh), BTreeSet::from([String::from("cluster")]));

        let store = MemoryStateStore::new();
        let resolver = StackReferenceResolver::new(&store, ["cluster", "mesh"]);
        let waiting = registry
            .resolve_context("kubernetes", &project(), "mesh", &resolver, Duration::ZERO)
            .await
            .expect("resolve");
        assert!(matches!(waiting, Some(ContextResolution::Waiting(refs)) if refs.len() == 1));

        let outputs = BTreeMap::from([(String::from("kubeconfig"), json!("kc-123"))]);
        store
            .publish_outputs("cluster", &StackOutputs::new(outputs, true))
            .await
            .expect("publish");
        let Some(ContextResolution::Ready(ctx)) = registry
            .resolve_context("kubernetes", &project(), "mesh", &resolver, Duration::ZERO)
            .await
            .expect("resolve")
        else {
            panic!("settings should resolve once cluster published");
        };
        assert_eq!(ctx.settings["kubeconfig"], "kc-123");
        assert_eq!(ctx.settings["namespace"], "staging-mesh");
        assert_eq!(ctx.stack, "mesh");
    }

    #[test]
    fn test_settings_cannot_read_resource_outputs() {
        let providers = kubernetes(BTreeMap::from([(String::from("kubeconfig"), json!({ "$ref": "cluster.kubeconfig" }))]));
        let err = ProviderRegistry::from_config(&project(), &providers, |_| None).expect_err("resource reference");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let providers = vec![ProviderConfig {
            name: String::from("aws"),
            provider_type: ProviderType::Http,
            endpoint: None,
            timeout_secs: 10,
            token_env: None,
            settings: BTreeMap::new(),
        }];

        assert!(ProviderRegistry::from_config(&project(), &providers, |_| None).is_err());
    }

    #[test]
    fn test_context_never_serializes_credentials() {
        let ctx = ProviderContext {
            credentials: Some(String::from("secret")),
            ..ProviderContext::default()
        };
        let json = serde_json::to_string(&ctx).expect("serialize");
        assert!(!json.contains("secret"));
    }
}
