//! Cross-stack output resolution.
//!
//! Resolves `StackOutput` placeholders from the outputs other stacks
//! published to the state store. The resolver is read-only: it never calls
//! providers. Concrete answers are cached per `(stack, key)` until
//! [`StackReferenceResolver::reset`] starts a new cycle; unresolved answers
//! are not cached so a later call observes newly published values.

use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ResolveError, Result};
use crate::model::{Inputs, Reference, ResolvedInputs, ResourceId, Value};
use crate::state::StateStore;

/// Default interval between polls in [`StackReferenceResolver::wait_for_output`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of resolving a resource's inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum InputResolution {
    /// Every placeholder resolved.
    Resolved(ResolvedInputs),
    /// Some placeholders are not available yet.
    Unresolved(Vec<Reference>),
}

impl InputResolution {
    /// Unresolved cross-stack references.
    #[must_use]
    pub fn pending_stacks(&self) -> Vec<&Reference> {
        match self {
            Self::Resolved(_) => Vec::new(),
            Self::Unresolved(refs) => refs
                .iter()
                .filter(|r| matches!(r, Reference::Stack { .. }))
                .collect(),
        }
    }
}

/// Resolver for outputs exported by other stacks.
pub struct StackReferenceResolver<'a> {
    store: &'a dyn StateStore,
    declared: BTreeSet<String>,
    cache: Mutex<HashMap<(String, String), JsonValue>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for StackReferenceResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackReferenceResolver")
            .field("backend", &self.store.backend_type())
            .field("declared", &self.declared)
            .finish_non_exhaustive()
    }
}

impl<'a> StackReferenceResolver<'a> {
    /// Creates a resolver over `store` knowing the project's declared stacks.
    #[must_use]
    pub fn new<I, S>(store: &'a dyn StateStore, declared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            declared: declared.into_iter().map(Into::into).collect(),
            cache: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the poll interval used while waiting for outputs.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(String, String), JsonValue>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new plan/apply cycle, dropping cached answers.
    pub fn reset(&self) {
        self.cache().clear();
    }

    /// Resolves one output of another stack.
    ///
    /// Returns a literal when the output is published, or an unresolved
    /// `StackOutput` value when the stack has not been applied yet or its
    /// last publish was incomplete and lacks the key.
    ///
    /// # Errors
    ///
    /// `UnknownStack` if the stack is neither declared nor in the store;
    /// `UnknownOutput` if a complete publish lacks the key.
    pub async fn resolve_output(&self, stack: &str, key: &str) -> Result<Value> {
        let cache_key = (stack.to_string(), key.to_string());
        if let Some(value) = self.cache().get(&cache_key) {
            return Ok(Value::Literal(value.clone()));
        }

        let outputs = self.store.load_outputs(stack).await?;

        let Some(outputs) = outputs else {
            if !self.declared.contains(stack) && !self.store.list_stacks().await?.iter().any(|s| s == stack) {
                return Err(ResolveError::UnknownStack {
                    stack: stack.to_string(),
                }
                .into());
            }
            debug!("Stack {stack} has not published outputs yet");
            return Ok(Value::stack_output(stack, key));
        };

        match outputs.values.get(key) {
            Some(value) => {
                self.cache().insert(cache_key, value.clone());
                Ok(Value::Literal(value.clone()))
            }
            None if outputs.complete => Err(ResolveError::UnknownOutput {
                stack: stack.to_string(),
                key: key.to_string(),
            }
            .into()),
            None => {
                debug!("Stack {stack} published incomplete outputs without {key}");
                Ok(Value::stack_output(stack, key))
            }
        }
    }

    /// Polls until the output resolves or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve_output`].
    pub async fn wait_for_output(&self, stack: &str, key: &str, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.resolve_output(stack, key).await?;
            if value.is_resolved() || Instant::now() >= deadline {
                return Ok(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Resolves a whole value tree.
    ///
    /// `resource_output` answers `Deferred` placeholders from outputs of
    /// resources in the same stack. Cross-stack placeholders are looked up
    /// once each, waiting up to `wait` for unpublished outputs.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve_output`].
    pub async fn resolve_value<F>(&self, value: &Value, resource_output: F, wait: Duration) -> Result<std::result::Result<JsonValue, Vec<Reference>>>
    where
        F: Fn(&ResourceId, &str) -> Option<JsonValue>,
    {
        let stack_values = self.lookup_stack_references(value.references(), wait).await?;
        Ok(value.resolve_with(&mut |reference: &Reference| lookup(reference, &stack_values, &resource_output)))
    }

    /// Resolves every input of a resource.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve_output`].
    pub async fn resolve_inputs<F>(&self, inputs: &Inputs, resource_output: F, wait: Duration) -> Result<InputResolution>
    where
        F: Fn(&ResourceId, &str) -> Option<JsonValue>,
    {
        let references = inputs.values().flat_map(Value::references).collect();
        let stack_values = self.lookup_stack_references(references, wait).await?;

        let mut resolved = ResolvedInputs::new();
        let mut missing = Vec::new();
        for (name, value) in inputs {
            match value.resolve_with(&mut |reference: &Reference| lookup(reference, &stack_values, &resource_output)) {
                Ok(json) => {
                    resolved.insert(name.clone(), json);
                }
                Err(refs) => missing.extend(refs),
            }
        }

        if missing.is_empty() {
            Ok(InputResolution::Resolved(resolved))
        } else {
            missing.sort();
            missing.dedup();
            Ok(InputResolution::Unresolved(missing))
        }
    }

    async fn lookup_stack_references(
        &self,
        references: Vec<Reference>,
        wait: Duration,
    ) -> Result<BTreeMap<(String, String), JsonValue>> {
        let mut values = BTreeMap::new();
        for reference in references {
            let Reference::Stack { stack, key } = reference else {
                continue;
            };
            if values.contains_key(&(stack.clone(), key.clone())) {
                continue;
            }
            let value = if wait.is_zero() {
                self.resolve_output(&stack, &key).await?
            } else {
                self.wait_for_output(&stack, &key, wait).await?
            };
            if let Value::Literal(json) = value {
                values.insert((stack, key), json);
            }
        }
        Ok(values)
    }
}

fn lookup<F>(reference: &Reference, stack_values: &BTreeMap<(String, String), JsonValue>, resource_output: &F) -> Option<JsonValue>
where
    F: Fn(&ResourceId, &str) -> Option<JsonValue>,
{
    match reference {
        Reference::Resource { resource, key } => resource_output(resource, key),
        Reference::Stack { stack, key } => stack_values.get(&(stack.clone(), key.clone())).cloned(),
    }
}
