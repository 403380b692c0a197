//! Diff engine comparing desired resources with prior state.
//!
//! Walks a stack's dependency graph in topological order, resolves each
//! resource's inputs and decides the action from the input hash and the
//! provider's `diff` answer.

use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{InputsHasher, ProjectConfig};
use crate::error::{PlanError, Result};
use crate::graph::DependencyGraph;
use crate::model::{ProviderId, Reference, Resource, ResourceId, Stack};
use crate::provider::{ContextResolution, DiffOutcome, ProviderRegistry};
use crate::resolver::{InputResolution, StackReferenceResolver};
use crate::state::{StackState, StateRecord};

use super::plan::{Action, ActionKind, Plan};

/// Engine computing plans for stacks.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    providers: &'a ProviderRegistry,
    resolver: &'a StackReferenceResolver<'a>,
    project: &'a ProjectConfig,
    hasher: InputsHasher,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(
        providers: &'a ProviderRegistry,
        resolver: &'a StackReferenceResolver<'a>,
        project: &'a ProjectConfig,
    ) -> Self {
        Self {
            providers,
            resolver,
            project,
            hasher: InputsHasher::new(),
        }
    }

    /// Computes the plan moving `prior` to the desired `stack`.
    ///
    /// Replanning the same inputs without applying yields the same plan.
    ///
    /// # Errors
    ///
    /// Structural errors (unknown provider, unknown stack or output) and
    /// provider `diff` failures.
    pub async fn plan(&self, stack: &Stack, graph: &DependencyGraph, prior: &StackState) -> Result<Plan> {
        let orphans: Vec<&StateRecord> = prior
            .records
            .values()
            .filter(|r| !stack.contains(r.resource_id.as_str()))
            .collect();
        // Replaced instances left over from an earlier apply whose delete did not finish.
        let (leftovers, orphans): (Vec<&StateRecord>, Vec<&StateRecord>) = orphans
            .into_iter()
            .partition(|r| r.resource_id.is_replaced_instance() && stack.contains(r.resource_id.base()));

        self.check_providers(
            stack
                .resources()
                .iter()
                .map(|r| (&r.id, &r.provider))
                .chain(orphans.iter().chain(&leftovers).map(|r| (&r.resource_id, &r.provider))),
        )?;

        let mut plan = Plan::new(stack.name(), stack.outputs().clone());
        let mut settled: HashMap<&ResourceId, &BTreeMap<String, JsonValue>> = HashMap::new();
        let mut action_index: HashMap<ResourceId, usize> = HashMap::new();
        let mut replaced = Vec::new();

        for id in graph.order() {
            let resource = stack.get(id.as_str()).ok_or_else(|| PlanError::InvalidPlan {
                message: format!("graph node '{id}' is not declared in stack '{}'", stack.name()),
            })?;
            let record = prior.get(id.as_str());

            let mut action = self.plan_resource(stack.name(), resource, record, &settled).await?;
            action.depends_on = graph
                .dependencies(id.as_str())
                .into_iter()
                .filter_map(|dep| action_index.get(dep).copied())
                .collect();

            if action.kind == ActionKind::NoOp
                && let Some(record) = record
            {
                settled.insert(id, &record.outputs);
            }

            debug!("Planned {action}");
            let replacement = action.replacement;
            let idx = plan.push(action);
            if replacement {
                replaced.push(idx);
            }
            action_index.insert(id.clone(), idx);
        }

        for create_idx in replaced {
            let id = plan.actions[create_idx].resource_id.clone();
            let mut after = vec![create_idx];
            after.extend(
                graph
                    .transitive_dependents(id.as_str())
                    .iter()
                    .filter_map(|dep| action_index.get(dep).copied()),
            );
            plan.push_replacement_delete(create_idx, after);
        }

        for old in leftovers {
            let base = old.resource_id.base();
            let after = std::iter::once(base)
                .chain(graph.transitive_dependents(base).iter().map(ResourceId::as_str))
                .filter_map(|id| action_index.get(id).copied())
                .collect();
            plan.push_replaced_delete(old.clone(), after);
        }

        plan.push_deletes(orphans.into_iter().cloned().collect(), "removed from stack");

        info!(
            "Planned stack {}: {} to create, {} to update, {} to delete, {} pending",
            stack.name(),
            plan.count(ActionKind::Create),
            plan.count(ActionKind::Update),
            plan.count(ActionKind::Delete),
            plan.count(ActionKind::PendingDependency)
        );
        Ok(plan)
    }

    /// Computes a plan deleting every recorded resource of a stack.
    ///
    /// # Errors
    ///
    /// `UnknownProvider` if a record names an unregistered provider.
    pub fn plan_destroy(&self, prior: &StackState) -> Result<Plan> {
        self.check_providers(prior.records.values().map(|r| (&r.resource_id, &r.provider)))?;
        let plan = Plan::destroy(prior);
        info!("Planned destroy of stack {}: {} to delete", prior.stack, plan.action_count());
        Ok(plan)
    }

    fn check_providers<'r>(&self, resources: impl Iterator<Item = (&'r ResourceId, &'r ProviderId)>) -> Result<()> {
        for (id, provider) in resources {
            if !self.providers.contains(provider.as_str()) {
                return Err(PlanError::UnknownProvider {
                    resource: id.to_string(),
                    provider: provider.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Decides the action for one desired resource.
    async fn plan_resource(
        &self,
        stack: &str,
        resource: &Resource,
        record: Option<&StateRecord>,
        settled: &HashMap<&ResourceId, &BTreeMap<String, JsonValue>>,
    ) -> Result<Action> {
        let resolution = self
            .resolver
            .resolve_inputs(
                &resource.inputs,
                |id: &ResourceId, key: &str| settled.get(id).and_then(|outputs| outputs.get(key)).cloned(),
                Duration::ZERO,
            )
            .await?;

        let resolved = match resolution {
            InputResolution::Resolved(resolved) => resolved,
            InputResolution::Unresolved(refs) => return Ok(unresolved_action(resource, record, refs)),
        };

        let hash = self.hasher.hash_inputs(&resource.kind, &resource.provider, &resolved);

        if let Some(record) = record
            && record.inputs_hash == hash
        {
            return Ok(Action::for_resource(resource, ActionKind::NoOp, "up to date")
                .with_hash(hash)
                .with_prior(Some(record)));
        }

        let unknown_provider = || PlanError::UnknownProvider {
            resource: resource.id.to_string(),
            provider: resource.provider.to_string(),
        };
        let ctx = match self
            .providers
            .resolve_context(resource.provider.as_str(), self.project, stack, self.resolver, Duration::ZERO)
            .await?
            .ok_or_else(unknown_provider)?
        {
            ContextResolution::Ready(ctx) => ctx,
            ContextResolution::Waiting(refs) => return Ok(settings_pending_action(resource, record, refs)),
        };

        let Some(record) = record else {
            return Ok(Action::for_resource(resource, ActionKind::Create, "not yet created").with_hash(hash));
        };

        if record.kind != resource.kind || record.provider != resource.provider {
            let mut action = Action::for_resource(
                resource,
                ActionKind::Create,
                format!("kind or provider changed from {} ({})", record.kind, record.provider),
            )
            .with_hash(hash)
            .with_prior(Some(record));
            action.replacement = true;
            return Ok(action);
        }

        let provider = self.providers.get(resource.provider.as_str()).ok_or_else(unknown_provider)?;

        let outcome = provider.diff(&ctx, &resource.kind, &resolved, record).await?;
        debug!("Provider {} reports {outcome} for {}", resource.provider, resource.id);

        let action = match outcome {
            DiffOutcome::InPlace => Action::for_resource(resource, ActionKind::Update, "inputs changed"),
            DiffOutcome::Replace => {
                let mut action = Action::for_resource(resource, ActionKind::Create, "inputs changed, replacement required");
                action.replacement = true;
                action
            }
            DiffOutcome::Noop => Action::for_resource(resource, ActionKind::NoOp, "no effective change"),
        };
        Ok(action.with_hash(hash).with_prior(Some(record)))
    }
}

/// Action for a resource whose provider settings wait on other stacks.
fn settings_pending_action(resource: &Resource, record: Option<&StateRecord>, refs: Vec<Reference>) -> Action {
    let waiting = refs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    let mut action = Action::for_resource(
        resource,
        ActionKind::PendingDependency,
        format!("provider {} waiting for {waiting}", resource.provider),
    );
    action.unresolved = refs;
    action.with_prior(record)
}

/// Action for a resource whose inputs are not fully known yet.
fn unresolved_action(resource: &Resource, record: Option<&StateRecord>, refs: Vec<Reference>) -> Action {
    let waiting = refs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");

    let mut action = if refs.iter().any(|r| matches!(r, Reference::Stack { .. })) {
        Action::for_resource(
            resource,
            ActionKind::PendingDependency,
            format!("waiting for {waiting}"),
        )
    } else {
        let kind = if record.is_some() {
            ActionKind::Update
        } else {
            ActionKind::Create
        };
        let mut action = Action::for_resource(resource, kind, format!("inputs known after apply: {waiting}"));
        action.deferred_inputs = true;
        action
    };
    action.unresolved = refs;
    action.with_prior(record)
}
