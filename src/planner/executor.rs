//! Plan executor.
//!
//! Walks a plan with bounded parallelism. An action starts once every
//! action it depends on finished `Succeeded` or `NoOp`. Failures block the
//! failed node's dependents while independent branches continue.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, InputsHasher, ProjectConfig};
use crate::error::{ApplyError, PlanError, ProviderError, Result, StackweaveError};
use crate::model::{Reference, ResolvedInputs, Resource, ResourceId};
use crate::provider::{ContextResolution, DiffOutcome, Provider, ProviderContext, ProviderRegistry, ProviderResponse};
use crate::resolver::{InputResolution, StackReferenceResolver};
use crate::state::{HistoryEntry, StackOperation, StackOutputs, StateRecord, StateStore};

use super::plan::{Action, ActionKind, Plan};

/// Tuning for an apply run.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Maximum number of actions running at once.
    pub parallelism: usize,
    /// Attempts per provider call, including the first.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff.
    pub retry_base_delay: Duration,
    /// Cap on the backoff delay.
    pub retry_max_delay: Duration,
    /// Per-call timeout. `None` waits forever.
    pub operation_timeout: Option<Duration>,
    /// How long in-flight calls may finish after cancellation.
    pub cancel_grace: Duration,
    /// How long a node waits for unpublished cross-stack outputs.
    pub output_wait: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl ExecutorSettings {
    /// Builds settings from the engine section of the project file.
    #[must_use]
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            parallelism: engine.parallelism.max(1),
            max_attempts: engine.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(engine.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(engine.retry_max_delay_ms.max(engine.retry_base_delay_ms)),
            operation_timeout: engine.operation_timeout(),
            cancel_grace: Duration::from_secs(engine.cancel_grace_secs),
            output_wait: Duration::from_secs(engine.output_wait_secs),
        }
    }

    /// Delay before retry number `retries + 1`.
    #[must_use]
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1_u32 << retries.min(20);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Terminal status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// The provider call and state write succeeded.
    Succeeded,
    /// Nothing to do.
    #[serde(rename = "no_op")]
    NoOp,
    /// The provider call failed.
    Failed,
    /// A dependency did not converge, or inputs stayed unresolved.
    Blocked,
    /// Not started before cancellation.
    Cancelled,
    /// The provider's effect is unknown; state may not match reality.
    NeedsReconciliation,
}

impl NodeStatus {
    /// Returns true for statuses that let dependents run.
    #[must_use]
    pub const fn is_converged(self) -> bool {
        matches!(self, Self::Succeeded | Self::NoOp)
    }
}

/// Error attached to a node report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeError {
    /// Provider or engine message.
    pub message: String,
    /// Whether re-running apply is safe, i.e. the failed operation had no
    /// unknown effect.
    pub retry_safe: bool,
}

/// Outcome of one plan action.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Resource id.
    pub resource_id: ResourceId,
    /// Planned action.
    pub action: ActionKind,
    /// Part of a replacement.
    pub replacement: bool,
    /// Terminal status.
    pub status: NodeStatus,
    /// Provider call attempts.
    pub attempts: u32,
    /// Error, for non-converged statuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// Stack name.
    pub stack: String,
    /// One report per action, in plan order, then apply-time replacement deletes.
    pub reports: Vec<NodeReport>,
    /// Outputs published for downstream stacks.
    pub outputs: BTreeMap<String, JsonValue>,
    /// Whether every declared output resolved.
    pub outputs_complete: bool,
    /// When the walk started.
    pub started_at: DateTime<Utc>,
    /// When the walk finished.
    pub finished_at: DateTime<Utc>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl ApplyResult {
    /// Returns true if every node converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.reports.iter().all(|r| r.status.is_converged())
    }

    /// Number of nodes with a given status.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    /// Report for a resource's main action.
    #[must_use]
    pub fn report(&self, id: &str) -> Option<&NodeReport> {
        self.reports.iter().find(|r| r.resource_id.as_str() == id && !(r.replacement && r.action == ActionKind::Delete))
    }

    /// Converts a non-converged run into `ApplyError::PartialFailure`.
    ///
    /// # Errors
    ///
    /// Returns the failure summary unless every node converged.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ApplyError::PartialFailure {
            stack: self.stack.clone(),
            failed: self.count(NodeStatus::Failed),
            blocked: self.count(NodeStatus::Blocked),
            cancelled: self.count(NodeStatus::Cancelled),
            needs_reconciliation: self.count(NodeStatus::NeedsReconciliation),
        }
        .into())
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// What a finished node hands back to the walk.
struct NodeOutcome {
    status: NodeStatus,
    attempts: u32,
    error: Option<NodeError>,
    outputs: Option<BTreeMap<String, JsonValue>>,
    /// Old instance to delete after the walk (apply-time replacement).
    replaced: Option<StateRecord>,
}

impl NodeOutcome {
    fn converged(status: NodeStatus, attempts: u32, outputs: BTreeMap<String, JsonValue>) -> Self {
        Self {
            status,
            attempts,
            error: None,
            outputs: Some(outputs),
            replaced: None,
        }
    }

    fn failed(status: NodeStatus, attempts: u32, message: impl Into<String>, retry_safe: bool) -> Self {
        Self {
            status,
            attempts,
            error: Some(NodeError {
                message: message.into(),
                retry_safe,
            }),
            outputs: None,
            replaced: None,
        }
    }

    fn from_provider_error(err: &ProviderError, attempts: u32) -> Self {
        if err.indeterminate {
            Self::failed(NodeStatus::NeedsReconciliation, attempts, err.message.clone(), false)
        } else {
            Self::failed(NodeStatus::Failed, attempts, err.message.clone(), true)
        }
    }

    fn from_state_error(err: &StackweaveError, attempts: u32) -> Self {
        Self::failed(
            NodeStatus::NeedsReconciliation,
            attempts,
            format!("provider call succeeded but the state write failed: {err}"),
            false,
        )
    }
}

/// Executor for plans.
pub struct ApplyExecutor<'a> {
    providers: &'a ProviderRegistry,
    store: &'a dyn StateStore,
    resolver: &'a StackReferenceResolver<'a>,
    project: &'a ProjectConfig,
    settings: ExecutorSettings,
    cancel: CancellationToken,
    hasher: InputsHasher,
}

impl std::fmt::Debug for ApplyExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("backend", &self.store.backend_type())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<'a> ApplyExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        providers: &'a ProviderRegistry,
        store: &'a dyn StateStore,
        resolver: &'a StackReferenceResolver<'a>,
        project: &'a ProjectConfig,
    ) -> Self {
        Self {
            providers,
            store,
            resolver,
            project,
            settings: ExecutorSettings::default(),
            cancel: CancellationToken::new(),
            hasher: InputsHasher::new(),
        }
    }

    /// Sets the run settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the cancellation token observed by the walk.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies a plan.
    ///
    /// Node failures are reported in the result, not returned as errors.
    ///
    /// # Errors
    ///
    /// Structural problems detected before any provider call: an action
    /// naming an unregistered provider, or a malformed plan.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyResult> {
        self.check_plan(plan)?;

        let started_at = Utc::now();
        info!("Applying plan for stack {} with {} actions", plan.stack, plan.actions.len());

        let count = plan.actions.len();
        let mut outcomes: Vec<Option<NodeOutcome>> = (0..count).map(|_| None).collect();
        let mut pending: BTreeSet<usize> = (0..count).collect();
        let mut running: BTreeSet<usize> = BTreeSet::new();
        let mut known: HashMap<ResourceId, BTreeMap<String, JsonValue>> = HashMap::new();
        let mut cancelled = false;
        let mut grace_deadline: Option<Instant> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                grace_deadline = Some(Instant::now() + self.settings.cancel_grace);
                warn!(
                    "Apply of stack {} cancelled; {} actions not started, {} in flight",
                    plan.stack,
                    pending.len(),
                    running.len()
                );
                for idx in std::mem::take(&mut pending) {
                    outcomes[idx] = Some(NodeOutcome::failed(NodeStatus::Cancelled, 0, "cancelled before start", true));
                }
            }

            if !cancelled {
                block_unreachable(plan, &mut pending, &mut outcomes);

                let ready: Vec<usize> = pending
                    .iter()
                    .copied()
                    .filter(|&idx| {
                        plan.actions[idx]
                            .depends_on
                            .iter()
                            .all(|&dep| outcomes[dep].as_ref().is_some_and(|o| o.status.is_converged()))
                    })
                    .take(self.settings.parallelism.saturating_sub(running.len()))
                    .collect();

                for idx in ready {
                    pending.remove(&idx);
                    running.insert(idx);
                    let action = &plan.actions[idx];
                    let lookup = snapshot_outputs(action, &known);
                    debug!("Starting {}", action.description());
                    in_flight.push(async move { (idx, self.run_node(&plan.stack, action, lookup).await) });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let next = if let Some(deadline) = grace_deadline {
                match tokio::time::timeout_at(deadline, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        for idx in std::mem::take(&mut running) {
                            error!(
                                "Abandoned {} after the cancellation grace period",
                                plan.actions[idx].description()
                            );
                            outcomes[idx] = Some(NodeOutcome::failed(
                                NodeStatus::NeedsReconciliation,
                                0,
                                "abandoned after the cancellation grace period",
                                false,
                            ));
                        }
                        break;
                    }
                }
            } else {
                tokio::select! {
                    () = self.cancel.cancelled() => continue,
                    next = in_flight.next() => next,
                }
            };

            let Some((idx, outcome)) = next else {
                break;
            };
            running.remove(&idx);
            log_outcome(&plan.actions[idx], &outcome);
            if let Some(outputs) = &outcome.outputs
                && plan.actions[idx].kind != ActionKind::Delete
            {
                known.insert(plan.actions[idx].resource_id.clone(), outputs.clone());
            }
            outcomes[idx] = Some(outcome);
        }
        drop(in_flight);

        // Anything left never became ready.
        for idx in pending {
            let status = if cancelled { NodeStatus::Cancelled } else { NodeStatus::Blocked };
            outcomes[idx] = Some(NodeOutcome::failed(status, 0, "dependencies did not converge", true));
        }

        let mut late = Vec::new();
        let mut reports: Vec<NodeReport> = plan
            .actions
            .iter()
            .zip(outcomes.iter_mut())
            .map(|(action, outcome)| {
                let outcome = outcome.take().unwrap_or_else(|| {
                    NodeOutcome::failed(NodeStatus::Blocked, 0, "action never ran", true)
                });
                if let Some(old) = outcome.replaced {
                    late.push(old);
                }
                NodeReport {
                    resource_id: action.resource_id.clone(),
                    action: action.kind,
                    replacement: action.replacement,
                    status: outcome.status,
                    attempts: outcome.attempts,
                    error: outcome.error,
                }
            })
            .collect();

        reports.extend(self.delete_replaced(&plan.stack, late, cancelled).await);

        let (outputs, outputs_complete) = self.finish_outputs(plan, &known, &reports).await;

        let result = ApplyResult {
            stack: plan.stack.clone(),
            reports,
            outputs,
            outputs_complete,
            started_at,
            finished_at: Utc::now(),
            cancelled,
        };

        self.record_history(plan, &result).await;
        info!(
            "Applied stack {}: {} succeeded, {} unchanged, {} failed, {} blocked, {} cancelled, {} need reconciliation",
            result.stack,
            result.count(NodeStatus::Succeeded),
            result.count(NodeStatus::NoOp),
            result.count(NodeStatus::Failed),
            result.count(NodeStatus::Blocked),
            result.count(NodeStatus::Cancelled),
            result.count(NodeStatus::NeedsReconciliation)
        );
        Ok(result)
    }

    /// Rejects plans that would fail structurally mid-walk.
    fn check_plan(&self, plan: &Plan) -> Result<()> {
        if !plan.is_well_ordered() {
            return Err(PlanError::InvalidPlan {
                message: format!("actions of stack '{}' depend on later actions", plan.stack),
            }
            .into());
        }
        for action in &plan.actions {
            let provider = action_provider(action).ok_or_else(|| PlanError::InvalidPlan {
                message: format!("action for '{}' has neither a resource nor a prior record", action.resource_id),
            })?;
            if !self.providers.contains(provider) {
                return Err(PlanError::UnknownProvider {
                    resource: action.resource_id.to_string(),
                    provider: provider.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// The provider for a call and its context, with settings resolved for
    /// this stack.
    async fn provider_for(
        &self,
        stack: &str,
        provider: &str,
    ) -> std::result::Result<(std::sync::Arc<dyn Provider>, ProviderContext), NodeOutcome> {
        let not_registered =
            || NodeOutcome::failed(NodeStatus::Failed, 0, format!("provider '{provider}' is not registered"), true);
        let handle = self.providers.get(provider).ok_or_else(not_registered)?;
        let resolution = self
            .providers
            .resolve_context(provider, self.project, stack, self.resolver, self.settings.output_wait)
            .await
            .map_err(|e| NodeOutcome::failed(NodeStatus::Failed, 0, e.to_string(), true))?;

        match resolution.ok_or_else(not_registered)? {
            ContextResolution::Ready(ctx) => Ok((handle, ctx)),
            ContextResolution::Waiting(refs) => {
                let waiting = refs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                Err(NodeOutcome::failed(
                    NodeStatus::Blocked,
                    0,
                    format!("unresolved provider settings: {waiting}"),
                    true,
                ))
            }
        }
    }

    /// Runs one action to a terminal status.
    async fn run_node(
        &self,
        stack: &str,
        action: &Action,
        lookup: HashMap<ResourceId, BTreeMap<String, JsonValue>>,
    ) -> NodeOutcome {
        match action.kind {
            ActionKind::Delete => self.run_delete(stack, action).await,
            ActionKind::NoOp => self.run_noop(stack, action).await,
            ActionKind::Create | ActionKind::Update | ActionKind::PendingDependency => {
                self.run_converge(stack, action, &lookup).await
            }
        }
    }

    async fn run_noop(&self, stack: &str, action: &Action) -> NodeOutcome {
        let Some(prior) = &action.prior else {
            return NodeOutcome::converged(NodeStatus::NoOp, 0, BTreeMap::new());
        };
        match &action.inputs_hash {
            Some(hash) if hash != &prior.inputs_hash => {
                let mut refreshed = prior.clone();
                refreshed.inputs_hash.clone_from(hash);
                refreshed.updated_at = Utc::now();
                match self.store.put_record(stack, refreshed, Some(prior.version)).await {
                    Ok(stored) => NodeOutcome::converged(NodeStatus::NoOp, 0, stored.outputs),
                    Err(e) => NodeOutcome::failed(
                        NodeStatus::Failed,
                        0,
                        format!("failed to refresh input hash: {e}"),
                        true,
                    ),
                }
            }
            _ => NodeOutcome::converged(NodeStatus::NoOp, 0, prior.outputs.clone()),
        }
    }

    async fn run_delete(&self, stack: &str, action: &Action) -> NodeOutcome {
        let Some(prior) = &action.prior else {
            return NodeOutcome::failed(NodeStatus::Failed, 0, "no prior record to delete", true);
        };
        let (provider, ctx) = match self.provider_for(stack, prior.provider.as_str()).await {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };

        let (provider, ctx) = (provider.as_ref(), &ctx);
        let (result, attempts) = self
            .call_with_retry(&action.resource_id, "delete", move || provider.delete(ctx, &prior.kind, prior))
            .await;
        if let Err(e) = result {
            return NodeOutcome::from_provider_error(&e, attempts);
        }

        // A replaced instance was tracked under its own key after the plan was made.
        let version = if prior.resource_id.is_replaced_instance() {
            match self.store.get_record(stack, &prior.resource_id).await {
                Ok(Some(stored)) => stored.version,
                Ok(None) => return NodeOutcome::converged(NodeStatus::Succeeded, attempts, BTreeMap::new()),
                Err(e) => return NodeOutcome::from_state_error(&e, attempts),
            }
        } else {
            prior.version
        };

        match self.store.remove_record(stack, &prior.resource_id, version).await {
            Ok(()) => NodeOutcome::converged(NodeStatus::Succeeded, attempts, BTreeMap::new()),
            Err(e) => NodeOutcome::from_state_error(&e, attempts),
        }
    }

    async fn run_converge(
        &self,
        stack: &str,
        action: &Action,
        lookup: &HashMap<ResourceId, BTreeMap<String, JsonValue>>,
    ) -> NodeOutcome {
        let Some(resource) = &action.resource else {
            return NodeOutcome::failed(NodeStatus::Failed, 0, "action has no desired resource", true);
        };

        let resolved = match self.resolve(resource, lookup).await {
            Ok(resolved) => resolved,
            Err(outcome) => return outcome,
        };
        let hash = self.hasher.hash_inputs(&resource.kind, &resource.provider, &resolved);

        let (provider, ctx) = match self.provider_for(stack, resource.provider.as_str()).await {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };

        let (provider, ctx, resolved) = (provider.as_ref(), &ctx, &resolved);
        let kind = resource.kind.as_str();
        let prior = action.prior.as_ref();
        let step = match prior {
            None => Step::Create,
            Some(_) if action.kind == ActionKind::Create && action.replacement => Step::Create,
            Some(prior) if action.deferred_inputs || action.kind == ActionKind::PendingDependency => {
                if prior.inputs_hash == hash {
                    return NodeOutcome::converged(NodeStatus::NoOp, 0, prior.outputs.clone());
                }
                if prior.kind != resource.kind || prior.provider != resource.provider {
                    Step::Replace
                } else {
                    let (outcome, attempts) = self
                        .call_with_retry(&resource.id, "diff", move || provider.diff(ctx, kind, resolved, prior))
                        .await;
                    match outcome {
                        Ok(DiffOutcome::InPlace) => Step::Update,
                        Ok(DiffOutcome::Replace) => Step::Replace,
                        Ok(DiffOutcome::Noop) => {
                            let mut action = action.clone();
                            action.inputs_hash = Some(hash);
                            return self.run_noop(stack, &action).await;
                        }
                        Err(e) => return NodeOutcome::from_provider_error(&e, attempts),
                    }
                }
            }
            Some(_) => Step::Update,
        };

        let (result, attempts) = match (step, prior) {
            (Step::Update, Some(prior)) => {
                self.call_with_retry(&resource.id, "update", move || provider.update(ctx, kind, resolved, prior))
                    .await
            }
            _ => {
                self.call_with_retry(&resource.id, "create", move || provider.create(ctx, kind, resolved))
                    .await
            }
        };
        let response: ProviderResponse = match result {
            Ok(response) => response,
            Err(e) => return NodeOutcome::from_provider_error(&e, attempts),
        };

        let mut record = StateRecord::new(resource.id.clone(), resource.kind.clone(), resource.provider.clone(), hash)
            .with_provider_result(response.provider_state, response.outputs)
            .with_dependencies(resource.all_dependencies());
        if step == Step::Update
            && let Some(prior) = prior
        {
            record.created_at = prior.created_at;
        }

        // The old instance keeps a record of its own until its delete succeeds.
        let retired = match prior {
            Some(prior) if step != Step::Update => match self.retire(stack, prior).await {
                Ok(retired) => Some(retired),
                Err(e) => return NodeOutcome::from_state_error(&e, attempts),
            },
            _ => None,
        };

        match self.store.put_record(stack, record, prior.map(|p| p.version)).await {
            Ok(stored) => {
                let mut outcome = NodeOutcome::converged(NodeStatus::Succeeded, attempts, stored.outputs);
                if step == Step::Replace {
                    outcome.replaced = retired;
                }
                outcome
            }
            Err(e) => NodeOutcome::from_state_error(&e, attempts),
        }
    }

    /// Stores `prior` under its replaced-instance key.
    async fn retire(&self, stack: &str, prior: &StateRecord) -> Result<StateRecord> {
        let retired = prior.retire();
        if let Some(existing) = self.store.get_record(stack, &retired.resource_id).await?
            && existing.provider_state == retired.provider_state
        {
            return Ok(existing);
        }
        self.store.put_record(stack, retired, None).await
    }

    /// Resolves a resource's inputs against upstream outputs of this run.
    async fn resolve(
        &self,
        resource: &Resource,
        lookup: &HashMap<ResourceId, BTreeMap<String, JsonValue>>,
    ) -> std::result::Result<ResolvedInputs, NodeOutcome> {
        let resolution = self
            .resolver
            .resolve_inputs(
                &resource.inputs,
                |id: &ResourceId, key: &str| lookup.get(id).and_then(|outputs| outputs.get(key)).cloned(),
                self.settings.output_wait,
            )
            .await;

        match resolution {
            Ok(InputResolution::Resolved(resolved)) => Ok(resolved),
            Ok(InputResolution::Unresolved(refs)) => {
                let waiting = refs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                Err(NodeOutcome::failed(
                    NodeStatus::Blocked,
                    0,
                    format!("unresolved inputs: {waiting}"),
                    true,
                ))
            }
            Err(e) => Err(NodeOutcome::failed(NodeStatus::Failed, 0, e.to_string(), true)),
        }
    }

    /// Calls the provider, retrying transient errors with backoff.
    ///
    /// Returns the last result and the number of attempts made.
    async fn call_with_retry<T, F, Fut>(
        &self,
        resource: &ResourceId,
        operation: &str,
        mut call: F,
    ) -> (std::result::Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.settings.operation_timeout {
                Some(limit) => tokio::time::timeout(limit, call()).await.unwrap_or_else(|_| {
                    Err(ProviderError::timeout(format!(
                        "{operation} of {resource} timed out after {}s",
                        limit.as_secs()
                    )))
                }),
                None => call().await,
            };

            match result {
                Err(e) if e.transient && attempt < self.settings.max_attempts => {
                    let delay = self.settings.backoff(attempt - 1);
                    warn!(
                        "{operation} of {resource} failed (attempt {attempt}/{}): {e}; retrying in {}ms",
                        self.settings.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }

    /// Deletes old instances replaced during the walk.
    async fn delete_replaced(&self, stack: &str, old: Vec<StateRecord>, cancelled: bool) -> Vec<NodeReport> {
        let mut reports = Vec::with_capacity(old.len());
        for record in old {
            let action = Action::delete(record, "old instance replaced");

            let outcome = if cancelled {
                NodeOutcome::failed(NodeStatus::Cancelled, 0, "cancelled before the old instance was deleted", true)
            } else {
                self.run_delete(stack, &action).await
            };
            log_outcome(&action, &outcome);
            reports.push(NodeReport {
                resource_id: action.resource_id,
                action: ActionKind::Delete,
                replacement: true,
                status: outcome.status,
                attempts: outcome.attempts,
                error: outcome.error,
            });
        }
        reports
    }

    /// Publishes (or clears) the stack's outputs after the walk.
    async fn finish_outputs(
        &self,
        plan: &Plan,
        known: &HashMap<ResourceId, BTreeMap<String, JsonValue>>,
        reports: &[NodeReport],
    ) -> (BTreeMap<String, JsonValue>, bool) {
        if plan.destroy {
            if reports.iter().all(|r| r.status.is_converged())
                && let Err(e) = self.store.clear_outputs(&plan.stack).await
            {
                warn!("Failed to clear outputs of stack {}: {e}", plan.stack);
            }
            return (BTreeMap::new(), false);
        }

        let mut values = BTreeMap::new();
        let mut complete = true;
        for (key, value) in &plan.outputs {
            let resolved = self
                .resolver
                .resolve_value(
                    value,
                    |id: &ResourceId, k: &str| known.get(id).and_then(|outputs| outputs.get(k)).cloned(),
                    Duration::ZERO,
                )
                .await;
            match resolved {
                Ok(Ok(json)) => {
                    values.insert(key.clone(), json);
                }
                Ok(Err(refs)) => {
                    debug!("Output {key} of stack {} is unresolved ({} placeholders)", plan.stack, refs.len());
                    complete = false;
                }
                Err(e) => {
                    warn!("Output {key} of stack {} could not be resolved: {e}", plan.stack);
                    complete = false;
                }
            }
        }

        let outputs = StackOutputs::new(values.clone(), complete);
        if let Err(e) = self.store.publish_outputs(&plan.stack, &outputs).await {
            error!("Failed to publish outputs of stack {}: {e}", plan.stack);
            return (values, false);
        }
        info!(
            "Published {} outputs for stack {}{}",
            values.len(),
            plan.stack,
            if complete { "" } else { " (incomplete)" }
        );
        (values, complete)
    }

    async fn record_history(&self, plan: &Plan, result: &ApplyResult) {
        let operation = if plan.destroy {
            StackOperation::Destroy
        } else {
            StackOperation::Up
        };
        let resources = plan
            .actions
            .iter()
            .filter(|a| a.is_change())
            .map(|a| a.resource_id.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let error = (!result.is_success()).then(|| {
            format!(
                "{} failed, {} blocked, {} cancelled, {} need reconciliation",
                result.count(NodeStatus::Failed),
                result.count(NodeStatus::Blocked),
                result.count(NodeStatus::Cancelled),
                result.count(NodeStatus::NeedsReconciliation)
            )
        });

        if let Err(e) = self
            .store
            .append_history(&plan.stack, HistoryEntry::new(operation, resources, error))
            .await
        {
            warn!("Failed to record history for stack {}: {e}", plan.stack);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Create,
    Update,
    Replace,
}

fn action_provider(action: &Action) -> Option<&str> {
    action
        .resource
        .as_ref()
        .map(|r| r.provider.as_str())
        .or_else(|| action.prior.as_ref().map(|p| p.provider.as_str()))
}

/// Marks pending actions whose dependencies cannot converge as `Blocked`.
///
/// Dependencies always point backwards, so one ascending pass propagates
/// through chains.
fn block_unreachable(plan: &Plan, pending: &mut BTreeSet<usize>, outcomes: &mut [Option<NodeOutcome>]) {
    let candidates: Vec<usize> = pending.iter().copied().collect();
    for idx in candidates {
        let failed_dep = plan.actions[idx]
            .depends_on
            .iter()
            .copied()
            .find(|&dep| outcomes[dep].as_ref().is_some_and(|o| !o.status.is_converged()));
        if let Some(dep) = failed_dep {
            pending.remove(&idx);
            outcomes[idx] = Some(NodeOutcome::failed(
                NodeStatus::Blocked,
                0,
                format!("dependency {} did not converge", plan.actions[dep].resource_id),
                true,
            ));
        }
    }
}

/// Outputs of the upstream resources an action reads.
fn snapshot_outputs(
    action: &Action,
    known: &HashMap<ResourceId, BTreeMap<String, JsonValue>>,
) -> HashMap<ResourceId, BTreeMap<String, JsonValue>> {
    let Some(resource) = &action.resource else {
        return HashMap::new();
    };
    resource
        .references()
        .into_iter()
        .filter_map(|reference| match reference {
            Reference::Resource { resource, .. } => known.get(&resource).map(|o| (resource, o.clone())),
            Reference::Stack { .. } => None,
        })
        .collect()
}

fn log_outcome(action: &Action, outcome: &NodeOutcome) {
    match (&outcome.status, &outcome.error) {
        (NodeStatus::Succeeded | NodeStatus::NoOp, _) => info!("{} finished: {:?}", action.description(), outcome.status),
        (status, Some(err)) => error!("{} finished {status:?}: {}", action.description(), err.message),
        (status, None) => error!("{} finished {status:?}", action.description()),
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::NoOp => "no-op",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::NeedsReconciliation => "needs reconciliation",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied {} actions: {} succeeded, {} unchanged, {} failed, {} blocked, {} cancelled, {} need reconciliation",
            self.reports.len(),
            self.count(NodeStatus::Succeeded),
            self.count(NodeStatus::NoOp),
            self.count(NodeStatus::Failed),
            self.count(NodeStatus::Blocked),
            self.count(NodeStatus::Cancelled),
            self.count(NodeStatus::NeedsReconciliation)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::model::{Inputs, Stack, Value};
    use crate::planner::DiffEngine;
    use crate::provider::{EchoProvider, MockProvider, ProviderResult};
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: String::from("platform"),
            environment: String::from("dev"),
        }
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            parallelism: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            operation_timeout: None,
            cancel_grace: Duration::from_secs(1),
            output_wait: Duration::ZERO,
        }
    }

    fn inputs(pairs: Vec<(&str, Value)>) -> Inputs {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn response(kind: &str) -> ProviderResponse {
        ProviderResponse {
            provider_state: json!({ "kind": kind }),
            outputs: BTreeMap::from([(String::from("id"), json!(format!("{kind}-1")))]),
        }
    }

    fn registry_with(id: &str, provider: Arc<dyn Provider>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(id, provider);
        registry
    }

    fn network_stack() -> Stack {
        let mut stack = Stack::new("network");
        stack
            .declare("echo:vpc", "vpc", inputs(vec![("cidr", Value::literal("10.0.0.0/16"))]), Vec::<String>::new())
            .expect("declare");
        stack
            .declare(
                "echo:subnet",
                "subnet",
                inputs(vec![("vpc", Value::deferred("vpc", "id"))]),
                Vec::<String>::new(),
            )
            .expect("declare");
        stack.export("vpcId", Value::deferred("vpc", "id"));
        stack
    }

    /// a <- b <- c, plus an independent d.
    fn chain_stack() -> Stack {
        let mut stack = Stack::new("chain");
        let none = Vec::<String>::new;
        stack.declare("mock:a", "a", Inputs::new(), none()).expect("declare");
        stack.declare("mock:b", "b", Inputs::new(), ["a"]).expect("declare");
        stack.declare("mock:c", "c", Inputs::new(), ["b"]).expect("declare");
        stack.declare("mock:d", "d", Inputs::new(), none()).expect("declare");
        stack
    }

    async fn plan_for(store: &MemoryStateStore, registry: &ProviderRegistry, stack: &Stack) -> Plan {
        let project = project();
        let resolver = StackReferenceResolver::new(store, ["network", "cluster", stack.name()]);
        let graph = DependencyGraph::build(stack).expect("graph");
        let prior = store.load_stack(stack.name()).await.expect("load");
        DiffEngine::new(registry, &resolver, &project)
            .plan(stack, &graph, &prior)
            .await
            .expect("plan")
    }

    async fn apply_with(
        store: &MemoryStateStore,
        registry: &ProviderRegistry,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> ApplyResult {
        let project = project();
        let resolver = StackReferenceResolver::new(store, ["network", "cluster", plan.stack.as_str()]);
        ApplyExecutor::new(registry, store, &resolver, &project)
            .with_settings(fast_settings())
            .with_cancellation(cancel)
            .apply(plan)
            .await
            .expect("apply")
    }

    /// Sleeps in every call and tracks how many calls overlap.
    #[derive(Debug, Default)]
    struct SlowProvider {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        async fn work(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Provider for SlowProvider {
        async fn diff(
            &self,
            _ctx: &ProviderContext,
            _kind: &str,
            _desired: &ResolvedInputs,
            _current: &StateRecord,
        ) -> ProviderResult<DiffOutcome> {
            Ok(DiffOutcome::InPlace)
        }

        async fn create(&self, _ctx: &ProviderContext, kind: &str, _inputs: &ResolvedInputs) -> ProviderResult<ProviderResponse> {
            self.work().await;
            Ok(response(kind))
        }

        async fn update(
            &self,
            _ctx: &ProviderContext,
            kind: &str,
            _inputs: &ResolvedInputs,
            _current: &StateRecord,
        ) -> ProviderResult<ProviderResponse> {
            self.work().await;
            Ok(response(kind))
        }

        async fn delete(&self, _ctx: &ProviderContext, _kind: &str, _current: &StateRecord) -> ProviderResult<()> {
            self.work().await;
            Ok(())
        }
    }

    async fn converge(store: &MemoryStateStore, registry: &ProviderRegistry, stack: &Stack) -> ApplyResult {
        let plan = plan_for(store, registry, stack).await;
        apply_with(store, registry, &plan, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_apply_creates_records_and_publishes_outputs() {
        let store = MemoryStateStore::new();
        let registry = registry_with("echo", Arc::new(EchoProvider::new()));
        let stack = network_stack();

        let result = converge(&store, &registry, &stack).await;
        assert!(result.is_success(), "{result}");
        assert_eq!(result.count(NodeStatus::Succeeded), 2);

        let state = store.load_stack("network").await.expect("load");
        let vpc = state.get("vpc").expect("vpc record");
        let subnet = state.get("subnet").expect("subnet record");
        assert_eq!(vpc.version, 1);
        assert_eq!(subnet.outputs["vpc"], vpc.outputs["id"]);
        assert!(subnet.dependencies.contains("vpc"));

        let published = store.load_outputs("network").await.expect("outputs").expect("published");
        assert!(published.complete);
        assert_eq!(published.values["vpcId"], vpc.outputs["id"]);
        assert_eq!(result.outputs["vpcId"], vpc.outputs["id"]);

        let history = store.load_stack("network").await.expect("load").history;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);

        let replan = plan_for(&store, &registry, &stack).await;
        assert!(replan.actions.iter().all(|a| a.kind == ActionKind::NoOp));
    }

    #[tokio::test]
    async fn test_failure_blocks_transitive_dependents_only() {
        let mut provider = MockProvider::new();
        provider.expect_create().returning(|_, kind, _| {
            if kind == "mock:a" {
                Err(ProviderError::permanent("quota exceeded"))
            } else {
                Ok(response(kind))
            }
        });
        let store = MemoryStateStore::new();
        let registry = registry_with("mock", Arc::new(provider));

        let result = converge(&store, &registry, &chain_stack()).await;

        let status = |id: &str| result.report(id).expect("report").status;
        assert_eq!(status("a"), NodeStatus::Failed);
        assert_eq!(status("b"), NodeStatus::Blocked);
        assert_eq!(status("c"), NodeStatus::Blocked);
        assert_eq!(status("d"), NodeStatus::Succeeded);

        let failed = result.report("a").and_then(|r| r.error.clone()).expect("error");
        assert_eq!(failed.message, "quota exceeded");
        assert!(failed.retry_safe);

        let state = store.load_stack("chain").await.expect("load");
        assert!(state.get("a").is_none());
        assert!(state.get("d").is_some());

        let err = result.into_result().expect_err("partial failure");
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut provider = MockProvider::new();
        provider.expect_create().returning(move |_, kind, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::transient("throttled"))
            } else {
                Ok(response(kind))
            }
        });
        let store = MemoryStateStore::new();
        let registry = registry_with("mock", Arc::new(provider));
        let mut stack = Stack::new("single");
        stack.declare("mock:a", "a", Inputs::new(), Vec::<String>::new()).expect("declare");

        let result = converge(&store, &registry, &stack).await;

        let report = result.report("a").expect("report");
        assert_eq!(report.status, NodeStatus::Succeeded);
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_timeouts_need_reconciliation() {
        let mut provider = MockProvider::new();
        provider
            .expect_create()
            .times(3)
            .returning(|_, _, _| Err(ProviderError::timeout("deadline exceeded")));
        let store = MemoryStateStore::new();
        let registry = registry_with("mock", Arc::new(provider));
        let mut stack = Stack::new("single");
        stack.declare("mock:a", "a", Inputs::new(), Vec::<String>::new()).expect("declare");

        let result = converge(&store, &registry, &stack).await;

        let report = result.report("a").expect("report");
        assert_eq!(report.status, NodeStatus::NeedsReconciliation);
        assert_eq!(report.attempts, 3);
        assert!(!report.error.as_ref().expect("error").retry_safe);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut provider = MockProvider::new();
        provider.expect_create().never();
        let store = MemoryStateStore::new();
        let registry = registry_with("mock", Arc::new(provider));
        let plan = plan_for(&store, &registry, &chain_stack()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = apply_with(&store, &registry, &plan, cancel).await;

        assert!(result.cancelled);
        assert_eq!(result.count(NodeStatus::Cancelled), 4);
        assert_eq!(result.into_result().expect_err("cancelled").exit_code(), 5);
    }

    #[tokio::test]
    async fn test_cancel_mid_walk_leaves_dependents_unstarted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut provider = MockProvider::new();
        provider.expect_create().times(1).returning(move |_, kind, _| {
            trigger.cancel();
            Ok(response(kind))
        });
        let store = MemoryStateStore::new();
        let registry = registry_with("mock", Arc::new(provider));

        let mut stack = Stack::new("pair");
        stack.declare("mock:a", "a", Inputs::new(), Vec::<String>::new()).expect("declare");
        stack.declare("mock:b", "b", Inputs::new(), ["a"]).expect("declare");
        let plan = plan_for(&store, &registry, &stack).await;

        let result = apply_with(&store, &registry, &plan, cancel).await;

        assert_eq!(result.report("a").expect("a").status, NodeStatus::Succeeded);
        assert_eq!(result.report("b").expect("b").status, NodeStatus::Cancelled);
        assert!(store.load_stack("pair").await.expect("load").get("a").is_some());
    }

    #[tokio::test]
    async fn test_parallelism_bounds_concurrent_provider_calls() {
        let slow = Arc::new(SlowProvider::new(Duration::from_millis(30)));
        let registry = registry_with("slow", Arc::clone(&slow) as Arc<dyn Provider>);
        let store = MemoryStateStore::new();
        let mut stack = Stack::new("wide");
        for i in 0..6 {
            stack
                .declare("slow:node", format!("n{i}"), Inputs::new(), Vec::<String>::new())
                .expect("declare");
        }
        let plan = plan_for(&store, &registry, &stack).await;

        let project = project();
        let resolver = StackReferenceResolver::new(&store, ["wide"]);
        let result = ApplyExecutor::new(&registry, &store, &resolver, &project)
            .with_settings(ExecutorSettings {
                parallelism: 2,
                ..fast_settings()
            })
            .apply(&plan)
            .await
            .expect("apply");

        assert!(result.is_success(), "{result}");
        assert_eq!(result.count(NodeStatus::Succeeded), 6);
        assert_eq!(slow.peak.load(Ordering::SeqCst), 2);
        assert_eq!(slow.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_in_flight_call_abandoned_after_grace_needs_reconciliation() {
        let slow = Arc::new(SlowProvider::new(Duration::from_secs(5)));
        let registry = registry_with("slow", Arc::clone(&slow) as Arc<dyn Provider>);
        let store = MemoryStateStore::new();
        let mut stack = Stack::new("pair");
        stack.declare("slow:node", "a", Inputs::new(), Vec::<String>::new()).expect("declare");
        stack.declare("slow:node", "b", Inputs::new(), ["a"]).expect("declare");
        let plan = plan_for(&store, &registry, &stack).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let project = project();
        let resolver = StackReferenceResolver::new(&store, ["pair"]);
        let started = Instant::now();
        let result = ApplyExecutor::new(&registry, &store, &resolver, &project)
            .with_settings(ExecutorSettings {
                cancel_grace: Duration::from_millis(20),
                ..fast_settings()
            })
            .with_cancellation(cancel)
            .apply(&plan)
            .await
            .expect("apply");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.cancelled);
        let a = result.report("a").expect("a");
        assert_eq!(a.status, NodeStatus::NeedsReconciliation);
        assert!(!a.error.as_ref().expect("error").retry_safe);
        assert_eq!(result.report("b").expect("b").status, NodeStatus::Cancelled);
        assert!(store.load_stack("pair").await.expect("load").get("a").is_none());
    }

    #[tokio::test]
    async fn test_pending_stack_output_resolves_at_apply() {
        let store = MemoryStateStore::new();
        let registry = registry_with("echo", Arc::new(EchoProvider::new()));
        let mut cluster = Stack::new("cluster");
        cluster
            .declare(
                "echo:cluster",
                "cluster",
                inputs(vec![("vpc", Value::stack_output("network", "vpcId"))]),
                Vec::<String>::new(),
            )
            .expect("declare");

        let plan = plan_for(&store, &registry, &cluster).await;
        assert_eq!(plan.actions[0].kind, ActionKind::PendingDependency);

        let values = BTreeMap::from([(String::from("vpcId"), json!("vpc-123"))]);
        store
            .publish_outputs("network", &StackOutputs::new(values, true))
            .await
            .expect("publish");

        let result = apply_with(&store, &registry, &plan, CancellationToken::new()).await;
        assert!(result.is_success(), "{result}");
        let record = store.load_stack("cluster").await.expect("load");
        assert_eq!(record.get("cluster").expect("record").outputs["vpc"], json!("vpc-123"));
    }

    #[tokio::test]
    async fn test_unpublished_stack_output_blocks_node() {
        let store = MemoryStateStore::new();
        let registry = registry_with("echo", Arc::new(EchoProvider::new()));
        let mut cluster = Stack::new("cluster");
        cluster
            .declare(
                "echo:cluster",
                "cluster",
                inputs(vec![("vpc", Value::stack_output("network", "vpcId"))]),
                Vec::<String>::new(),
            )
            .expect("declare");
        cluster
            .declare("echo:nodes", "nodes", Inputs::new(), ["cluster"])
            .expect("declare");

        let result = converge(&store, &registry, &cluster).await;

        assert_eq!(result.report("cluster").expect("cluster").status, NodeStatus::Blocked);
        assert_eq!(result.report("nodes").expect("nodes").status, NodeStatus::Blocked);
        assert!(store.load_stack("cluster").await.expect("load").records.is_empty());
    }

    #[tokio::test]
    async fn test_state_write_failure_needs_reconciliation() {
        let store = MemoryStateStore::new();
        let registry = registry_with("echo", Arc::new(EchoProvider::new()));
        let mut stack = Stack::new("single");
        stack.declare("echo:bucket", "bucket", Inputs::new(), Vec::<String>::new()).expect("declare");
        let plan = plan_for(&store, &registry, &stack).await;

        // Someone else wrote the record after planning.
        let rogue = StateRecord::new(ResourceId::new("bucket"), "echo:bucket", crate::model::ProviderId::new("echo"), "x");
        store.put_record("single", rogue, None).await.expect("put");

        let result = apply_with(&store, &registry, &plan, CancellationToken::new()).await;
        let report = result.report("bucket").expect("report");
        assert_eq!(report.status, NodeStatus::NeedsReconciliation);
        assert!(report.error.as_ref().expect("error").message.contains("state write failed"));
    }

    #[tokio::test]
    async fn test_destroy_removes_records_and_outputs() {
        let store = MemoryStateStore::new();
        let registry = registry_with("echo", Arc::new(EchoProvider::new()));
        assert!(converge(&store, &registry, &network_stack()).await.is_success());

        let project = project();
        let resolver = StackReferenceResolver::new(&store, ["network"]);
        let prior = store.load_stack("network").await.expect("load");
        let plan = DiffEngine::new(&registry, &resolver, &project)
            .plan_destroy(&prior)
            .expect("plan");
        assert_eq!(plan.actions[0].resource_id.as_str(), "subnet");

        let result = apply_with(&store, &registry, &plan, CancellationToken::new()).await;
        assert!(result.is_success(), "{result}");

        let state = store.load_stack("network").await.expect("load");
        assert!(state.records.is_empty());
        assert!(state.outputs.is_none());
        assert_eq!(state.history.last().expect("history").operation, StackOperation::Destroy);
    }

    #[tokio::test]
    async fn test_apply_time_replacement_deletes_old_instance() {
        let store = MemoryStateStore::new();
        let mut registry = ProviderRegistry::new();
        registry.register_with(
            "echo",
            Arc::new(EchoProvider::new()),
            BTreeMap::from([(String::from("replace_on"), String::from("cidr,vpc"))]),
            None,
        );

        assert!(converge(&store, &registry, &network_stack()).await.is_success());
        let old_subnet = store.load_stack("network").await.expect("load").get("subnet").cloned().expect("subnet");

        let mut changed = Stack::new("network");
        changed
            .declare("echo:vpc", "vpc", inputs(vec![("cidr", Value::literal("10.1.0.0/16"))]), Vec::<String>::new())
            .expect("declare");
        changed
            .add(network_stack().get("subnet").cloned().expect("subnet"))
            .expect("add");

        let plan = plan_for(&store, &registry, &changed).await;
        assert!(plan.actions_for("vpc")[0].replacement);
        assert!(plan.actions_for("subnet")[0].deferred_inputs);

        let result = apply_with(&store, &registry, &plan, CancellationToken::new()).await;
        assert!(result.is_success(), "{result}");
        let old_delete = result
            .reports
            .iter()
            .find(|r| r.resource_id.as_str() == "subnet" && r.action == ActionKind::Delete)
            .expect("old subnet delete");
        assert!(old_delete.replacement);

        let state = store.load_stack("network").await.expect("load");
        let new_subnet = state.get("subnet").expect("subnet");
        assert_ne!(new_subnet.outputs["id"], old_subnet.outputs["id"]);
        assert_eq!(new_subnet.outputs["vpc"], state.get("vpc").expect("vpc").outputs["id"]);
    }

    #[tokio::test]
    async fn test_blocked_replacement_keeps_old_instance_tracked() {
        let failing = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failing);
        let mut subnets = MockProvider::new();
        subnets.expect_create().returning(|_, kind, _| Ok(response(kind)));
        subnets.expect_diff().returning(|_, _, _, _| Ok(DiffOutcome::InPlace));
        subnets.expect_update().returning(move |_, kind, _, _| {
            if flag.load(Ordering::SeqCst) {
                Err(ProviderError::permanent("subnet is in use"))
            } else {
                Ok(response(kind))
            }
        });

        let echo = Arc::new(EchoProvider::new());
        let mut registry = ProviderRegistry::new();
        registry.register_with(
            "echo",
            Arc::clone(&echo) as Arc<dyn Provider>,
            BTreeMap::from([(String::from("replace_on"), String::from("cidr"))]),
            None,
        );
        registry.register("mock", Arc::new(subnets));

        let network = |cidr: &str| {
            let mut stack = Stack::new("network");
            stack
                .declare("echo:vpc", "vpc", inputs(vec![("cidr", Value::literal(cidr))]), Vec::<String>::new())
                .expect("declare");
            stack
                .declare(
                    "mock:subnet",
                    "subnet",
                    inputs(vec![("vpc", Value::deferred("vpc", "id"))]),
                    Vec::<String>::new(),
                )
                .expect("declare");
            stack
        };

        let store = MemoryStateStore::new();
        assert!(converge(&store, &registry, &network("10.0.0.0/16")).await.is_success());
        let old_vpc = store.load_stack("network").await.expect("load").get("vpc").cloned().expect("vpc");

        failing.store(true, Ordering::SeqCst);
        let changed = network("10.1.0.0/16");
        let result = converge(&store, &registry, &changed).await;
        assert_eq!(result.report("subnet").expect("subnet").status, NodeStatus::Failed);
        let old_delete = result
            .reports
            .iter()
            .find(|r| r.action == ActionKind::Delete)
            .expect("old vpc delete");
        assert!(old_delete.replacement);
        assert_eq!(old_delete.status, NodeStatus::Blocked);
        let calls = echo.calls();

        let state = store.load_stack("network").await.expect("load");
        let leftover = state
            .records
            .values()
            .find(|r| r.resource_id.is_replaced_instance())
            .expect("old vpc is still tracked");
        assert_eq!(leftover.resource_id.base(), "vpc");
        assert_eq!(leftover.outputs["id"], old_vpc.outputs["id"]);
        assert_ne!(state.get("vpc").expect("vpc").outputs["id"], old_vpc.outputs["id"]);

        failing.store(false, Ordering::SeqCst);
        let plan = plan_for(&store, &registry, &changed).await;
        let subnet = plan.actions.iter().position(|a| a.resource_id.as_str() == "subnet").expect("subnet");
        let delete = plan
            .actions
            .iter()
            .find(|a| a.kind == ActionKind::Delete)
            .expect("delete of the old instance");
        assert!(delete.replacement);
        assert_eq!(delete.resource_id.as_str(), "vpc");
        assert!(delete.depends_on.contains(&subnet));

        let result = apply_with(&store, &registry, &plan, CancellationToken::new()).await;
        assert!(result.is_success(), "{result}");
        assert_eq!(echo.calls(), calls + 1);

        let state = store.load_stack("network").await.expect("load");
        assert_eq!(state.records.len(), 2);
        assert!(state.records.keys().all(|id| !id.is_replaced_instance()));
        assert!(!plan_for(&store, &registry, &changed).await.has_changes());
    }

    #[tokio::test]
    async fn test_unknown_provider_in_plan_is_rejected() {
        let store = MemoryStateStore::new();
        let registry = registry_with("echo", Arc::new(EchoProvider::new()));
        let plan = plan_for(&store, &registry, &network_stack()).await;

        let empty = ProviderRegistry::new();
        let project = project();
        let resolver = StackReferenceResolver::new(&store, ["network"]);
        let err = ApplyExecutor::new(&empty, &store, &resolver, &project)
            .apply(&plan)
            .await
            .expect_err("unknown provider");
        assert!(matches!(err, StackweaveError::Plan(PlanError::UnknownProvider { .. })));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let settings = ExecutorSettings {
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            ..ExecutorSettings::default()
        };
        assert_eq!(settings.backoff(0), Duration::from_millis(200));
        assert_eq!(settings.backoff(1), Duration::from_millis(400));
        assert_eq!(settings.backoff(3), Duration::from_millis(1600));
        assert_eq!(settings.backoff(10), Duration::from_secs(5));
        assert_eq!(settings.backoff(u32::MAX), Duration::from_secs(5));
    }
}
