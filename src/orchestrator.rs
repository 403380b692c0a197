//! Multi-stack orchestration.
//!
//! Drives `preview`, `up` and `destroy` across stacks in cross-stack
//! dependency order. Every graph is built and every stack reference and
//! provider is checked before anything runs, so structural errors abort
//! before any provider call. Applies take the stack's advisory lock and
//! always release it.

use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProjectConfig;
use crate::error::{ApplyError, PlanError, ResolveError, Result, StackweaveError};
use crate::graph::{stack_order_with, DependencyGraph};
use crate::model::Stack;
use crate::planner::{ApplyExecutor, ApplyResult, DiffEngine, ExecutorSettings, Plan};
use crate::provider::ProviderRegistry;
use crate::resolver::StackReferenceResolver;
use crate::state::{generate_holder_id, StackOperation, StateStore};

/// Multi-stack driver.
pub struct Orchestrator<'a> {
    project: &'a ProjectConfig,
    stacks: &'a [Stack],
    store: &'a dyn StateStore,
    providers: &'a ProviderRegistry,
    settings: ExecutorSettings,
    cancel: CancellationToken,
    holder: String,
}

/// Outcome of `up` or `destroy` across stacks.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Operation performed.
    pub operation: StackOperation,
    /// Per-stack results, in the order stacks ran.
    pub results: Vec<ApplyResult>,
    /// Stack whose run stopped with an error, ending the whole run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<StackAbort>,
    /// Stacks not started because the run was cancelled or aborted.
    pub skipped: Vec<String>,
}

/// A stack that could not be planned or applied.
#[derive(Debug, Serialize)]
pub struct StackAbort {
    /// Stack name.
    pub stack: String,
    /// Error message.
    pub message: String,
    /// Process exit code for the error.
    pub exit_code: u8,
    #[serde(skip)]
    error: StackweaveError,
}

impl StackAbort {
    /// Records `error` against `stack`.
    #[must_use]
    pub fn new(stack: impl Into<String>, error: StackweaveError) -> Self {
        Self {
            stack: stack.into(),
            message: error.to_string(),
            exit_code: error.exit_code(),
            error,
        }
    }

    /// The error that stopped the stack.
    #[must_use]
    pub const fn error(&self) -> &StackweaveError {
        &self.error
    }
}

impl RunReport {
    fn new(operation: StackOperation) -> Self {
        Self {
            operation,
            results: Vec::new(),
            aborted: None,
            skipped: Vec::new(),
        }
    }

    /// Returns true if every stack converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.skipped.is_empty() && self.results.iter().all(ApplyResult::is_success)
    }

    /// Converts a non-converged run into an error.
    ///
    /// # Errors
    ///
    /// The error of an aborted stack, else the first stack's
    /// `PartialFailure`, else `Cancelled` for the first skipped stack.
    pub fn into_result(self) -> Result<Self> {
        if let Some(aborted) = self.aborted {
            return Err(aborted.error);
        }
        if let Some(failed) = self.results.iter().find(|r| !r.is_success()) {
            failed.clone().into_result()?;
        }
        if let Some(stack) = self.skipped.first() {
            return Err(ApplyError::Cancelled { stack: stack.clone() }.into());
        }
        Ok(self)
    }

    /// Records `error` against `stack` and skips the stacks after it.
    fn abort<'s>(&mut self, stack: &str, error: StackweaveError, rest: impl Iterator<Item = &'s Stack>) {
        error!("Stack {stack} aborted: {error}");
        self.aborted = Some(StackAbort::new(stack, error));
        self.skipped.extend(rest.map(|s| s.name().to_string()));
    }
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator over the project's stacks.
    #[must_use]
    pub fn new(
        project: &'a ProjectConfig,
        stacks: &'a [Stack],
        store: &'a dyn StateStore,
        providers: &'a ProviderRegistry,
    ) -> Self {
        Self {
            project,
            stacks,
            store,
            providers,
            settings: ExecutorSettings::default(),
            cancel: CancellationToken::new(),
            holder: generate_holder_id(),
        }
    }

    /// Sets the executor settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the lock holder id.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    fn resolver(&self) -> StackReferenceResolver<'a> {
        StackReferenceResolver::new(self.store, self.stacks.iter().map(Stack::name))
    }

    /// Stacks a stack reads, through its values or its providers' settings.
    fn upstreams(&self, stack: &Stack) -> BTreeSet<String> {
        let mut upstreams = stack.referenced_stacks();
        upstreams.extend(self.providers.stacks_read_by_providers_of(stack));
        upstreams
    }

    /// Selected stacks in dependency order, each with its graph.
    ///
    /// An empty selection means every stack.
    fn select(&self, selected: &[String]) -> Result<Vec<(&'a Stack, DependencyGraph)>> {
        for name in selected {
            if !self.stacks.iter().any(|s| s.name() == name) {
                return Err(ResolveError::UnknownStack { stack: name.clone() }.into());
            }
        }

        let ordered = stack_order_with(self.stacks, |stack| self.providers.stacks_read_by_providers_of(stack))?;
        let mut out = Vec::new();
        for stack in ordered {
            if selected.is_empty() || selected.iter().any(|s| s == stack.name()) {
                out.push((stack, DependencyGraph::build(stack)?));
            }
        }
        Ok(out)
    }

    /// Checks that every selected stack only reads known stacks and uses
    /// registered providers.
    ///
    /// A stack is known if it is declared or has anything in state.
    async fn check_references(&self, stacks: &[(&'a Stack, DependencyGraph)]) -> Result<()> {
        let declared: BTreeSet<&str> = self.stacks.iter().map(Stack::name).collect();
        let mut stored: Option<Vec<String>> = None;

        for (stack, _) in stacks {
            for resource in stack.resources() {
                if !self.providers.contains(resource.provider.as_str()) {
                    return Err(PlanError::UnknownProvider {
                        resource: resource.id.to_string(),
                        provider: resource.provider.to_string(),
                    }
                    .into());
                }
            }

            for upstream in self.upstreams(stack) {
                if declared.contains(upstream.as_str()) {
                    continue;
                }
                if stored.is_none() {
                    stored = Some(self.store.list_stacks().await?);
                }
                if !stored.iter().flatten().any(|s| s == &upstream) {
                    return Err(ResolveError::UnknownStack { stack: upstream }.into());
                }
            }
        }
        Ok(())
    }

    /// Plans every selected stack without applying.
    ///
    /// # Errors
    ///
    /// Structural errors and state or provider failures while planning.
    pub async fn preview(&self, selected: &[String]) -> Result<Vec<Plan>> {
        let stacks = self.select(selected)?;
        self.check_references(&stacks).await?;
        let resolver = self.resolver();
        let engine = DiffEngine::new(self.providers, &resolver, self.project);

        let mut plans = Vec::with_capacity(stacks.len());
        for (stack, graph) in &stacks {
            resolver.reset();
            let prior = self.store.load_stack(stack.name()).await?;
            plans.push(engine.plan(stack, graph, &prior).await?);
        }
        Ok(plans)
    }

    /// Converges every selected stack, upstream stacks first.
    ///
    /// Node failures are reported, not returned. A stack that cannot be
    /// locked, planned or applied ends the run and is recorded in
    /// [`RunReport::aborted`]; use [`RunReport::into_result`] to turn either
    /// into an error.
    ///
    /// # Errors
    ///
    /// Structural errors found before any stack runs.
    pub async fn up(&self, selected: &[String]) -> Result<RunReport> {
        let stacks = self.select(selected)?;
        self.check_references(&stacks).await?;
        info!(
            "Bringing up {} stacks for {}/{}",
            stacks.len(),
            self.project.name,
            self.project.environment
        );

        let resolver = self.resolver();
        let engine = DiffEngine::new(self.providers, &resolver, self.project);
        let executor = ApplyExecutor::new(self.providers, self.store, &resolver, self.project)
            .with_settings(self.settings.clone())
            .with_cancellation(self.cancel.clone());

        let mut report = RunReport::new(StackOperation::Up);

        for (i, (stack, graph)) in stacks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.skipped.push(stack.name().to_string());
                continue;
            }

            resolver.reset();
            let applied = self
                .locked(stack.name(), async {
                    let prior = self.store.load_stack(stack.name()).await?;
                    let plan = engine.plan(stack, graph, &prior).await?;
                    executor.apply(&plan).await
                })
                .await;

            match applied {
                Ok(result) => {
                    if !result.is_success() {
                        warn!("Stack {} did not fully converge: {result}", stack.name());
                    }
                    report.results.push(result);
                }
                Err(e) => {
                    report.abort(stack.name(), e, stacks[i + 1..].iter().map(|(s, _)| *s));
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Deletes every resource of the selected stacks, downstream stacks first.
    ///
    /// Errors of a single stack end the run as in [`Self::up`].
    ///
    /// # Errors
    ///
    /// Structural errors found before any stack runs.
    pub async fn destroy(&self, selected: &[String]) -> Result<RunReport> {
        let mut stacks = self.select(selected)?;
        stacks.reverse();
        info!(
            "Destroying {} stacks for {}/{}",
            stacks.len(),
            self.project.name,
            self.project.environment
        );

        let resolver = self.resolver();
        let engine = DiffEngine::new(self.providers, &resolver, self.project);
        let executor = ApplyExecutor::new(self.providers, self.store, &resolver, self.project)
            .with_settings(self.settings.clone())
            .with_cancellation(self.cancel.clone());

        let mut report = RunReport::new(StackOperation::Destroy);

        for (i, (stack, _)) in stacks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.skipped.push(stack.name().to_string());
                continue;
            }

            resolver.reset();
            let destroyed = self
                .locked(stack.name(), async {
                    let prior = self.store.load_stack(stack.name()).await?;
                    let plan = engine.plan_destroy(&prior)?;
                    executor.apply(&plan).await
                })
                .await;

            match destroyed {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    report.abort(stack.name(), e, stacks[i + 1..].iter().map(|(s, _)| *s));
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Runs `work` while holding the stack lock.
    async fn locked<T>(&self, stack: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self.store.acquire_lock(stack, &self.holder).await?;
        let result = work.await;
        if let Err(e) = self.store.release_lock(stack, &lock.lock_id).await {
            warn!("Failed to release lock on stack {stack}: {e}");
        }
        result
    }
}
