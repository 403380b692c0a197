//! Plan types and construction helpers.
//!
//! A plan is an ordered list of actions. `depends_on` holds indices of
//! earlier actions that must finish successfully before an action runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::graph::kahn_order;
use crate::model::{Reference, Resource, ResourceId, Value};
use crate::state::{StackState, StateRecord};

/// A complete plan for one stack.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Stack the plan applies to.
    pub stack: String,
    /// Planned actions in execution order.
    pub actions: Vec<Action>,
    /// Outputs to publish after apply.
    #[serde(skip)]
    pub outputs: BTreeMap<String, Value>,
    /// Whether this plan tears the stack down.
    pub destroy: bool,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    /// Resource the action applies to.
    pub resource_id: ResourceId,
    /// Action type.
    pub kind: ActionKind,
    /// Reason for this action.
    pub reason: String,
    /// Part of a replacement (create of the new instance or delete of the old one).
    pub replacement: bool,
    /// Hash of the resolved inputs, when known at plan time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
    /// Inputs reference upstream outputs produced during apply.
    pub deferred_inputs: bool,
    /// Placeholders that could not be resolved at plan time.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<Reference>,
    /// Indices of actions that must complete first.
    pub depends_on: Vec<usize>,
    /// Desired resource (absent for deletes).
    #[serde(skip)]
    pub resource: Option<Resource>,
    /// Prior state record, if one exists.
    #[serde(skip)]
    pub prior: Option<StateRecord>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a new instance.
    Create,
    /// Update the existing instance in place.
    Update,
    /// Delete an instance.
    Delete,
    /// No change.
    #[serde(rename = "no_op")]
    NoOp,
    /// Waiting for another stack's outputs.
    PendingDependency,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(stack: impl Into<String>, outputs: BTreeMap<String, Value>) -> Self {
        Self {
            stack: stack.into(),
            actions: Vec::new(),
            outputs,
            destroy: false,
            created_at: Utc::now(),
        }
    }

    /// Creates a plan deleting every recorded resource in reverse
    /// dependency order.
    #[must_use]
    pub fn destroy(prior: &StackState) -> Self {
        let mut plan = Self::new(prior.stack.clone(), BTreeMap::new());
        plan.destroy = true;
        plan.push_deletes(prior.records.values().cloned().collect(), "stack destroyed");
        plan
    }

    /// Appends an action and returns its index.
    pub(crate) fn push(&mut self, action: Action) -> usize {
        self.actions.push(action);
        self.actions.len() - 1
    }

    /// Appends the delete of the instance replaced by the action at
    /// `create_idx`, after every index in `after`.
    pub(crate) fn push_replacement_delete(&mut self, create_idx: usize, after: Vec<usize>) {
        let create = &self.actions[create_idx];
        let Some(old) = create.prior.as_ref().map(StateRecord::retire) else {
            return;
        };
        self.push_replaced_delete(old, after);
    }

    /// Appends the delete of a replaced instance, after every index in `after`.
    pub(crate) fn push_replaced_delete(&mut self, old: StateRecord, after: Vec<usize>) {
        let mut depends_on = after;
        depends_on.sort_unstable();
        depends_on.dedup();

        let mut action = Action::delete(old, "old instance replaced");
        action.replacement = true;
        action.depends_on = depends_on;
        self.push(action);
    }

    /// Appends deletes for `records`, dependents first.
    ///
    /// Each delete waits for every earlier action whose resource depended on
    /// the deleted one at its last apply.
    pub(crate) fn push_deletes(&mut self, records: Vec<StateRecord>, reason: &str) {
        for record in reverse_dependency_order(records) {
            let depends_on = self
                .actions
                .iter()
                .enumerate()
                .filter(|(_, action)| action.depended_on(record.resource_id.base()))
                .map(|(i, _)| i)
                .collect();

            let mut action = Action::delete(record, reason);
            action.depends_on = depends_on;
            self.push(action);
        }
    }

    /// Returns true if the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(Action::is_change)
    }

    /// Returns true if the plan has no actions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of one kind.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Actions for one resource, in plan order.
    #[must_use]
    pub fn actions_for(&self, id: &str) -> Vec<&Action> {
        self.actions.iter().filter(|a| a.resource_id.as_str() == id).collect()
    }

    /// Returns actions that can be executed immediately (no dependencies).
    #[must_use]
    pub fn ready_actions(&self) -> Vec<&Action> {
        self.actions.iter().filter(|a| a.depends_on.is_empty()).collect()
    }

    /// Gets actions that depend on a specific action index.
    #[must_use]
    pub fn dependent_actions(&self, action_idx: usize) -> Vec<(usize, &Action)> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.depends_on.contains(&action_idx))
            .collect()
    }

    /// Every action index reachable from `action_idx` through `depends_on`
    /// edges in reverse.
    #[must_use]
    pub fn transitive_dependents(&self, action_idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![action_idx];
        while let Some(idx) = stack.pop() {
            for (next, _) in self.dependent_actions(idx) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Checks that every dependency points to an earlier action.
    #[must_use]
    pub fn is_well_ordered(&self) -> bool {
        self.actions
            .iter()
            .enumerate()
            .all(|(i, a)| a.depends_on.iter().all(|&d| d < i))
    }
}

impl Action {
    /// Creates an action for a desired resource.
    #[must_use]
    pub fn for_resource(resource: &Resource, kind: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            resource_id: resource.id.clone(),
            kind,
            reason: reason.into(),
            replacement: false,
            inputs_hash: None,
            deferred_inputs: false,
            unresolved: Vec::new(),
            depends_on: Vec::new(),
            resource: Some(resource.clone()),
            prior: None,
        }
    }

    /// Creates a delete action for a recorded resource.
    ///
    /// A replaced instance is reported under its declared id.
    #[must_use]
    pub fn delete(record: StateRecord, reason: impl Into<String>) -> Self {
        Self {
            resource_id: ResourceId::new(record.resource_id.base()),
            kind: ActionKind::Delete,
            reason: reason.into(),
            replacement: record.resource_id.is_replaced_instance(),
            inputs_hash: None,
            deferred_inputs: false,
            unresolved: Vec::new(),
            depends_on: Vec::new(),
            resource: None,
            prior: Some(record),
        }
    }

    #[must_use]
    pub(crate) fn with_hash(mut self, hash: String) -> Self {
        self.inputs_hash = Some(hash);
        self
    }

    #[must_use]
    pub(crate) fn with_prior(mut self, prior: Option<&StateRecord>) -> Self {
        self.prior = prior.cloned();
        self
    }

    /// Returns true for actions that call a provider.
    #[must_use]
    pub const fn is_change(&self) -> bool {
        matches!(self.kind, ActionKind::Create | ActionKind::Update | ActionKind::Delete)
    }

    /// Whether this action's resource depended on `id`, now or at its last apply.
    fn depended_on(&self, id: &str) -> bool {
        if self.resource_id.as_str() == id {
            return false;
        }
        self.prior.as_ref().is_some_and(|p| p.dependencies.contains(id))
            || self.resource.as_ref().is_some_and(|r| r.all_dependencies().contains(id))
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.kind, self.replacement) {
            (ActionKind::Create, true) => format!("Replace '{}'", self.resource_id),
            (ActionKind::Create, false) => format!("Create '{}'", self.resource_id),
            (ActionKind::Update, _) => format!("Update '{}'", self.resource_id),
            (ActionKind::Delete, true) => format!("Delete replaced instance of '{}'", self.resource_id),
            (ActionKind::Delete, false) => format!("Delete '{}'", self.resource_id),
            (ActionKind::NoOp, _) => format!("No change for '{}'", self.resource_id),
            (ActionKind::PendingDependency, _) => format!("Wait for inputs of '{}'", self.resource_id),
        }
    }
}

/// Orders records so that a record comes before the records it depended on.
fn reverse_dependency_order(records: Vec<StateRecord>) -> Vec<StateRecord> {
    // Replaced instances share their declared id's slot.
    let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        index.entry(record.resource_id.base()).or_default().push(i);
    }
    let mut deps = vec![BTreeSet::new(); records.len()];
    let mut rdeps = vec![BTreeSet::new(); records.len()];
    for (i, record) in records.iter().enumerate() {
        for dep in &record.dependencies {
            for &j in index.get(dep.as_str()).into_iter().flatten() {
                if j != i {
                    deps[i].insert(j);
                    rdeps[j].insert(i);
                }
            }
        }
    }

    let mut order = kahn_order(&deps, &rdeps);
    // Records caught in a dependency cycle are deleted last.
    let placed: BTreeSet<usize> = order.iter().copied().collect();
    order.extend((0..records.len()).filter(|i| !placed.contains(i)));
    order.reverse();

    let mut slots: Vec<Option<StateRecord>> = records.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
            Self::PendingDependency => "pending",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.resource_id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() && self.count(ActionKind::PendingDependency) == 0 {
            return write!(f, "No changes required for stack {}", self.stack);
        }

        writeln!(f, "Plan for stack {} ({} actions):", self.stack, self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
        }
        Ok(())
    }
}
