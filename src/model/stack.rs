//! Stacks: ordered collections of resources with exported outputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::resource::{Inputs, Resource, ResourceId};
use super::value::{Reference, Value};
use crate::error::ModelError;

/// An independently-applied unit of declared resources.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    name: String,
    resources: Vec<Resource>,
    index: HashMap<ResourceId, usize>,
    outputs: BTreeMap<String, Value>,
}

impl Stack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares a resource in this stack.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::DuplicateId` if `id` is already declared.
    pub fn declare<I, D>(
        &mut self,
        kind: impl Into<String>,
        id: impl Into<ResourceId>,
        inputs: Inputs,
        depends_on: I,
    ) -> Result<&Resource, ModelError>
    where
        I: IntoIterator<Item = D>,
        D: Into<ResourceId>,
    {
        self.add(Resource::new(kind, id, inputs, depends_on))
    }

    /// Registers a pre-built resource.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::DuplicateId` if the resource id is already declared,
    /// `ModelError::ReservedId` if it contains the replaced-instance separator.
    pub fn add(&mut self, resource: Resource) -> Result<&Resource, ModelError> {
        if resource.id.is_replaced_instance() {
            return Err(ModelError::ReservedId {
                stack: self.name.clone(),
                id: resource.id.to_string(),
            });
        }
        if self.index.contains_key(&resource.id) {
            return Err(ModelError::DuplicateId {
                stack: self.name.clone(),
                id: resource.id.to_string(),
            });
        }
        let position = self.resources.len();
        self.index.insert(resource.id.clone(), position);
        self.resources.push(resource);
        Ok(&self.resources[position])
    }

    /// Exports a named output for downstream stacks.
    pub fn export(&mut self, key: impl Into<String>, value: Value) {
        self.outputs.insert(key.into(), value);
    }

    /// Returns the stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Returns the exported outputs.
    #[must_use]
    pub const fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Looks up a resource by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    /// Returns the declaration index of a resource.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns true if the resource is declared.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Other stacks this stack reads outputs from.
    #[must_use]
    pub fn referenced_stacks(&self) -> BTreeSet<String> {
        let mut stacks: BTreeSet<String> = self
            .resources
            .iter()
            .flat_map(Resource::referenced_stacks)
            .collect();
        for value in self.outputs.values() {
            for reference in value.references() {
                if let Reference::Stack { stack, .. } = reference {
                    stacks.insert(stack);
                }
            }
        }
        stacks.remove(&self.name);
        stacks
    }
}
