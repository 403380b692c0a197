//! Desired-state resources.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::value::{Reference, Value};

/// Separator between a resource id and the tag of a replaced instance.
pub const REPLACED_SEPARATOR: char = '#';

/// Identity of a resource, unique within a stack.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a new resource id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which a replaced instance of this resource stays tracked
    /// until it is deleted.
    #[must_use]
    pub fn replaced_instance(&self, tag: impl fmt::Display) -> Self {
        Self(format!("{}{REPLACED_SEPARATOR}replaced-{tag}", self.base()))
    }

    /// Whether this key tracks a replaced instance rather than a declared resource.
    #[must_use]
    pub fn is_replaced_instance(&self) -> bool {
        self.0.contains(REPLACED_SEPARATOR)
    }

    /// The declared resource id, without any replaced-instance tag.
    #[must_use]
    pub fn base(&self) -> &str {
        self.0.split_once(REPLACED_SEPARATOR).map_or(self.0.as_str(), |(base, _)| base)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&Self> for ResourceId {
    fn from(id: &Self) -> Self {
        id.clone()
    }
}

impl Borrow<str> for ResourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identity of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Creates a new provider id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the default provider from a kind's package prefix.
    ///
    /// `aws:ec2/vpc` maps to `aws`; a kind without a prefix is its own provider.
    #[must_use]
    pub fn from_kind(kind: &str) -> Self {
        let package = kind.split_once(':').map_or(kind, |(pkg, _)| pkg);
        Self(package.to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Declared inputs of a resource.
pub type Inputs = BTreeMap<String, Value>;

/// Inputs after every placeholder was resolved.
pub type ResolvedInputs = BTreeMap<String, serde_json::Value>;

/// A typed desired-state resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Identity within the stack.
    pub id: ResourceId,
    /// Resource kind, e.g. `aws:ec2/vpc`.
    pub kind: String,
    /// Input properties.
    pub inputs: Inputs,
    /// Explicit dependencies.
    pub depends_on: BTreeSet<ResourceId>,
    /// Provider handling this resource.
    pub provider: ProviderId,
}

impl Resource {
    /// Creates a resource using the kind's default provider.
    #[must_use]
    pub fn new<I, D>(kind: impl Into<String>, id: impl Into<ResourceId>, inputs: Inputs, depends_on: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<ResourceId>,
    {
        let kind = kind.into();
        let provider = ProviderId::from_kind(&kind);
        Self {
            id: id.into(),
            kind,
            inputs,
            depends_on: depends_on.into_iter().map(Into::into).collect(),
            provider,
        }
    }

    /// Overrides the provider reference.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Returns every placeholder embedded in the inputs.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        self.inputs.values().flat_map(Value::references).collect()
    }

    /// Resources referenced through `Deferred` values.
    #[must_use]
    pub fn implicit_dependencies(&self) -> BTreeSet<ResourceId> {
        self.references()
            .into_iter()
            .filter_map(|r| match r {
                Reference::Resource { resource, .. } => Some(resource),
                Reference::Stack { .. } => None,
            })
            .collect()
    }

    /// Explicit and implicit dependencies.
    #[must_use]
    pub fn all_dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.depends_on.clone();
        deps.extend(self.implicit_dependencies());
        deps
    }

    /// Stacks referenced through `StackOutput` values.
    #[must_use]
    pub fn referenced_stacks(&self) -> BTreeSet<String> {
        self.references()
            .into_iter()
            .filter_map(|r| match r {
                Reference::Stack { stack, .. } => Some(stack),
                Reference::Resource { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaced_instance_keys() {
        let id = ResourceId::new("vpc");
        assert!(!id.is_replaced_instance());
        assert_eq!(id.base(), "vpc");

        let old = id.replaced_instance(1_700_000_000_000_i64);
        assert_eq!(old.as_str(), "vpc#replaced-1700000000000");
        assert!(old.is_replaced_instance());
        assert_eq!(old.base(), "vpc");
        assert_eq!(old.replaced_instance(7).as_str(), "vpc#replaced-7");
    }

    #[test]
    fn test_default_provider_from_kind() {
        assert_eq!(ProviderId::from_kind("aws:ec2/vpc").as_str(), "aws");
        assert_eq!(ProviderId::from_kind("kubernetes:helm.sh/v3:Release").as_str(), "kubernetes");
        assert_eq!(ProviderId::from_kind("echo").as_str(), "echo");
    }

    #[test]
    fn test_dependencies_merge_explicit_and_implicit() {
        let mut inputs = Inputs::new();
        inputs.insert(String::from("vpcId"), Value::deferred("vpc", "id"));
        inputs.insert(String::from("region"), Value::stack_output("network", "region"));

        let resource = Resource::new("aws:eks/cluster", "cluster", inputs, ["role"]);

        let deps: Vec<String> = resource
            .all_dependencies()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(deps, vec!["role", "vpc"]);
        assert!(resource.referenced_stacks().contains("network"));
    }

    #[test]
    fn test_with_provider_overrides_default() {
        let resource = Resource::new("aws:s3/bucket", "bucket", Inputs::new(), Vec::<ResourceId>::new())
            .with_provider("aws-west");
        assert_eq!(resource.provider.as_str(), "aws-west");
    }
}
