//! Input values with deferred placeholders.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use super::resource::ResourceId;

/// An input value, possibly unknown until an upstream resource or stack converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// A concrete JSON value.
    Literal(JsonValue),
    /// An output of another resource in the same stack.
    Deferred {
        /// Source resource.
        resource: ResourceId,
        /// Output key on the source resource.
        key: String,
    },
    /// An output exported by another stack.
    StackOutput {
        /// Source stack.
        stack: String,
        /// Exported output key.
        key: String,
    },
    /// A list whose elements may be deferred.
    List(Vec<Value>),
    /// A map whose values may be deferred.
    Map(BTreeMap<String, Value>),
    /// String interpolation of parts.
    Concat(Vec<Value>),
}

/// A single unresolved placeholder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reference {
    /// `resource.key` within the same stack.
    Resource {
        /// Source resource.
        resource: ResourceId,
        /// Output key.
        key: String,
    },
    /// `stack.key` exported by another stack.
    Stack {
        /// Source stack.
        stack: String,
        /// Output key.
        key: String,
    },
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource { resource, key } => write!(f, "{resource}.{key}"),
            Self::Stack { stack, key } => write!(f, "stack:{stack}.{key}"),
        }
    }
}

impl Value {
    /// Creates a literal value.
    #[must_use]
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a reference to an output of another resource.
    #[must_use]
    pub fn deferred(resource: impl Into<ResourceId>, key: impl Into<String>) -> Self {
        Self::Deferred {
            resource: resource.into(),
            key: key.into(),
        }
    }

    /// Creates a reference to an output exported by another stack.
    #[must_use]
    pub fn stack_output(stack: impl Into<String>, key: impl Into<String>) -> Self {
        Self::StackOutput {
            stack: stack.into(),
            key: key.into(),
        }
    }

    /// Returns true if the value contains no placeholders.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Literal(_) => true,
            Self::Deferred { .. } | Self::StackOutput { .. } => false,
            Self::List(items) | Self::Concat(items) => items.iter().all(Self::is_resolved),
            Self::Map(entries) => entries.values().all(Self::is_resolved),
        }
    }

    /// Collects every placeholder in the value tree, in traversal order.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references(&self, out: &mut Vec<Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Deferred { resource, key } => out.push(Reference::Resource {
                resource: resource.clone(),
                key: key.clone(),
            }),
            Self::StackOutput { stack, key } => out.push(Reference::Stack {
                stack: stack.clone(),
                key: key.clone(),
            }),
            Self::List(items) | Self::Concat(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolves the value tree using `lookup` for each placeholder.
    ///
    /// Returns the concrete JSON value, or the list of placeholders that
    /// `lookup` could not answer.
    pub fn resolve_with<F>(&self, lookup: &mut F) -> Result<JsonValue, Vec<Reference>>
    where
        F: FnMut(&Reference) -> Option<JsonValue>,
    {
        let mut missing = Vec::new();
        let resolved = self.resolve_inner(lookup, &mut missing);
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(missing)
        }
    }

    fn resolve_inner<F>(&self, lookup: &mut F, missing: &mut Vec<Reference>) -> JsonValue
    where
        F: FnMut(&Reference) -> Option<JsonValue>,
    {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Deferred { resource, key } => lookup_or_record(
                Reference::Resource {
                    resource: resource.clone(),
                    key: key.clone(),
                },
                lookup,
                missing,
            ),
            Self::StackOutput { stack, key } => lookup_or_record(
                Reference::Stack {
                    stack: stack.clone(),
                    key: key.clone(),
                },
                lookup,
                missing,
            ),
            Self::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| item.resolve_inner(lookup, missing))
                    .collect(),
            ),
            Self::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve_inner(lookup, missing)))
                    .collect(),
            ),
            Self::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&interpolate(&part.resolve_inner(lookup, missing)));
                }
                JsonValue::String(out)
            }
        }
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Literal(JsonValue::String(value.to_string()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Literal(JsonValue::String(value))
    }
}

fn lookup_or_record<F>(reference: Reference, lookup: &mut F, missing: &mut Vec<Reference>) -> JsonValue
where
    F: FnMut(&Reference) -> Option<JsonValue>,
{
    lookup(&reference).unwrap_or_else(|| {
        missing.push(reference);
        JsonValue::Null
    })
}

/// Renders a resolved part for string interpolation.
fn interpolate(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_is_resolved() {
        assert!(Value::literal(json!({"cidr": "10.0.0.0/16"})).is_resolved());
        assert!(!Value::deferred("vpc", "id").is_resolved());
        assert!(!Value::List(vec![Value::literal(1), Value::stack_output("network", "vpcId")])
            .is_resolved());
    }

    #[test]
    fn test_references_walk_nested_values() {
        let mut map = BTreeMap::new();
        map.insert(String::from("subnet"), Value::deferred("subnet", "id"));
        let value = Value::Concat(vec![
            Value::literal("arn:"),
            Value::stack_output("network", "vpcId"),
            Value::Map(map),
        ]);

        let refs = value.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].to_string(), "stack:network.vpcId");
        assert_eq!(refs[1].to_string(), "subnet.id");
    }

    #[test]
    fn test_resolve_concat() {
        let value = Value::Concat(vec![
            Value::literal("cluster-"),
            Value::deferred("vpc", "id"),
            Value::literal("-"),
            Value::literal(3),
        ]);

        let resolved = value
            .resolve_with(&mut |r: &Reference| match r {
                Reference::Resource { key, .. } if key == "id" => Some(json!("vpc-123")),
                _ => None,
            })
            .expect("should resolve");

        assert_eq!(resolved, json!("cluster-vpc-123-3"));
    }

    #[test]
    fn test_resolve_reports_missing() {
        let value = Value::List(vec![
            Value::deferred("vpc", "id"),
            Value::stack_output("network", "vpcId"),
        ]);

        let missing = value
            .resolve_with(&mut |r: &Reference| match r {
                Reference::Resource { .. } => Some(json!("vpc-1")),
                Reference::Stack { .. } => None,
            })
            .expect_err("stack output is missing");

        assert_eq!(
            missing,
            vec![Reference::Stack {
                stack: String::from("network"),
                key: String::from("vpcId"),
            }]
        );
    }
}
