//! Input hashing for change detection.
//!
//! The hash covers the resource kind, its provider and the canonical JSON of
//! its resolved inputs. Object keys are sorted so that equal inputs always
//! hash equally.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::model::{ProviderId, ResolvedInputs};

/// Hasher for resolved resource inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputsHasher;

impl InputsHasher {
    /// Creates a new inputs hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's resolved inputs.
    #[must_use]
    pub fn hash_inputs(&self, kind: &str, provider: &ProviderId, inputs: &ResolvedInputs) -> String {
        let mut hasher = Sha256::new();

        hasher.update(kind.as_bytes());
        hasher.update([0]);
        hasher.update(provider.as_str().as_bytes());
        hasher.update([0]);

        let mut canonical = String::new();
        canonical.push('{');
        for (i, (key, value)) in inputs.iter().enumerate() {
            if i > 0 {
                canonical.push(',');
            }
            write_canonical(&JsonValue::String(key.clone()), &mut canonical);
            canonical.push(':');
            write_canonical(value, &mut canonical);
        }
        canonical.push('}');
        hasher.update(canonical.as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        if hash.len() >= 12 { &hash[..12] } else { hash }
    }
}

/// Writes JSON with object keys in sorted order.
fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&JsonValue::String(key.clone()), out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, JsonValue)]) -> ResolvedInputs {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = InputsHasher::new();
        let provider = ProviderId::new("aws");
        let a = inputs(&[("tags", json!({"b": 1, "a": 2})), ("cidr", json!("10.0.0.0/16"))]);
        let b = inputs(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({"a": 2, "b": 1}))]);

        let hash_a = hasher.hash_inputs("aws:ec2/vpc", &provider, &a);
        assert_eq!(hash_a, hasher.hash_inputs("aws:ec2/vpc", &provider, &b));
        assert_eq!(hash_a.len(), 64);
    }

    #[test]
    fn test_hash_covers_kind_provider_and_inputs() {
        let hasher = InputsHasher::new();
        let aws = ProviderId::new("aws");
        let base = inputs(&[("cidr", json!("10.0.0.0/16"))]);
        let hash = hasher.hash_inputs("aws:ec2/vpc", &aws, &base);

        assert_ne!(hash, hasher.hash_inputs("aws:ec2/subnet", &aws, &base));
        assert_ne!(hash, hasher.hash_inputs("aws:ec2/vpc", &ProviderId::new("aws-west"), &base));
        assert_ne!(
            hash,
            hasher.hash_inputs("aws:ec2/vpc", &aws, &inputs(&[("cidr", json!("10.1.0.0/16"))]))
        );
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(InputsHasher::short_hash("abcdefghijklmnop"), "abcdefghijkl");
        assert_eq!(InputsHasher::short_hash("abc"), "abc");
    }
}
