//! Deterministic call keys.
//!
//! A key is `sha256:<hex>` over the canonical JSON of the call signature.
//! Canonical means: object keys sorted (serde_json's default `Map` is a
//! `BTreeMap`), positional arguments in call order, named arguments sorted by
//! name. Two processes computing the key for the same logical call always
//! agree.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::ToolArgs;

/// Prefix carried by every call key.
pub const KEY_ALGORITHM: &str = "sha256";

/// Everything that shapes a call's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSignature {
    tool: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    extra: BTreeMap<String, Value>,
}

impl CallSignature {
    /// Signature for `tool` with no arguments yet.
    #[must_use]
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Signature for a tool invocation.
    #[must_use]
    pub fn from_args(tool: impl Into<String>, args: &ToolArgs) -> Self {
        Self {
            tool: tool.into(),
            args: args.positional().to_vec(),
            kwargs: args.named().clone(),
            extra: BTreeMap::new(),
        }
    }

    /// Append a positional argument (order-sensitive).
    #[must_use]
    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    /// Add a named argument (order-independent).
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Add a call-shaping parameter that is not an argument (model, version).
    #[must_use]
    pub fn extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Tool identity.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Canonical byte encoding that the key hashes.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing plain Values and BTreeMaps cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The call key, `sha256:<hex>`.
    #[must_use]
    pub fn key(&self) -> String {
        let digest = Sha256::digest(self.canonical_bytes());
        format!("{KEY_ALGORITHM}:{}", hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_format() {
        let key = CallSignature::new("llm").arg(json!("hi")).key();
        assert!(key.starts_with("sha256:"));
        assert_eq!(key.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_named_args_are_order_independent() {
        let a = CallSignature::new("t")
            .kwarg("x", json!(1))
            .kwarg("y", json!({"b": 2, "a": 1}));
        let b = CallSignature::new("t")
            .kwarg("y", json!({"a": 1, "b": 2}))
            .kwarg("x", json!(1));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_positional_order_matters() {
        let a = CallSignature::new("t").arg(json!(1)).arg(json!(2));
        let b = CallSignature::new("t").arg(json!(2)).arg(json!(1));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_tool_and_extra_shape_the_key() {
        let base = CallSignature::new("t").arg(json!("q"));
        assert_ne!(base.key(), CallSignature::new("u").arg(json!("q")).key());
        assert_ne!(base.key(), base.clone().extra("model", json!("m-1")).key());
    }
}
