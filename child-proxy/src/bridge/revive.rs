//! Revivable value types.
//!
//! Plain JSON loses type identity across the process boundary. A revivable
//! value travels as a typed envelope, `{"__type": <tag>, ...fields}`, and the
//! receiving side hands it to the reviver registered for that tag. Both sides
//! must register the same tags: an envelope with an unknown tag is a
//! protocol violation.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope key carrying the type tag.
pub const TYPE_KEY: &str = "__type";

/// A structured type that survives the trip as a typed envelope.
pub trait Revivable: Serialize + DeserializeOwned {
    const TYPE_TAG: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevivalError {
    #[error("unregistered revivable type `{0}`")]
    UnknownTag(String),

    #[error("`__type` must be a string, got {0}")]
    InvalidTag(Value),

    #[error("malformed `{tag}` value: {reason}")]
    Malformed { tag: String, reason: String },
}

type Reviver = fn(Value) -> Result<Value, RevivalError>;

/// Maps type tags to revivers. Consulted by the codec on both sides.
#[derive(Clone)]
pub struct RevivalRegistry {
    revivers: HashMap<&'static str, Reviver>,
}

impl RevivalRegistry {
    /// A registry that knows no tags at all.
    pub fn empty() -> Self {
        Self {
            revivers: HashMap::new(),
        }
    }

    pub fn register<T: Revivable>(&mut self) -> &mut Self {
        self.revivers.insert(T::TYPE_TAG, revive_as::<T>);
        self
    }

    pub fn with<T: Revivable>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.revivers.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.revivers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Revive every envelope in `value`, innermost data untouched.
    pub fn revive(&self, value: Value) -> Result<Value, RevivalError> {
        match value {
            Value::Object(map) => match map.get(TYPE_KEY) {
                Some(Value::String(tag)) => {
                    let reviver = self
                        .revivers
                        .get(tag.as_str())
                        .ok_or_else(|| RevivalError::UnknownTag(tag.clone()))?;
                    reviver(Value::Object(map))
                }
                Some(other) => Err(RevivalError::InvalidTag(other.clone())),
                None => map
                    .into_iter()
                    .map(|(k, v)| self.revive(v).map(|v| (k, v)))
                    .collect::<Result<serde_json::Map<_, _>, _>>()
                    .map(Value::Object),
            },
            Value::Array(items) => items
                .into_iter()
                .map(|v| self.revive(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other),
        }
    }

    /// Reject outgoing values whose envelopes the other side could not revive.
    pub fn check(&self, value: &Value) -> Result<(), RevivalError> {
        match value {
            Value::Object(map) => match map.get(TYPE_KEY) {
                Some(Value::String(tag)) if self.contains(tag) => Ok(()),
                Some(Value::String(tag)) => Err(RevivalError::UnknownTag(tag.clone())),
                Some(other) => Err(RevivalError::InvalidTag(other.clone())),
                None => map.values().try_for_each(|v| self.check(v)),
            },
            Value::Array(items) => items.iter().try_for_each(|v| self.check(v)),
            _ => Ok(()),
        }
    }
}

impl Default for RevivalRegistry {
    fn default() -> Self {
        Self::empty().with::<File>()
    }
}

impl std::fmt::Debug for RevivalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevivalRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

/// Serialize `value` as an envelope, adding the tag if its serde impl omits it.
pub fn envelope<T: Revivable>(value: &T) -> Result<Value, RevivalError> {
    let malformed = |reason: String| RevivalError::Malformed {
        tag: T::TYPE_TAG.to_string(),
        reason,
    };
    match serde_json::to_value(value).map_err(|e| malformed(e.to_string()))? {
        Value::Object(mut map) => {
            map.insert(TYPE_KEY.to_string(), Value::String(T::TYPE_TAG.to_string()));
            Ok(Value::Object(map))
        }
        other => Err(malformed(format!("expected an object, got {other}"))),
    }
}

fn revive_as<T: Revivable>(value: Value) -> Result<Value, RevivalError> {
    let typed: T = serde_json::from_value(value).map_err(|e| RevivalError::Malformed {
        tag: T::TYPE_TAG.to_string(),
        reason: e.to_string(),
    })?;
    envelope(&typed)
}

/// A source file or artifact handed to a worker, e.g. a mutated module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "__type", rename = "File")]
pub struct File {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl File {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Content as UTF-8, if it is.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

impl Revivable for File {
    const TYPE_TAG: &'static str = "File";
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        line: u32,
        column: u32,
    }

    impl Revivable for Position {
        const TYPE_TAG: &'static str = "Position";
    }

    #[test]
    fn file_serializes_as_envelope() {
        let file = File::new("src/add.js", "a + b");
        insta::assert_json_snapshot!(file, @r#"
        {
          "__type": "File",
          "name": "src/add.js",
          "content": "YSArIGI="
        }
        "#);
    }

    #[test]
    fn default_registry_knows_file() {
        let registry = RevivalRegistry::default();
        assert_eq!(registry.tags(), vec!["File"]);
    }

    #[test]
    fn revive_walks_nested_values() {
        let registry = RevivalRegistry::default();
        let file = serde_json::to_value(File::new("a.js", "x")).unwrap();
        let value = json!({"files": [file.clone(), {"plain": true}], "count": 1});

        let revived = registry.revive(value.clone()).unwrap();

        assert_eq!(revived, value);
        let back: File = serde_json::from_value(revived["files"][0].clone()).unwrap();
        assert_eq!(back.text(), Some("x"));
    }

    #[test]
    fn revive_rejects_unknown_tag() {
        let registry = RevivalRegistry::default();
        let value = json!([{"__type": "Mutant", "id": 1}]);

        assert_eq!(
            registry.revive(value.clone()),
            Err(RevivalError::UnknownTag("Mutant".to_string()))
        );
        assert_eq!(
            registry.check(&value),
            Err(RevivalError::UnknownTag("Mutant".to_string()))
        );
    }

    #[test]
    fn revive_rejects_malformed_payload() {
        let registry = RevivalRegistry::default();
        let value = json!({"__type": "File", "name": "a.js", "content": "not base64!"});

        assert!(matches!(
            registry.revive(value),
            Err(RevivalError::Malformed { tag, .. }) if tag == "File"
        ));
    }

    #[test]
    fn revive_rejects_non_string_tag() {
        let registry = RevivalRegistry::default();
        assert_eq!(
            registry.revive(json!({"__type": 3})),
            Err(RevivalError::InvalidTag(json!(3)))
        );
    }

    #[test]
    fn envelope_adds_missing_tag() {
        let registry = RevivalRegistry::default().with::<Position>();
        let value = envelope(&Position { line: 3, column: 9 }).unwrap();

        assert_eq!(value, json!({"__type": "Position", "line": 3, "column": 9}));
        assert_eq!(registry.check(&value), Ok(()));
        assert_eq!(registry.revive(value.clone()), Ok(value));
    }

    #[test]
    fn binary_file_content_survives() {
        let file = File::new("b.bin", vec![0u8, 159, 255]);
        let value = serde_json::to_value(&file).unwrap();
        let back: File = serde_json::from_value(value).unwrap();

        assert_eq!(back, file);
        assert_eq!(back.text(), None);
    }
}
