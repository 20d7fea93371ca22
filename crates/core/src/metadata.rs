//! Opaque metadata document carried by every job.
//!
//! The engine never looks inside a [`Metadata`] document; it belongs to the
//! domain handler. Stores serialize it to JSON at their boundary only, so
//! domain code always works with the decoded document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::RecordError;

/// A single metadata value.
///
/// JSON `null` has no representation: absent keys stand for "no value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(Metadata),
}

/// Key/value document with deterministic (sorted) key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Option<MetadataValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            MetadataValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Check that the document survives a JSON round trip.
    ///
    /// JSON has no NaN or infinity; `serde_json` would write them as `null`,
    /// which [`Metadata::from_json`] rejects.
    pub fn validate(&self) -> Result<(), RecordError> {
        self.iter().try_for_each(|(key, value)| value.validate(key))
    }

    /// Encode for storage.
    pub fn to_json(&self) -> Result<JsonValue, RecordError> {
        self.validate()?;
        serde_json::to_value(self).map_err(|e| RecordError::invalid_metadata(e.to_string()))
    }

    /// Decode a stored document. The top level must be a JSON object.
    pub fn from_json(value: JsonValue) -> Result<Self, RecordError> {
        if !value.is_object() {
            return Err(RecordError::invalid_metadata(
                "metadata document must be a JSON object",
            ));
        }
        serde_json::from_value(value).map_err(|e| RecordError::invalid_metadata(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String, RecordError> {
        Ok(self.to_json()?.to_string())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, RecordError> {
        let value: JsonValue =
            serde_json::from_str(raw).map_err(|e| RecordError::invalid_metadata(e.to_string()))?;
        Self::from_json(value)
    }
}

impl MetadataValue {
    fn validate(&self, path: &str) -> Result<(), RecordError> {
        match self {
            MetadataValue::Float(f) if !f.is_finite() => Err(RecordError::invalid_metadata(
                format!("{path}: {f} has no JSON representation"),
            )),
            MetadataValue::List(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| item.validate(&format!("{path}[{i}]"))),
            MetadataValue::Map(inner) => inner
                .iter()
                .try_for_each(|(key, value)| value.validate(&format!("{path}.{key}"))),
            _ => Ok(()),
        }
    }
}

impl FromIterator<(String, MetadataValue)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, MetadataValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Metadata> for MetadataValue {
    fn from(value: Metadata) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<MetadataValue>> From<Vec<T>> for MetadataValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_nested_documents() {
        let meta = Metadata::from_json(json!({
            "rebuild": true,
            "arches": ["amd64", "arm64"],
            "overlay": {"pocket": "release", "component": 3},
            "ratio": 0.5
        }))
        .unwrap();

        assert_eq!(meta.get_bool("rebuild"), Some(true));
        assert_eq!(
            meta.get("arches"),
            Some(&MetadataValue::List(vec!["amd64".into(), "arm64".into()]))
        );
        match meta.get("overlay") {
            Some(MetadataValue::Map(inner)) => assert_eq!(inner.get_i64("component"), Some(3)),
            other => panic!("expected nested map, got {other:?}"),
        }
        assert_eq!(meta.get("ratio"), Some(&MetadataValue::Float(0.5)));
    }

    #[test]
    fn rejects_non_object_and_null() {
        assert!(Metadata::from_json(json!([1, 2])).is_err());
        assert!(Metadata::from_json(json!({"x": null})).is_err());
        assert!(Metadata::from_json_str("not json").is_err());
    }

    #[test]
    fn encodes_with_sorted_keys() {
        let meta = Metadata::new().with("b", 1).with("a", "x");
        assert_eq!(meta.to_json_string().unwrap(), r#"{"a":"x","b":1}"#);
        assert_eq!(Metadata::from_json(meta.to_json().unwrap()).unwrap(), meta);
    }

    #[test]
    fn non_finite_floats_are_not_encoded() {
        let meta = Metadata::new().with("ratio", f64::NAN);
        assert!(matches!(meta.to_json(), Err(RecordError::InvalidMetadata(msg)) if msg.contains("ratio")));

        let nested = Metadata::new().with(
            "overlay",
            Metadata::new().with("weights", vec![1.0, f64::INFINITY]),
        );
        let err = nested.validate().unwrap_err();
        assert!(matches!(err, RecordError::InvalidMetadata(msg) if msg.starts_with("overlay.weights[1]")));
        assert!(Metadata::new().with("ratio", 0.25).validate().is_ok());
    }
}
