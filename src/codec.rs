//! Document codecs.
//!
//! The engine stores documents as opaque bytes. A [`DocumentCodec`] is the
//! only component that looks inside them: it extracts index keys for an
//! index expression and stamps generated ids.

use crate::error::{Result, StorageError};
use crate::index::IndexKey;
use serde_json::{Map, Number, Value};

/// Field holding the primary key
pub const ID_FIELD: &str = "_id";

static NULL: Value = Value::Null;

pub trait DocumentCodec: Send + Sync {
    /// Keys of `document` for an index `expression`. A document always
    /// yields at least one key.
    fn extract_keys(&self, document: &[u8], expression: &str) -> Result<Vec<IndexKey>>;

    /// Primary key of `document`, `None` when absent or null
    fn get_id(&self, document: &[u8]) -> Result<Option<IndexKey>>;

    /// Copy of `document` carrying `id` as its primary key
    fn with_id(&self, document: &[u8], id: &IndexKey) -> Result<Vec<u8>>;
}

/// Codec for JSON object documents.
///
/// Expressions are dotted paths (`$.address.city`, the `$.` is optional).
/// An array along the path or at its end yields one key per element;
/// a missing field yields `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDocumentCodec;

impl JsonDocumentCodec {
    pub fn new() -> Self {
        Self
    }

    fn parse(document: &[u8]) -> Result<Map<String, Value>> {
        match serde_json::from_slice(document)? {
            Value::Object(map) => Ok(map),
            _ => Err(StorageError::invalid_operation("document is not a JSON object")),
        }
    }

    fn path(expression: &str) -> Vec<&str> {
        let path = expression
            .strip_prefix("$.")
            .or_else(|| expression.strip_prefix('$'))
            .unwrap_or(expression);
        path.split('.').filter(|part| !part.is_empty()).collect()
    }

    fn collect<'v>(value: &'v Value, path: &[&str], out: &mut Vec<&'v Value>) {
        match (value, path.split_first()) {
            (Value::Array(items), _) => {
                for item in items {
                    Self::collect(item, path, out);
                }
            }
            (_, None) => out.push(value),
            (Value::Object(map), Some((field, rest))) => match map.get(*field) {
                Some(child) => Self::collect(child, rest, out),
                None => out.push(&NULL),
            },
            (_, Some(_)) => out.push(&NULL),
        }
    }
}

impl DocumentCodec for JsonDocumentCodec {
    fn extract_keys(&self, document: &[u8], expression: &str) -> Result<Vec<IndexKey>> {
        let root = Value::Object(Self::parse(document)?);
        let mut values = Vec::new();
        Self::collect(&root, &Self::path(expression), &mut values);

        let mut keys = values
            .into_iter()
            .map(value_to_key)
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            keys.push(IndexKey::Null);
        }
        Ok(keys)
    }

    fn get_id(&self, document: &[u8]) -> Result<Option<IndexKey>> {
        match Self::parse(document)?.get(ID_FIELD) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value_to_key(value).map(Some),
        }
    }

    fn with_id(&self, document: &[u8], id: &IndexKey) -> Result<Vec<u8>> {
        let mut map = Self::parse(document)?;
        map.insert(ID_FIELD.to_string(), key_to_value(id)?);
        Ok(serde_json::to_vec(&map)?)
    }
}

fn value_to_key(value: &Value) -> Result<IndexKey> {
    Ok(match value {
        Value::Null => IndexKey::Null,
        Value::Bool(b) => IndexKey::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(v) => match i32::try_from(v) {
                Ok(v) => IndexKey::Int32(v),
                Err(_) => IndexKey::Int64(v),
            },
            None => IndexKey::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => IndexKey::String(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(StorageError::invalid_operation(
                "nested arrays and objects cannot be index keys",
            ))
        }
    })
}

fn key_to_value(key: &IndexKey) -> Result<Value> {
    Ok(match key {
        IndexKey::Null => Value::Null,
        IndexKey::Int32(v) => Value::from(*v),
        IndexKey::Int64(v) => Value::from(*v),
        IndexKey::Double(v) => Number::from_f64(*v)
            .map(Value::Number)
            .ok_or_else(|| StorageError::invalid_operation("id must be a finite number"))?,
        IndexKey::String(s) => Value::String(s.clone()),
        IndexKey::Boolean(b) => Value::Bool(*b),
        other => {
            return Err(StorageError::invalid_operation(format!(
                "{} has no JSON form",
                other
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keys() -> Result<()> {
        let codec = JsonDocumentCodec::new();
        let doc = br#"{"_id": 7, "name": "Ann", "age": 5000000000, "score": 1.5,
            "tags": ["a", "b"], "address": {"city": "Oslo"},
            "orders": [{"sku": 1}, {"sku": 2}, {}]}"#;

        assert_eq!(codec.extract_keys(doc, "$._id")?, vec![IndexKey::Int32(7)]);
        assert_eq!(codec.extract_keys(doc, "name")?, vec![IndexKey::from("Ann")]);
        assert_eq!(codec.extract_keys(doc, "$.age")?, vec![IndexKey::Int64(5_000_000_000)]);
        assert_eq!(codec.extract_keys(doc, "$.score")?, vec![IndexKey::Double(1.5)]);
        assert_eq!(codec.extract_keys(doc, "$.tags")?, vec![IndexKey::from("a"), IndexKey::from("b")]);
        assert_eq!(codec.extract_keys(doc, "$.address.city")?, vec![IndexKey::from("Oslo")]);
        assert_eq!(
            codec.extract_keys(doc, "$.orders.sku")?,
            vec![IndexKey::Int32(1), IndexKey::Int32(2), IndexKey::Null]
        );
        assert_eq!(codec.extract_keys(doc, "$.missing.field")?, vec![IndexKey::Null]);
        assert!(codec.extract_keys(doc, "$.address").is_err());
        assert!(codec.extract_keys(b"[1, 2]", "$.x").is_err());
        Ok(())
    }

    #[test]
    fn test_ids() -> Result<()> {
        let codec = JsonDocumentCodec::new();
        assert_eq!(codec.get_id(br#"{"x": 1}"#)?, None);
        assert_eq!(codec.get_id(br#"{"_id": null}"#)?, None);
        assert_eq!(codec.get_id(br#"{"_id": "k1"}"#)?, Some(IndexKey::from("k1")));

        let stamped = codec.with_id(br#"{"x": 1}"#, &IndexKey::Int64(12))?;
        assert_eq!(codec.get_id(&stamped)?, Some(IndexKey::Int32(12)));
        assert_eq!(codec.extract_keys(&stamped, "x")?, vec![IndexKey::Int32(1)]);
        assert!(codec.with_id(br#"{"x": 1}"#, &IndexKey::MaxValue).is_err());
        Ok(())
    }
}
