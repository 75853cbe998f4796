//! Value types shared by every adapter
//!
//! [`FieldValue`] is the scalar a [`Record`] field can hold. Relational adapters read and
//! write rows as records, the object store converts typed entities to records for ordering
//! and aggregation, and batch operations report an [`Outcome`] each.

use super::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Scalar value that a record field can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit floating point
    Float(f32),
    /// 64-bit floating point
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp (Unix timestamp in microseconds)
    Timestamp(i64),
}

impl FieldValue {
    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            FieldValue::Int(v) => Some(*v != 0),
            FieldValue::Long(v) => Some(*v != 0),
            FieldValue::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the value as an i32
    pub fn as_int(&self) -> Option<i32> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Long(v) => i32::try_from(*v).ok(),
            FieldValue::Float(v) => Some(*v as i32),
            FieldValue::Double(v) => Some(*v as i32),
            FieldValue::String(s) => s.parse().ok(),
            FieldValue::Bool(v) => Some(*v as i32),
            _ => None,
        }
    }

    /// Get the value as an i64
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as i64),
            FieldValue::Float(v) => Some(*v as i64),
            FieldValue::Double(v) => Some(*v as i64),
            FieldValue::String(s) => s.parse().ok(),
            FieldValue::Bool(v) => Some(*v as i64),
            FieldValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as an f64
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            FieldValue::Float(v) => Some(*v as f64),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Long(v) => Some(*v as f64),
            FieldValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get the value as a string slice (zero-copy, String values only)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get the value as a string (with conversion)
    pub fn as_string(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Long(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::String(s) => s.clone(),
            FieldValue::Bytes(b) => format!("<{} bytes>", b.len()),
            FieldValue::Timestamp(v) => v.to_string(),
        }
    }

    /// Get the value as bytes (zero-copy)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get a timestamp value as a UTC date-time
    pub fn as_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            FieldValue::Timestamp(micros) => chrono::DateTime::from_timestamp_micros(*micros),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Check if the value is numeric
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldValue::Int(_) | FieldValue::Long(_) | FieldValue::Float(_) | FieldValue::Double(_)
        )
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Long(_) => "long",
            FieldValue::Float(_) => "float",
            FieldValue::Double(_) => "double",
            FieldValue::String(_) => "string",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Timestamp(_) => "timestamp",
        }
    }

    fn family_rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) | FieldValue::Long(_) | FieldValue::Float(_) | FieldValue::Double(_) => 2,
            FieldValue::Timestamp(_) => 3,
            FieldValue::String(_) => 4,
            FieldValue::Bytes(_) => 5,
        }
    }

    /// Convert a JSON value into a field value. Arrays and objects are kept as JSON text.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Long(i),
                None => FieldValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => FieldValue::String(s),
            other => FieldValue::String(other.to_string()),
        }
    }

    /// Convert this value into JSON
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => (*b).into(),
            FieldValue::Int(v) => (*v).into(),
            FieldValue::Long(v) | FieldValue::Timestamp(v) => (*v).into(),
            FieldValue::Float(v) => serde_json::Number::from_f64(*v as f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::String(s) => s.clone().into(),
            FieldValue::Bytes(b) => b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
        }
    }
}

/// Total order over field values
///
/// Null sorts first. Numbers compare numerically across integer and floating widths,
/// strings lexically, timestamps temporally and bytes lexicographically. Values of different
/// families order by family (null, bool, number, timestamp, string, bytes).
pub fn compare_values(a: &FieldValue, b: &FieldValue) -> Ordering {
    use FieldValue::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Bool(x), Bool(y)) => x.cmp(y),
        (Int(_) | Long(_), Int(_) | Long(_)) => a.as_long().cmp(&b.as_long()),
        (x, y) if x.is_numeric() && y.is_numeric() => {
            let (x, y) = (x.as_double().unwrap_or(f64::NAN), y.as_double().unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (String(x), String(y)) => x.cmp(y),
        (Bytes(x), Bytes(y)) => x.cmp(y),
        _ => a.family_rank().cmp(&b.family_rank()),
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Long(v as i64)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for FieldValue {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        FieldValue::Timestamp(v.timestamp_micros())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => FieldValue::Null,
        }
    }
}

/// One row or document (field name -> value mapping)
pub type Record = HashMap<String, FieldValue>;

/// Build a record from `(field, value)` pairs
pub fn record<K, V, I>(fields: I) -> Record
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Convert a serializable struct into a record
///
/// The value must serialize to a JSON object. Nested arrays and objects become JSON text.
pub fn record_from_serializable<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(v)))
            .collect()),
        other => Err(BridgeError::validation(format!(
            "expected a struct-like value, got JSON {}",
            json_type_name(&other)
        ))),
    }
}

/// Convert a record back into a deserializable struct
pub fn record_into_deserializable<T: DeserializeOwned>(record: Record) -> Result<T> {
    let map: serde_json::Map<String, serde_json::Value> = record
        .into_iter()
        .map(|(k, v)| (k, v.to_json()))
        .collect();
    Ok(serde_json::from_value(serde_json::Value::Object(map))?)
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Result of one operation inside a batch or transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Void success
    Done,
    /// Number of rows or entries affected
    Affected(u64),
    /// Identifier assigned by the store
    Id(i64),
    /// Rows returned by a query
    Rows(Vec<Record>),
    /// Single scalar result
    Scalar(FieldValue),
    /// Boolean result
    Flag(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        let val = FieldValue::Int(42);
        assert_eq!(val.as_int(), Some(42));
        assert_eq!(val.as_long(), Some(42));
        assert_eq!(val.as_string(), "42");

        let val = FieldValue::String("123".to_string());
        assert_eq!(val.as_int(), Some(123));
        assert_eq!(val.as_long(), Some(123));

        let val = FieldValue::Bool(true);
        assert_eq!(val.as_bool(), Some(true));
        assert_eq!(val.as_int(), Some(1));
    }

    #[test]
    fn test_value_from_types() {
        let val: FieldValue = 42.into();
        assert_eq!(val, FieldValue::Int(42));

        let val: FieldValue = "hello".into();
        assert_eq!(val, FieldValue::String("hello".to_string()));

        let val: FieldValue = Some(42).into();
        assert_eq!(val, FieldValue::Int(42));

        let val: FieldValue = Option::<i32>::None.into();
        assert_eq!(val, FieldValue::Null);
    }

    #[test]
    fn test_compare_values_numeric_across_widths() {
        assert_eq!(
            compare_values(&FieldValue::Int(10), &FieldValue::Long(20)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&FieldValue::Double(20.0), &FieldValue::Long(20)),
            Ordering::Equal
        );
        assert_eq!(
            compare_values(&FieldValue::Null, &FieldValue::Int(0)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&"b".into(), &"a".into()),
            Ordering::Greater
        );
    }

    #[test]
    fn test_timestamp_roundtrip_through_chrono() {
        let now = chrono::DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let val: FieldValue = now.into();
        assert_eq!(val.as_datetime(), Some(now));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: i64,
        nickname: Option<String>,
    }

    #[test]
    fn test_record_struct_roundtrip() {
        let person = Person {
            name: "Ada".into(),
            age: 36,
            nickname: None,
        };
        let rec = record_from_serializable(&person).unwrap();
        assert_eq!(rec.get("age"), Some(&FieldValue::Long(36)));
        assert_eq!(rec.get("nickname"), Some(&FieldValue::Null));

        let back: Person = record_into_deserializable(rec).unwrap();
        assert_eq!(back, person);
    }

    #[test]
    fn test_record_from_non_object_is_rejected() {
        let err = record_from_serializable(&5).unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Validation);
    }
}
