//! Schema-shaped records: a closed set of value variants keyed by validated field name.

use crate::error::{EngineError, ValidationReport};
use crate::schema::{FieldType, ResourceSchema};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Record(Record),
    List(Vec<Value>),
    /// Opaque document for `json` columns; never decomposed into records or lists.
    Json(Json),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Lookup key for scalar values (used to match foreign keys to primary keys). None for null and composites.
    pub fn key(&self) -> Option<String> {
        match self {
            Value::Null | Value::Record(_) | Value::List(_) | Value::Json(_) => None,
            other => Some(other.to_string()),
        }
    }

    /// Untyped conversion: objects become records, arrays become lists.
    pub fn from_json(v: &Json) -> Value {
        match v {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Typed conversion for one field. Err carries a human-readable reason.
    pub fn coerce(field_type: FieldType, v: &Json) -> Result<Value, String> {
        if v.is_null() {
            return Ok(Value::Null);
        }
        match field_type {
            FieldType::String | FieldType::Text => v
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .ok_or_else(|| "must be a string".to_string()),
            FieldType::Integer | FieldType::BigInt => v
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| "must be an integer".to_string()),
            FieldType::Float => v
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| "must be a number".to_string()),
            FieldType::Boolean => v
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| "must be a boolean".to_string()),
            FieldType::Timestamp => v
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| Value::Timestamp(d.with_timezone(&Utc)))
                .ok_or_else(|| "must be an RFC 3339 timestamp".to_string()),
            FieldType::Date => v
                .as_str()
                .filter(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
                .map(|s| Value::Text(s.to_string()))
                .ok_or_else(|| "must be a date (YYYY-MM-DD)".to_string()),
            FieldType::Uuid => v
                .as_str()
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(Value::Uuid)
                .ok_or_else(|| "must be a UUID".to_string()),
            FieldType::Json => Ok(Value::Json(v.clone())),
        }
    }

    /// Fit an already-typed value to a column: uuid/timestamp/date strings are parsed and
    /// integers widen to floats. Anything else must already match.
    pub fn conform(self, field_type: FieldType) -> Result<Value, String> {
        match (field_type, self) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldType::Json, v @ Value::Json(_)) => Ok(v),
            (FieldType::Json, v) => Ok(Value::Json(v.to_json())),
            (FieldType::String | FieldType::Text, v @ Value::Text(_)) => Ok(v),
            (FieldType::Integer | FieldType::BigInt, v @ Value::Int(_)) => Ok(v),
            (FieldType::Float, Value::Int(n)) => Ok(Value::Float(n as f64)),
            (FieldType::Float, v @ Value::Float(_)) => Ok(v),
            (FieldType::Boolean, v @ Value::Bool(_)) => Ok(v),
            (FieldType::Timestamp, v @ Value::Timestamp(_)) => Ok(v),
            (FieldType::Uuid, v @ Value::Uuid(_)) => Ok(v),
            (FieldType::Date, Value::Timestamp(t)) => Ok(Value::Text(t.date_naive().to_string())),
            (FieldType::Timestamp | FieldType::Date | FieldType::Uuid, Value::Text(s)) => {
                Value::coerce(field_type, &Json::String(s))
            }
            (_, v) => Err(format!("{} does not match type {:?}", v, field_type)),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::Number((*n).into()),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Timestamp(d) => Json::String(d.to_rfc3339()),
            Value::Uuid(u) => Json::String(u.to_string()),
            Value::Record(r) => r.to_json(),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Json(j) => j.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::Timestamp(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Record(_) | Value::List(_) => write!(f, "{}", self.to_json()),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Timestamp(d)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(u: uuid::Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Field values keyed by name, ordered for deterministic output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Record(BTreeMap::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Builder-style [`Record::set`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Boundary conversion: rejects keys the schema does not declare and coerces values by field type.
    /// Type mismatches are aggregated into one validation report.
    pub fn from_json(schema: &ResourceSchema, v: &Json) -> Result<Record, EngineError> {
        let Json::Object(map) = v else {
            return Err(EngineError::QueryBuild(format!(
                "{} record must be a JSON object",
                schema.name
            )));
        };
        let mut record = Record::new();
        let mut report = ValidationReport::new();
        for (key, raw) in map {
            let Some(field) = schema.field(key) else {
                return Err(EngineError::UnknownField {
                    resource: schema.name.clone(),
                    field: key.clone(),
                });
            };
            match Value::coerce(field.field_type, raw) {
                Ok(value) => {
                    record.set(key.clone(), value);
                }
                Err(reason) => report.add(key, "type", format!("{} {}", key, reason)),
            }
        }
        report.into_result()?;
        Ok(record)
    }

    pub fn to_json(&self) -> Json {
        Json::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
