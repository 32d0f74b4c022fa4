//! Common types used across the harvest pipeline

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Subjects
// ============================================================================

/// An entity considered for harvesting (e.g. a user).
///
/// `id` is the stable sort and resume key; `label` is only used for
/// diagnostics and for resolving a human-supplied resume point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub label: String,
}

impl Subject {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

/// Ordered batch of subjects handed to one harvesting pass
pub type WorkChunk = Vec<Subject>;

// ============================================================================
// Raw payloads
// ============================================================================

/// Failure to read a field out of a [`RawPayload`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("missing required field '{field}'")]
    Missing { field: String },

    #[error("field '{field}' is not a valid {expected}")]
    Malformed {
        field: String,
        expected: &'static str,
    },
}

impl PayloadError {
    pub fn missing(field: &str) -> Self {
        Self::Missing {
            field: field.to_string(),
        }
    }

    pub fn malformed(field: &str, expected: &'static str) -> Self {
        Self::Malformed {
            field: field.to_string(),
            expected,
        }
    }
}

/// Opaque JSON object as returned by the remote API.
///
/// The pipeline only counts payloads and reads the cursor field; normalizers
/// use the typed accessors. `get_*` accessors treat `null` as missing, `opt_*`
/// accessors return `None` for missing or `null` values and still reject a
/// value of the wrong type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(Map<String, Value>);

impl RawPayload {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// Pagination cursor taken from `field`; numeric ids are stringified.
    pub fn cursor(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get_str(&self, field: &str) -> Result<&str, PayloadError> {
        self.opt_str(field)?
            .ok_or_else(|| PayloadError::missing(field))
    }

    pub fn opt_str(&self, field: &str) -> Result<Option<&str>, PayloadError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(PayloadError::malformed(field, "string")),
        }
    }

    pub fn get_f64(&self, field: &str) -> Result<f64, PayloadError> {
        self.opt_f64(field)?
            .ok_or_else(|| PayloadError::missing(field))
    }

    pub fn opt_f64(&self, field: &str) -> Result<Option<f64>, PayloadError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| PayloadError::malformed(field, "number")),
        }
    }

    pub fn opt_i64(&self, field: &str) -> Result<Option<i64>, PayloadError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| PayloadError::malformed(field, "integer")),
        }
    }

    pub fn get_bool(&self, field: &str) -> Result<bool, PayloadError> {
        self.opt_bool(field)?
            .ok_or_else(|| PayloadError::missing(field))
    }

    pub fn opt_bool(&self, field: &str) -> Result<Option<bool>, PayloadError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(PayloadError::malformed(field, "boolean")),
        }
    }

    /// Timestamp stored as epoch milliseconds
    pub fn get_timestamp(&self, field: &str) -> Result<DateTime<Utc>, PayloadError> {
        self.opt_timestamp(field)?
            .ok_or_else(|| PayloadError::missing(field))
    }

    pub fn opt_timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>, PayloadError> {
        let Some(millis) = self.opt_f64(field).map_err(|_| {
            PayloadError::malformed(field, "epoch-millisecond timestamp")
        })?
        else {
            return Ok(None);
        };

        Utc.timestamp_millis_opt(millis as i64)
            .single()
            .map(Some)
            .ok_or_else(|| PayloadError::malformed(field, "epoch-millisecond timestamp"))
    }

    pub fn get_object(&self, field: &str) -> Result<&Map<String, Value>, PayloadError> {
        self.opt_object(field)?
            .ok_or_else(|| PayloadError::missing(field))
    }

    pub fn opt_object(&self, field: &str) -> Result<Option<&Map<String, Value>>, PayloadError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(PayloadError::malformed(field, "object")),
        }
    }
}

impl From<Map<String, Value>> for RawPayload {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

// ============================================================================
// Normalized records
// ============================================================================

/// Scalar or JSON value of one normalized column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl FieldValue {
    /// Whether this value can be bound to a column of type `ty`
    pub fn fits(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (FieldValue::Null, _)
                | (FieldValue::Text(_), ColumnType::Text)
                | (FieldValue::Integer(_), ColumnType::BigInt | ColumnType::Double)
                | (FieldValue::Float(_), ColumnType::Double)
                | (FieldValue::Bool(_), ColumnType::Boolean)
                | (FieldValue::Timestamp(_), ColumnType::Timestamp)
                | (FieldValue::Json(_), ColumnType::Jsonb)
        )
    }
}

macro_rules! impl_field_value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                FieldValue::$variant(v.into())
            }
        }
    };
}

impl_field_value_from!(String, Text);
impl_field_value_from!(&str, Text);
impl_field_value_from!(i64, Integer);
impl_field_value_from!(i32, Integer);
impl_field_value_from!(f64, Float);
impl_field_value_from!(bool, Bool);
impl_field_value_from!(DateTime<Utc>, Timestamp);
impl_field_value_from!(Value, Json);

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// A record ready for upsert: a mandatory unique `id` plus named columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    id: String,
    fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Value of a non-key column; absent columns read as `Null`
    pub fn get(&self, column: &str) -> &FieldValue {
        self.fields.get(column).unwrap_or(&FieldValue::Null)
    }

    /// Number of fields including the id
    pub fn field_count(&self) -> usize {
        self.fields.len() + 1
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// ============================================================================
// Table schemas
// ============================================================================

/// Storage type of a column in a target table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Jsonb,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Text => write!(f, "text"),
            ColumnType::BigInt => write!(f, "bigint"),
            ColumnType::Double => write!(f, "double precision"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Timestamp => write!(f, "timestamptz"),
            ColumnType::Jsonb => write!(f, "jsonb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

/// Upsert target: a text primary key column plus typed data columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub key: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
        });
        self
    }

    /// Total columns bound per row, key included
    pub fn column_count(&self) -> usize {
        self.columns.len() + 1
    }

    /// First column whose value type does not match the record's value
    pub fn find_mismatch<'a>(&'a self, record: &NormalizedRecord) -> Option<&'a ColumnDef> {
        self.columns.iter().find(|c| !record.get(&c.name).fits(c.ty))
    }
}
