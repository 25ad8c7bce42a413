//! The persisted, schema-stable document shape.
//!
//! Every document carries an identifier plus four connector metadata fields
//! (`ingestion_timestamp`, `etl_version`, `source_api`, `raw_data`) on top of
//! whatever the source family defines.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::TransformError;

/// Name of the identifier field in serialised documents.
pub const ID_FIELD: &str = "_id";

/// Field names owned by the connector; source fields may not shadow them.
pub const RESERVED_FIELDS: [&str; 5] = [
    ID_FIELD,
    "ingestion_timestamp",
    "etl_version",
    "source_api",
    "raw_data",
];

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedDocument {
    id: String,
    fields: Map<String, Value>,
    ingestion_timestamp: DateTime<Utc>,
    etl_version: String,
    source_api: String,
    raw_data: Value,
}

impl NormalizedDocument {
    /// Build a document. Fails when `id` is empty or only whitespace.
    pub fn new(
        id: impl Into<String>,
        source_api: impl Into<String>,
        etl_version: impl Into<String>,
        ingestion_timestamp: DateTime<Utc>,
        raw_data: Value,
    ) -> Result<Self, TransformError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TransformError::EmptyId);
        }
        Ok(Self {
            id,
            fields: Map::new(),
            ingestion_timestamp,
            etl_version: etl_version.into(),
            source_api: source_api.into(),
            raw_data,
        })
    }

    /// Add a source-defined field. Reserved connector fields are left untouched.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns `false` if `key` is reserved and the value was dropped.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if RESERVED_FIELDS.contains(&key.as_str()) {
            return false;
        }
        self.fields.insert(key, value.into());
        true
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn ingestion_timestamp(&self) -> DateTime<Utc> {
        self.ingestion_timestamp
    }

    pub fn etl_version(&self) -> &str {
        &self.etl_version
    }

    pub fn source_api(&self) -> &str {
        &self.source_api
    }

    pub fn raw_data(&self) -> &Value {
        &self.raw_data
    }

    /// Flat JSON object: `_id`, source fields, then connector metadata.
    pub fn to_json(&self) -> Value {
        let mut out = Map::with_capacity(self.fields.len() + RESERVED_FIELDS.len());
        out.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        out.insert(
            "ingestion_timestamp".to_string(),
            Value::String(iso_timestamp(self.ingestion_timestamp)),
        );
        out.insert("etl_version".to_string(), Value::String(self.etl_version.clone()));
        out.insert("source_api".to_string(), Value::String(self.source_api.clone()));
        out.insert("raw_data".to_string(), self.raw_data.clone());
        Value::Object(out)
    }

    /// Inverse of [`to_json`](Self::to_json), used when reading documents back from a store.
    pub fn from_json(value: Value) -> Result<Self, TransformError> {
        let Value::Object(mut map) = value else {
            return Err(TransformError::Malformed("document is not an object".to_string()));
        };

        let id = take_string(&mut map, ID_FIELD)?;
        let ts = take_string(&mut map, "ingestion_timestamp")?;
        let ingestion_timestamp = DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TransformError::Malformed(format!("ingestion_timestamp: {e}")))?;
        let etl_version = take_string(&mut map, "etl_version")?;
        let source_api = take_string(&mut map, "source_api")?;
        let raw_data = map.remove("raw_data").unwrap_or(Value::Null);

        let mut doc = Self::new(id, source_api, etl_version, ingestion_timestamp, raw_data)?;
        doc.fields = map;
        Ok(doc)
    }
}

/// ISO-8601 UTC with microsecond precision, e.g. `2025-01-31T09:15:02.123456+00:00`.
pub fn iso_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Result<String, TransformError> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(TransformError::Malformed(format!(
            "`{key}` should be a string, got {other}"
        ))),
        None => Err(TransformError::Malformed(format!("missing `{key}`"))),
    }
}
