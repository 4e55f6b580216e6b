use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ID_KEY: &str = "id";
pub const CREATED_AT_KEY: &str = "createdAt";
pub const CLASSIFICATION_KEY: &str = "nsfwLevel";
pub const META_KEY: &str = "meta";

/// One remote item, kept as the raw JSON object so that unknown keys survive the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

/// Stable identifier of a record or scope. Numbers and strings are both accepted upstream, so
/// they are normalized to their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl Record {
    /// Returns `None` when `value` is not a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Record(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn id(&self) -> Option<RecordId> {
        self.get(ID_KEY).and_then(RecordId::from_value)
    }

    /// Creation time, or `None` when the field is absent or not a timestamp.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.get(CREATED_AT_KEY)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Classification in its textual form; numeric levels are rendered as their decimal value.
    pub fn classification(&self) -> Option<String> {
        match self.get(CLASSIFICATION_KEY)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The generation metadata mapping. Some exports wrap it twice (`meta.meta`).
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        let meta = self.get(META_KEY)?.as_object()?;
        match meta.get(META_KEY) {
            Some(Value::Object(inner)) => Some(inner),
            _ => Some(meta),
        }
    }

    /// Serializes the record as a single NDJSON line, newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(&self.0)?;
        line.push('\n');
        Ok(line)
    }
}

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RecordId(n.to_string())),
            Value::String(s) if !s.trim().is_empty() => Some(RecordId(s.trim().to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        RecordId(value.to_string())
    }
}

/// Accepts RFC 3339 (`2024-08-15T10:00:00.000Z`) and, failing that, an offset-less ISO 8601
/// timestamp which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Accept predicate: whitelist of classification levels.
#[derive(Debug, Clone, Default)]
pub struct ClassificationFilter {
    /// `None` accepts every record, classified or not.
    levels: Option<HashSet<String>>,
}

impl ClassificationFilter {
    pub fn new<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClassificationFilter {
            levels: Some(levels.into_iter().map(Into::into).collect()),
        }
    }

    pub fn any() -> Self {
        ClassificationFilter { levels: None }
    }

    pub fn accepts(&self, record: &Record) -> bool {
        match &self.levels {
            None => true,
            Some(levels) => record
                .classification()
                .is_some_and(|level| levels.contains(&level)),
        }
    }
}
