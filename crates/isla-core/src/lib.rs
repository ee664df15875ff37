//! Core domain model for the ISLA medallion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "isla-core";

/// Untyped key/value row exactly as a source delivered it.
pub type RawRecord = Map<String, JsonValue>;

/// Column/value row handed to the persistence layer.
pub type Row = Map<String, JsonValue>;

pub const COL_SOURCE_DATASET_ID: &str = "source_dataset_id";
pub const COL_SOURCE_RESOURCE_ID: &str = "source_resource_id";
pub const COL_MUNICIPALITY_NAME: &str = "municipality_name";
pub const COL_MUNICIPALITY_NORMALIZED: &str = "municipality_normalized";
pub const COL_MUNICIPALITY_CODE: &str = "municipality_code";
pub const COL_RECORD_COUNT: &str = "record_count";

/// Silver columns every dataset carries regardless of its declared fields.
pub const BUILTIN_SILVER_COLUMNS: [&str; 5] = [
    COL_SOURCE_DATASET_ID,
    COL_SOURCE_RESOURCE_ID,
    COL_MUNICIPALITY_NAME,
    COL_MUNICIPALITY_NORMALIZED,
    COL_MUNICIPALITY_CODE,
];

/// ISO-8601 instant with millisecond precision and a `Z` suffix.
pub fn iso_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Verbatim archival copy of one raw row, tagged with provenance. Insert-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BronzeRecord {
    pub source_dataset_id: String,
    pub source_resource_id: String,
    pub run_id: Uuid,
    pub ingested_at: DateTime<Utc>,
    pub raw_row: RawRecord,
}

impl BronzeRecord {
    pub fn new(
        source_dataset_id: impl Into<String>,
        source_resource_id: impl Into<String>,
        run_id: Uuid,
        raw_row: RawRecord,
    ) -> Self {
        Self {
            source_dataset_id: source_dataset_id.into(),
            source_resource_id: source_resource_id.into(),
            run_id,
            ingested_at: Utc::now(),
            raw_row,
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(
            COL_SOURCE_DATASET_ID.to_string(),
            JsonValue::String(self.source_dataset_id.clone()),
        );
        row.insert(
            COL_SOURCE_RESOURCE_ID.to_string(),
            JsonValue::String(self.source_resource_id.clone()),
        );
        row.insert("run_id".to_string(), JsonValue::String(self.run_id.to_string()));
        row.insert(
            "ingested_at".to_string(),
            JsonValue::String(iso_instant(&self.ingested_at)),
        );
        row.insert("raw_row".to_string(), JsonValue::Object(self.raw_row.clone()));
        row
    }
}

/// Typed, nullable value of a declared silver field.
#[derive(Debug, Clone, PartialEq)]
pub enum SilverValue {
    Null,
    Text(String),
    Integer(i64),
    Numeric(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl SilverValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SilverValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SilverValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SilverValue::Integer(v) => Some(*v as f64),
            SilverValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            SilverValue::Null => JsonValue::Null,
            SilverValue::Text(s) => JsonValue::String(s.clone()),
            SilverValue::Integer(v) => JsonValue::from(*v),
            SilverValue::Numeric(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SilverValue::Boolean(v) => JsonValue::Bool(*v),
            SilverValue::Timestamp(at) => JsonValue::String(iso_instant(at)),
        }
    }
}

impl<T: Into<SilverValue>> From<Option<T>> for SilverValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SilverValue::Null)
    }
}

impl From<String> for SilverValue {
    fn from(value: String) -> Self {
        SilverValue::Text(value)
    }
}

impl From<i64> for SilverValue {
    fn from(value: i64) -> Self {
        SilverValue::Integer(value)
    }
}

impl From<f64> for SilverValue {
    fn from(value: f64) -> Self {
        SilverValue::Numeric(value)
    }
}

impl From<bool> for SilverValue {
    fn from(value: bool) -> Self {
        SilverValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for SilverValue {
    fn from(value: DateTime<Utc>) -> Self {
        SilverValue::Timestamp(value)
    }
}

impl Serialize for SilverValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Typed, validated projection of a bronze row.
///
/// `fields` only ever holds the fields a dataset declares; nothing from the raw
/// row is carried over implicitly. `municipality_code` starts empty and is
/// filled by name resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SilverRecord {
    pub source_dataset_id: String,
    pub source_resource_id: String,
    pub municipality_name: Option<String>,
    pub municipality_normalized: Option<String>,
    pub municipality_code: Option<String>,
    pub fields: BTreeMap<String, SilverValue>,
}

impl SilverRecord {
    pub fn new(source_dataset_id: impl Into<String>, source_resource_id: impl Into<String>) -> Self {
        Self {
            source_dataset_id: source_dataset_id.into(),
            source_resource_id: source_resource_id.into(),
            municipality_name: None,
            municipality_normalized: None,
            municipality_code: None,
            fields: BTreeMap::new(),
        }
    }

    /// Value of a built-in column or declared field as JSON.
    pub fn column(&self, name: &str) -> JsonValue {
        let text = |v: &Option<String>| v.clone().map(JsonValue::String).unwrap_or(JsonValue::Null);
        match name {
            COL_SOURCE_DATASET_ID => JsonValue::String(self.source_dataset_id.clone()),
            COL_SOURCE_RESOURCE_ID => JsonValue::String(self.source_resource_id.clone()),
            COL_MUNICIPALITY_NAME => text(&self.municipality_name),
            COL_MUNICIPALITY_NORMALIZED => text(&self.municipality_normalized),
            COL_MUNICIPALITY_CODE => text(&self.municipality_code),
            other => self
                .fields
                .get(other)
                .map(SilverValue::to_json)
                .unwrap_or(JsonValue::Null),
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        for column in BUILTIN_SILVER_COLUMNS {
            row.insert(column.to_string(), self.column(column));
        }
        for (name, value) in &self.fields {
            row.insert(name.clone(), value.to_json());
        }
        row
    }
}

/// Aggregate row keyed by municipality plus grouping dimensions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRecord {
    pub municipality_code: String,
    pub dimensions: BTreeMap<String, JsonValue>,
    pub record_count: i64,
    pub sums: BTreeMap<String, f64>,
}

impl FactRecord {
    pub fn sum_column(measure: &str) -> String {
        format!("sum_{measure}")
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(
            COL_MUNICIPALITY_CODE.to_string(),
            JsonValue::String(self.municipality_code.clone()),
        );
        for (name, value) in &self.dimensions {
            row.insert(name.clone(), value.clone());
        }
        row.insert(COL_RECORD_COUNT.to_string(), JsonValue::from(self.record_count));
        for (measure, sum) in &self.sums {
            row.insert(
                Self::sum_column(measure),
                serde_json::Number::from_f64(*sum)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
            );
        }
        row
    }
}

/// One entry of the authoritative municipality registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MunicipalityEntry {
    pub code: String,
    pub canonical_name: String,
}

impl MunicipalityEntry {
    pub fn new(code: impl Into<String>, canonical_name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            canonical_name: canonical_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

macro_rules! status_strings {
    ($ty:ident) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $ty::Running => "running",
                    $ty::Completed => "completed",
                    $ty::Failed => "failed",
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    "running" => Ok($ty::Running),
                    "completed" => Ok($ty::Completed),
                    "failed" => Ok($ty::Failed),
                    other => Err(format!("unknown status `{other}`")),
                }
            }
        }
    };
}

status_strings!(RunStatus);
status_strings!(StepStatus);

/// One pipeline execution. Opened as `running`, closed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: JsonValue,
}

impl Run {
    pub fn start(pipeline_name: impl Into<String>, metadata: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            metadata,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds())
    }
}

/// One phase of a run. Ordering is creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Step {
    pub fn start(run_id: Uuid, step_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_name: step_name.into(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            error_message: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds())
    }
}
