//! Raw value coercion and record-level validation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use isla_core::{iso_instant, RawRecord, SilverRecord, SilverValue};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::names::normalize_for_matching;
use crate::schema::{DatasetDescriptor, FieldKind, FieldSpec};

const TRUE_TOKENS: [&str; 7] = ["sí", "si", "s", "true", "verdadero", "1", "yes"];
const FALSE_TOKENS: [&str; 5] = ["no", "n", "false", "falso", "0"];
const NULL_TOKENS: [&str; 3] = ["", "null", "NULL"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];
const POSTAL_CODE_MAX_CHARS: usize = 10;

/// Why a raw row did not become a silver record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("required field {field} is empty")]
    MissingRequired { field: String },
    #[error("{field} value {value:?} is not an allowed value")]
    NotInEnumeration { field: String, value: String },
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: String, value: f64 },
    #[error("{field} date {value} is outside the target period")]
    OutsidePeriod { field: String, value: String },
}

impl Rejection {
    /// Stable counter key.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MissingRequired { .. } => "missing_required",
            Rejection::NotInEnumeration { .. } => "not_in_enumeration",
            Rejection::OutOfRange { .. } => "out_of_range",
            Rejection::OutsidePeriod { .. } => "outside_period",
        }
    }
}

/// Trimmed text; `None` for null and blank values. Scalars are stringified.
pub fn normalize_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub fn normalize_numeric(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if NULL_TOKENS.contains(&trimmed) {
                return None;
            }
            if trimmed.contains(',') && !trimmed.contains('.') {
                trimmed.replace(',', ".").parse::<f64>().ok()
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Like [`normalize_numeric`], floored to an integer.
pub fn normalize_integer(value: &JsonValue) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let floored = normalize_numeric(value)?.floor();
    (floored >= i64::MIN as f64 && floored <= i64::MAX as f64).then_some(floored as i64)
}

/// Absolute instant for a date-like value. Numbers are epoch milliseconds;
/// dates without a time are midnight UTC.
pub fn parse_instant(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        JsonValue::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return None;
            }
            if let Ok(at) = DateTime::parse_from_rfc3339(text) {
                return Some(at.with_timezone(&Utc));
            }
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
                .or_else(|| {
                    DATE_FORMATS
                        .iter()
                        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

/// Canonical ISO-8601 instant string, or `None` when unparseable.
pub fn normalize_date(value: &JsonValue) -> Option<String> {
    parse_instant(value).map(|at| iso_instant(&at))
}

pub fn normalize_postal_code(value: &JsonValue) -> Option<String> {
    normalize_string(value).map(|code| code.chars().take(POSTAL_CODE_MAX_CHARS).collect())
}

/// Spanish and English yes/no tokens, case-insensitive.
pub fn parse_boolean(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        JsonValue::String(s) => {
            let token = s.trim().to_lowercase();
            if TRUE_TOKENS.contains(&token.as_str()) {
                Some(true)
            } else if FALSE_TOKENS.contains(&token.as_str()) {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// First non-null value among `keys`, exact match first, then ignoring case.
pub fn lookup_raw<'a>(raw: &'a RawRecord, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .find_map(|key| raw.get(*key).filter(|v| !v.is_null()))
        .or_else(|| {
            keys.iter().find_map(|key| {
                raw.iter()
                    .find(|(name, value)| name.trim().eq_ignore_ascii_case(key) && !value.is_null())
                    .map(|(_, value)| value)
            })
        })
}

fn coerce(kind: FieldKind, value: &JsonValue) -> SilverValue {
    match kind {
        FieldKind::Text => normalize_string(value).into(),
        FieldKind::Integer => normalize_integer(value).into(),
        FieldKind::Numeric => normalize_numeric(value).into(),
        FieldKind::Boolean => parse_boolean(value).into(),
        FieldKind::Date => parse_instant(value).into(),
        FieldKind::PostalCode => normalize_postal_code(value).into(),
    }
}

fn check_domain(field: &FieldSpec, value: SilverValue) -> Result<SilverValue, Rejection> {
    if !field.allowed.is_empty() {
        if let Some(text) = value.as_text() {
            let wanted = normalize_for_matching(text);
            return field
                .allowed
                .iter()
                .find(|allowed| normalize_for_matching(allowed) == wanted)
                .map(|allowed| SilverValue::Text(allowed.clone()))
                .ok_or_else(|| Rejection::NotInEnumeration {
                    field: field.name.clone(),
                    value: text.to_string(),
                });
        }
    }
    if let (Some(range), Some(number)) = (field.range, value.as_f64()) {
        if !range.contains(number) {
            return Err(Rejection::OutOfRange {
                field: field.name.clone(),
                value: number,
            });
        }
    }
    if let (Some(period), SilverValue::Timestamp(at)) = (field.period, &value) {
        if !period.contains(at.date_naive()) {
            return Err(Rejection::OutsidePeriod {
                field: field.name.clone(),
                value: iso_instant(at),
            });
        }
    }
    Ok(value)
}

/// Project one raw row onto the dataset's declared fields.
///
/// The municipality code is left empty; name resolution fills it later.
pub fn normalize_record(
    descriptor: &DatasetDescriptor,
    resource_id: &str,
    raw: &RawRecord,
) -> Result<SilverRecord, Rejection> {
    let mut record = SilverRecord::new(&descriptor.id, resource_id);

    let municipality_keys: Vec<&str> = descriptor.municipality.source.iter().map(String::as_str).collect();
    record.municipality_name = lookup_raw(raw, &municipality_keys).and_then(normalize_string);
    if record.municipality_name.is_none() {
        return Err(Rejection::MissingRequired {
            field: descriptor.municipality.source[0].clone(),
        });
    }

    for field in &descriptor.fields {
        let value = lookup_raw(raw, &field.source_keys())
            .map(|v| coerce(field.kind, v))
            .unwrap_or(SilverValue::Null);
        let value = if value.is_null() {
            if field.required {
                return Err(Rejection::MissingRequired {
                    field: field.name.clone(),
                });
            }
            value
        } else {
            check_domain(field, value)?
        };
        record.fields.insert(field.name.clone(), value);
    }
    Ok(record)
}
