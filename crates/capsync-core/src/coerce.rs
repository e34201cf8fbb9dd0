//! Field coercion for the loosely typed values the market feed emits.
//!
//! Every function here is pure: a record is fully coerced before any write is
//! attempted, so a coercion failure never leaves a half-updated row behind.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::SyncError;

/// Reduces an ISO-8601 timestamp (or bare date) to a calendar date.
///
/// A trailing `Z` is rewritten to an explicit `+00:00` offset before parsing.
/// Absent, null and blank inputs yield `Ok(None)`; anything else that does not
/// parse is a malformed payload.
pub fn normalize_iso_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, SyncError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    let explicit = match raw.strip_suffix('Z') {
        Some(stem) => format!("{stem}+00:00"),
        None => raw.to_string(),
    };

    if let Ok(stamp) = DateTime::parse_from_rfc3339(&explicit) {
        return Ok(Some(stamp.date_naive()));
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(&explicit, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Some(stamp.date()));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&explicit, "%Y-%m-%d") {
        return Ok(Some(date));
    }

    Err(SyncError::MalformedPayload(format!(
        "{field}: unparseable date {raw:?}"
    )))
}

/// Truthiness as the feed encodes it. Null and empty string are false.
pub fn coerce_flag(field: &'static str, value: &Value) -> Result<bool, SyncError> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => Ok(number.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" | "n" => Ok(false),
            "1" | "true" | "yes" | "y" => Ok(true),
            other => Err(coercion(field, format!("not a flag: {other:?}"))),
        },
        other => Err(coercion(field, format!("not a flag: {other}"))),
    }
}

pub fn coerce_f64(field: &'static str, value: &Value) -> Result<Option<f64>, SyncError> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(number) => number.as_f64(),
        Value::String(text) if text.trim().is_empty() => return Ok(None),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(number) if number.is_finite() => Ok(Some(number)),
        _ => Err(coercion(field, format!("not a number: {value}"))),
    }
}

pub fn coerce_i64(field: &'static str, value: &Value) -> Result<Option<i64>, SyncError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(integral))
            .map(Some)
            .ok_or_else(|| coercion(field, format!("not an integer: {number}"))),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(integral))
                .map(Some)
                .ok_or_else(|| coercion(field, format!("not an integer: {text:?}")))
        }
        other => Err(coercion(field, format!("not an integer: {other}"))),
    }
}

/// Narrowing variant used for `INTEGER` columns.
pub fn coerce_i32(field: &'static str, value: &Value) -> Result<Option<i32>, SyncError> {
    match coerce_i64(field, value)? {
        None => Ok(None),
        Some(wide) => i32::try_from(wide)
            .map(Some)
            .map_err(|_| coercion(field, format!("out of range: {wide}"))),
    }
}

/// Free-form note fields: strings pass through, structured values are kept as
/// their JSON text.
pub fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Comma-joins a list value; a null or empty list stores nothing.
pub fn join_list(values: Option<&[String]>) -> Option<String> {
    values
        .filter(|values| !values.is_empty())
        .map(|values| values.join(","))
}

fn integral(number: f64) -> Option<i64> {
    (number.is_finite() && number.fract() == 0.0 && number.abs() < i64::MAX as f64)
        .then_some(number as i64)
}

fn coercion(field: &'static str, reason: String) -> SyncError {
    SyncError::FieldCoercion { field, reason }
}
