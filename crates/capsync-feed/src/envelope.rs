use std::collections::BTreeMap;

use capsync_core::EndpointFamily;
use serde::Deserialize;
use serde_json::Value;

use crate::FeedError;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<EnvelopeStatus>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct EnvelopeStatus {
    #[serde(default)]
    error_code: Value,
    #[serde(default)]
    error_message: Option<String>,
}

impl EnvelopeStatus {
    fn code(&self) -> i64 {
        match &self.error_code {
            Value::Number(number) => number.as_i64().unwrap_or(-1),
            Value::String(text) => text.trim().parse().unwrap_or(-1),
            _ => 0,
        }
    }
}

/// Unwraps `{status: {error_code, error_message}, data}`. A non-zero
/// `error_code` is a provider status error; a missing or null `data` is
/// malformed.
pub fn parse_envelope(family: EndpointFamily, body: &[u8]) -> Result<Value, FeedError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|err| FeedError::Malformed {
        family,
        reason: err.to_string(),
    })?;

    if let Some(status) = &envelope.status {
        let code = status.code();
        if code != 0 {
            return Err(FeedError::Status {
                code,
                message: status.error_message.clone().unwrap_or_default(),
            });
        }
    }

    if envelope.data.is_null() {
        return Err(FeedError::Malformed {
            family,
            reason: "envelope has no data".into(),
        });
    }
    Ok(envelope.data)
}

pub(crate) fn into_records(family: EndpointFamily, data: Value) -> Result<Vec<Value>, FeedError> {
    match data {
        Value::Array(records) => Ok(records),
        other => Err(FeedError::Malformed {
            family,
            reason: format!("expected an array of records, got {}", kind(&other)),
        }),
    }
}

pub(crate) fn into_keyed_records(
    family: EndpointFamily,
    data: Value,
) -> Result<BTreeMap<String, Value>, FeedError> {
    match data {
        Value::Object(records) => Ok(records.into_iter().collect()),
        other => Err(FeedError::Malformed {
            family,
            reason: format!("expected records keyed by id, got {}", kind(&other)),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
