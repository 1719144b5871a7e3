//! Conversion of gateway payloads into `DataPoint`s.
//!
//! Gateways publish one message per reading round:
//!
//! ```json
//! { "timestamp": 1718000000, "gw": { ... },
//!   "machines": [ { "position": [ { "detail": { "machine_id": 18260, "temperature": 30.2, "command_id": "c-1" } } ] } ] }
//! ```
//!
//! Every machine yields one point built from the detail of its first position.
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use ingest_common::point::DataPoint;
use ingest_common::query::{COMMAND_ID_FIELD, TEMPERATURE_FIELD};

pub const MACHINE_ID_TAG: &str = "machine_id";

/// A payload that can never be turned into points.
#[derive(Error, Debug)]
pub enum MalformedPayload {
    #[error("payload is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Default, PartialEq)]
pub struct Normalized {
    pub points: Vec<DataPoint>,
    /// Machines skipped for lack of a usable detail record.
    pub rejected: usize,
}

pub fn normalize(
    body: &str,
    measurement: &str,
    received_at: DateTime<Utc>,
) -> Result<Normalized, MalformedPayload> {
    let payload: Value = serde_json::from_str(body)?;
    let Value::Object(payload) = payload else {
        return Err(MalformedPayload::NotAnObject);
    };

    let timestamp = payload_timestamp(&payload).unwrap_or(received_at);
    let mut normalized = Normalized::default();

    let Some(machines) = payload.get("machines").and_then(Value::as_array) else {
        return Ok(normalized);
    };

    for machine in machines {
        match machine_point(machine, measurement, timestamp) {
            Some(point) => normalized.points.push(point),
            None => normalized.rejected += 1,
        }
    }

    Ok(normalized)
}

/// The body timestamp is in unix seconds, possibly fractional.
fn payload_timestamp(payload: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let seconds = payload.get("timestamp")?.as_f64()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    let millis = (seconds * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

fn machine_point(machine: &Value, measurement: &str, timestamp: DateTime<Utc>) -> Option<DataPoint> {
    let detail = machine.pointer("/position/0/detail")?.as_object()?;
    let temperature = detail.get(TEMPERATURE_FIELD)?.as_f64()?;

    let point = DataPoint::new(measurement, timestamp)
        .tag(MACHINE_ID_TAG, &scalar_string(detail.get(MACHINE_ID_TAG)))
        .field(TEMPERATURE_FIELD, temperature)
        .field(COMMAND_ID_FIELD, scalar_string(detail.get(COMMAND_ID_FIELD)));

    point.validate().ok()?;
    Some(point)
}

/// Strings as is, numbers and booleans rendered, anything else empty.
fn scalar_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}
