use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use ingest_common::point::{DataPoint, FieldValue};

use crate::error::ApiError;

use super::query::parse_time;
use super::AppState;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SuccessResponse {
    pub success: bool,
}

/// A single point written straight to the store, bypassing the buffer.
#[derive(Debug, Deserialize)]
pub struct WritePointBody {
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, Value>,
    /// RFC 3339 string, or unix milliseconds.
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl WritePointBody {
    /// Build the point. A `timestamp` key among the fields is ignored, as are values that are
    /// not strings, numbers or booleans. An unusable timestamp is replaced by `now`.
    fn into_point(self, now: DateTime<Utc>) -> DataPoint {
        let timestamp = match self.timestamp {
            None | Some(Value::Null) => now,
            Some(raw) => parse_timestamp(&raw).unwrap_or_else(|| {
                warn!(timestamp = %raw, "invalid timestamp provided, using current time");
                now
            }),
        };

        let mut point = DataPoint::new(&self.measurement, timestamp);
        for (key, value) in self.tags.iter() {
            point = point.tag(key, value);
        }

        for (key, value) in self.fields {
            if key == "timestamp" {
                continue;
            }
            let value = match value {
                Value::String(s) => FieldValue::String(s),
                Value::Bool(b) => FieldValue::Bool(b),
                Value::Number(n) => match n.as_f64() {
                    Some(f) => FieldValue::Float(f),
                    None => continue,
                },
                _ => continue,
            };
            point.fields.insert(key, value);
        }

        point
    }
}

fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}

pub async fn write(
    State(state): State<AppState>,
    Json(body): Json<WritePointBody>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let point = body.into_point(Utc::now());
    point.validate()?;

    debug!("writing point: {:?}", point);
    state.sink.write_batch(&[point]).await?;

    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRangeParams {
    pub measurement: String,
    pub start: String,
    pub stop: String,
}

pub async fn delete(
    State(state): State<AppState>,
    Query(params): Query<DeleteRangeParams>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if params.measurement.is_empty() {
        return Err(ApiError::InvalidInput("measurement is required".to_owned()));
    }
    let start = parse_time("start", &params.start)?;
    let stop = parse_time("stop", &params.stop)?;
    if stop < start {
        return Err(ApiError::InvalidInput("stop is before start".to_owned()));
    }

    state
        .sink
        .delete_range(&params.measurement, start, stop)
        .await?;

    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> WritePointBody {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_fields_skip_timestamp_and_non_scalars() {
        let now = Utc::now();
        let point = body(json!({
            "measurement": "temperature",
            "tags": {"machine_id": "18260"},
            "fields": {"temperature": 30.2, "ok": true, "command_id": "c-1", "timestamp": 5, "extra": [1]}
        }))
        .into_point(now);

        assert_eq!(point.timestamp, now);
        assert_eq!(point.tags["machine_id"], "18260");
        assert_eq!(point.fields.len(), 3);
        assert_eq!(point.fields["temperature"], FieldValue::Float(30.2));
        assert_eq!(point.fields["ok"], FieldValue::Bool(true));
        assert!(!point.fields.contains_key("timestamp"));
    }

    #[test]
    fn test_timestamp_forms() {
        let now = Utc::now();

        let point = body(json!({"measurement": "m", "fields": {"v": 1}, "timestamp": "2024-06-01T00:00:00+07:00"}))
            .into_point(now);
        assert_eq!(
            point.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 31, 17, 0, 0).unwrap()
        );

        let point = body(json!({"measurement": "m", "fields": {"v": 1}, "timestamp": 1_717_200_000_000_i64}))
            .into_point(now);
        assert_eq!(point.timestamp, Utc.timestamp_millis_opt(1_717_200_000_000).unwrap());

        let point = body(json!({"measurement": "m", "fields": {"v": 1}, "timestamp": "yesterday"}))
            .into_point(now);
        assert_eq!(point.timestamp, now);
    }
}
