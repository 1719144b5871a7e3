use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of reasons a `DataPoint` cannot be written to a time-series store.
#[derive(Error, Debug, PartialEq)]
pub enum PointError {
    #[error("data point has an empty measurement name")]
    EmptyMeasurement,
    #[error("data point for measurement {0} holds no fields")]
    NoFields(String),
    #[error("field {0} is not a finite number")]
    NonFiniteField(String),
    #[error("timestamp {0} cannot be represented in nanoseconds")]
    TimestampOutOfRange(DateTime<Utc>),
    #[error("{0} contains a line break")]
    LineBreak(String),
    #[error("{0} ends with a backslash")]
    TrailingBackslash(String),
}

/// The value of a single field. InfluxDB accepts strings, floats and booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Float(f64),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_owned())
    }
}

/// A normalized unit of telemetry, ready to be buffered and written.
///
/// Tags and fields are kept in ordered maps: keys are unique and the line protocol
/// output is stable, which InfluxDB recommends for write performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.to_owned(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn field<V: Into<FieldValue>>(mut self, key: &str, value: V) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    /// Check this point can be encoded. Points failing validation must never reach the buffer.
    pub fn validate(&self) -> Result<(), PointError> {
        if self.measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }

        if self.fields.is_empty() {
            return Err(PointError::NoFields(self.measurement.clone()));
        }

        check_name("measurement", &self.measurement)?;
        for (key, value) in self.tags.iter() {
            check_name("tag key", key)?;
            check_name(&format!("value of tag {}", key), value)?;
        }

        for (key, value) in self.fields.iter() {
            check_name("field key", key)?;
            if let FieldValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(PointError::NonFiniteField(key.clone()));
                }
            }
        }

        if self.timestamp.timestamp_nanos_opt().is_none() {
            return Err(PointError::TimestampOutOfRange(self.timestamp));
        }

        Ok(())
    }

    /// Append this point, encoded as a line of InfluxDB line protocol, to `out`.
    /// Tags with an empty value are left out, as InfluxDB rejects them.
    pub fn write_line_protocol(&self, out: &mut String) {
        escape_into(out, &self.measurement, &[',', ' ']);

        for (key, value) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            out.push(',');
            escape_into(out, key, &[',', '=', ' ']);
            out.push('=');
            escape_into(out, value, &[',', '=', ' ']);
        }

        let mut separator = ' ';
        for (key, value) in self.fields.iter() {
            out.push(separator);
            separator = ',';
            escape_into(out, key, &[',', '=', ' ']);
            out.push('=');
            match value {
                FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                FieldValue::Float(f) => {
                    _ = write!(out, "{}", f);
                }
                FieldValue::String(s) => {
                    out.push('"');
                    escape_string_value(out, s);
                    out.push('"');
                }
            }
        }

        _ = write!(
            out,
            " {}",
            self.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );
    }

    pub fn to_line_protocol(&self) -> String {
        let mut line = String::new();
        self.write_line_protocol(&mut line);
        line
    }
}

/// Encode a batch of points as a newline separated line protocol body.
pub fn encode_batch(points: &[DataPoint]) -> String {
    let mut body = String::with_capacity(points.len() * 96);
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            body.push('\n');
        }
        point.write_line_protocol(&mut body);
    }
    body
}

/// Names are escaped but cannot carry line breaks, and a trailing backslash would escape
/// the delimiter that follows.
fn check_name(what: &str, value: &str) -> Result<(), PointError> {
    if value.contains(['\n', '\r']) {
        return Err(PointError::LineBreak(format!("{} {:?}", what, value)));
    }
    if value.ends_with('\\') {
        return Err(PointError::TrailingBackslash(format!("{} {:?}", what, value)));
    }
    Ok(())
}

fn escape_string_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
