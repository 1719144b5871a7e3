//! Range queries over stored telemetry: Flux generation and result shaping.
//!
//! A query runs two Flux pipelines over the same time range, the windowed mean of the
//! `temperature` field and the last `command_id` per window, then merges their rows by
//! timestamp into a chart friendly result.
use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

pub const TEMPERATURE_FIELD: &str = "temperature";
pub const COMMAND_ID_FIELD: &str = "command_id";

/// Aggregation window, selected from the span the caller wants to display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregateWindow {
    #[default]
    OneHour,
    SixHours,
    OneDay,
    ThreeDays,
    FiveDays,
}

impl AggregateWindow {
    /// The Flux duration literal used as the `every` parameter of `aggregateWindow`.
    pub fn every(&self) -> &'static str {
        match self {
            AggregateWindow::OneHour => "1m",
            AggregateWindow::SixHours => "5m",
            AggregateWindow::OneDay => "15m",
            AggregateWindow::ThreeDays => "30m",
            AggregateWindow::FiveDays => "1h",
        }
    }
}

impl FromStr for AggregateWindow {
    type Err = std::convert::Infallible;

    /// Unknown spans fall back to the finest window.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "6hr" => AggregateWindow::SixHours,
            "1day" => AggregateWindow::OneDay,
            "3day" => AggregateWindow::ThreeDays,
            "5day" => AggregateWindow::FiveDays,
            _ => AggregateWindow::OneHour,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub measurement: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub machine_id: Option<String>,
    pub window: AggregateWindow,
}

/// Render a value as a Flux string literal. JSON string escaping is valid Flux.
fn flux_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("\"\""))
}

fn flux_time(time: &DateTime<Utc>) -> String {
    flux_string(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl RangeQuery {
    fn flux_for_field(&self, bucket: &str, field: &str, function: &str) -> String {
        let mut flux = format!(
            "from(bucket: {})\n  |> range(start: time(v: {}), stop: time(v: {}))\n  |> filter(fn: (r) => r[\"_measurement\"] == {})\n  |> filter(fn: (r) => r[\"_field\"] == {})\n",
            flux_string(bucket),
            flux_time(&self.start),
            flux_time(&self.stop),
            flux_string(&self.measurement),
            flux_string(field),
        );

        if let Some(machine_id) = self.machine_id.as_deref().filter(|m| !m.is_empty()) {
            flux.push_str(&format!(
                "  |> filter(fn: (r) => r[\"machine_id\"] == {})\n",
                flux_string(machine_id)
            ));
        }

        flux.push_str(&format!(
            "  |> aggregateWindow(every: {}, fn: {}, createEmpty: false)\n  |> yield(name: \"{}\")\n",
            self.window.every(),
            function,
            function
        ));
        flux
    }

    /// Flux for the windowed mean temperature.
    pub fn temperature_flux(&self, bucket: &str) -> String {
        self.flux_for_field(bucket, TEMPERATURE_FIELD, "mean")
    }

    /// Flux for the last command id of each window.
    pub fn command_flux(&self, bucket: &str) -> String {
        self.flux_for_field(bucket, COMMAND_ID_FIELD, "last")
    }
}

/// One merged row: every field value observed at `time`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    #[serde(rename = "_time")]
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub data: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XAxis {
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub series: Vec<Series>,
    pub xaxis: XAxis,
    pub raw: Vec<QueryRow>,
}

/// Accumulates rows from several annotated CSV responses, keyed by timestamp.
#[derive(Debug, Default)]
pub struct RowMerger {
    rows: BTreeMap<DateTime<Utc>, BTreeMap<String, Value>>,
}

impl RowMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the rows of a Flux CSV response.
    ///
    /// Responses hold one or more tables, each starting with its own header row. Rows
    /// without a parsable `_time` are skipped.
    pub fn merge_csv(&mut self, body: &str) -> Result<(), csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body.as_bytes());

        let mut columns: Option<(usize, usize, usize)> = None;

        for record in reader.records() {
            let record = record?;

            if record.get(0).is_some_and(|first| first.starts_with('#')) {
                continue;
            }

            if record.iter().any(|column| column == "_field") {
                let position = |name: &str| record.iter().position(|column| column == name);
                columns = match (position("_time"), position("_value"), position("_field")) {
                    (Some(time), Some(value), Some(field)) => Some((time, value, field)),
                    _ => None,
                };
                continue;
            }

            let Some((time_idx, value_idx, field_idx)) = columns else {
                continue;
            };

            let (Some(time), Some(value), Some(field)) = (
                record.get(time_idx),
                record.get(value_idx),
                record.get(field_idx),
            ) else {
                continue;
            };

            let Ok(time) = DateTime::parse_from_rfc3339(time) else {
                continue;
            };

            self.rows
                .entry(time.with_timezone(&Utc))
                .or_default()
                .insert(field.to_owned(), field_value(field, value));
        }

        Ok(())
    }

    pub fn finish(self) -> QueryResult {
        let raw: Vec<QueryRow> = self
            .rows
            .into_iter()
            .map(|(time, fields)| QueryRow { time, fields })
            .collect();

        let categories = raw
            .iter()
            .map(|row| row.time.format("%H:%M:%S").to_string())
            .collect();

        let data = raw
            .iter()
            .map(|row| {
                row.fields
                    .get(TEMPERATURE_FIELD)
                    .and_then(Value::as_f64)
                    .map(|temperature| format!("{:.2}", temperature))
            })
            .collect();

        QueryResult {
            series: vec![Series {
                name: "Temperature".to_owned(),
                data,
            }],
            xaxis: XAxis { categories },
            raw,
        }
    }
}

fn field_value(field: &str, value: &str) -> Value {
    if field == TEMPERATURE_FIELD {
        if let Some(number) = value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Value::Number(number);
        }
    }
    Value::String(value.to_owned())
}
