use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::point::{encode_batch, DataPoint};
use crate::query::{QueryResult, RangeQuery, RowMerger};

/// Enumeration of errors returned by a `TimeSeriesSink`.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("request to the time-series store failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("time-series store answered {status}: {body}")]
    StatusError { status: u16, body: String },
    #[error("invalid time-series store url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to parse query response: {0}")]
    ResponseParseError(#[from] csv::Error),
    #[error("api token is not a valid header value")]
    InvalidToken,
}

/// A store of timestamped, tagged, multi-field points.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Write all points in a single request. The batch either fails or succeeds as a whole.
    async fn write_batch(&self, points: &[DataPoint]) -> Result<(), SinkError>;

    /// Delete every point of `measurement` between `start` and `stop`.
    async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    async fn query(&self, query: &RangeQuery) -> Result<QueryResult, SinkError>;
}

#[derive(Serialize)]
struct DeletePredicate {
    start: String,
    stop: String,
    predicate: String,
}

/// A `TimeSeriesSink` speaking the InfluxDB v2 HTTP API.
pub struct InfluxSink {
    client: reqwest::Client,
    base_url: Url,
    org: String,
    bucket: String,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        org: &str,
        bucket: &str,
        token: &str,
        request_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let mut headers = header::HeaderMap::new();
        let mut authorization = header::HeaderValue::from_str(&format!("Token {}", token))
            .map_err(|_| SinkError::InvalidToken)?;
        authorization.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, authorization);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("telemetry ingest worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(url)?,
            org: org.to_owned(),
            bucket: bucket.to_owned(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn endpoint(&self, path: &str, with_bucket: bool) -> Result<Url, SinkError> {
        let mut url = self.base_url.join(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("org", &self.org);
            if with_bucket {
                pairs.append_pair("bucket", &self.bucket);
            }
        }
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::StatusError {
            status: status.as_u16(),
            body,
        })
    }

    async fn run_flux(&self, flux: String) -> Result<String, SinkError> {
        let url = self.endpoint("api/v2/query", false)?;
        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/vnd.flux")
            .header(header::ACCEPT, "application/csv")
            .body(flux)
            .send()
            .await?;

        Ok(Self::check(response).await?.text().await?)
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write_batch(&self, points: &[DataPoint]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut url = self.endpoint("api/v2/write", true)?;
        url.query_pairs_mut().append_pair("precision", "ns");

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(encode_batch(points))
            .send()
            .await?;
        Self::check(response).await?;

        debug!("wrote {} points", points.len());
        Ok(())
    }

    async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let url = self.endpoint("api/v2/delete", true)?;
        let body = DeletePredicate {
            start: start.to_rfc3339_opts(SecondsFormat::Millis, true),
            stop: stop.to_rfc3339_opts(SecondsFormat::Millis, true),
            predicate: format!("_measurement=\"{}\"", measurement.replace('"', "\\\"")),
        };

        let response = self.client.post(url).json(&body).send().await?;
        Self::check(response).await?;

        Ok(())
    }

    async fn query(&self, query: &RangeQuery) -> Result<QueryResult, SinkError> {
        let mut merger = RowMerger::new();

        let temperatures = self.run_flux(query.temperature_flux(&self.bucket)).await?;
        merger.merge_csv(&temperatures)?;

        let commands = self.run_flux(query.command_flux(&self.bucket)).await?;
        merger.merge_csv(&commands)?;

        Ok(merger.finish())
    }
}
