use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{
    BatchResultErrorEntry, DeleteMessageBatchRequestEntry, QueueAttributeName,
};
use aws_sdk_sqs::Client as SqsClient;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// SQS refuses batch deletes of more than ten entries.
pub const MAX_DELETE_BATCH: usize = 10;

/// Enumeration of errors returned by a `MessageSource`.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to receive messages: {0}")]
    ReceiveError(String),
    #[error("failed to delete messages: {0}")]
    DeleteError(String),
    #[error("failed to read queue attributes: {0}")]
    AttributesError(String),
    #[error("invalid delete request: {0}")]
    InvalidRequest(String),
}

/// A message as received from the queue. `receipt_handle` is the token needed to delete it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub message_id: Option<String>,
    pub body: String,
    pub receipt_handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of messages per receive, at most 10 for SQS.
    pub max_messages: i32,
    /// Long-poll wait, done server side.
    pub wait_seconds: i32,
    /// How long received messages stay hidden from other receivers.
    pub visibility_timeout_seconds: i32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_seconds: 5,
            visibility_timeout_seconds: 30,
        }
    }
}

/// Outcome of a batch delete. Messages listed in `failed` stay in the queue and will be redelivered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: Vec<String>,
}

/// Approximate queue depth, for observability only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub total: u64,
    pub in_flight: u64,
    pub delayed: u64,
}

/// A remote at-least-once queue.
///
/// Implementations must guarantee that a received message is hidden from other receivers
/// for the visibility timeout: several workers poll the same queue concurrently and rely on
/// this, not on any coordination of their own, to avoid processing a message twice.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<RawMessage>, SourceError>;
    async fn delete_batch(&self, messages: &[RawMessage]) -> Result<DeleteReport, SourceError>;
    async fn queue_depth(&self) -> Result<QueueDepth, SourceError>;
}

pub struct SqsSource {
    client: SqsClient,
    queue_url: String,
}

impl SqsSource {
    pub fn new(client: SqsClient, queue_url: &str) -> Self {
        Self {
            client,
            queue_url: queue_url.to_owned(),
        }
    }

    /// Build a client from the default AWS configuration chain, optionally overriding
    /// credentials and endpoint (e.g. to target a local emulator).
    pub async fn from_env(
        queue_url: &str,
        region: &str,
        credentials: Option<(String, String)>,
        endpoint_url: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_owned()));

        if let Some((access_key, secret_key)) = credentials {
            loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                access_key, secret_key, None, None, "ingest-config",
            ));
        }
        if let Some(endpoint_url) = endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let config = loader.load().await;
        Self::new(SqsClient::new(&config), queue_url)
    }
}

fn parse_attribute(
    attributes: &std::collections::HashMap<QueueAttributeName, String>,
    name: QueueAttributeName,
) -> u64 {
    attributes
        .get(&name)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

#[async_trait]
impl MessageSource for SqsSource {
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<RawMessage>, SourceError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(options.max_messages)
            .wait_time_seconds(options.wait_seconds)
            .visibility_timeout(options.visibility_timeout_seconds)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| SourceError::ReceiveError(DisplayErrorContext(&e).to_string()))?;

        let mut messages = Vec::new();
        for message in output.messages.unwrap_or_default() {
            let Some(receipt_handle) = message.receipt_handle else {
                warn!(message_id = ?message.message_id, "received message without receipt handle");
                continue;
            };

            messages.push(RawMessage {
                message_id: message.message_id,
                body: message.body.unwrap_or_default(),
                receipt_handle,
            });
        }

        debug!("received {} messages", messages.len());
        Ok(messages)
    }

    async fn delete_batch(&self, messages: &[RawMessage]) -> Result<DeleteReport, SourceError> {
        let mut report = DeleteReport::default();

        for chunk in messages.chunks(MAX_DELETE_BATCH) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(index, message)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(index.to_string())
                        .receipt_handle(&message.receipt_handle)
                        .build()
                        .map_err(|e| SourceError::InvalidRequest(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let output = self
                .client
                .delete_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| SourceError::DeleteError(DisplayErrorContext(&e).to_string()))?;

            record_delete_outcome(chunk, output.failed(), &mut report);
        }

        Ok(report)
    }

    async fn queue_depth(&self) -> Result<QueueDepth, SourceError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(|e| SourceError::AttributesError(DisplayErrorContext(&e).to_string()))?;

        let attributes = output.attributes.unwrap_or_default();

        Ok(QueueDepth {
            total: parse_attribute(&attributes, QueueAttributeName::ApproximateNumberOfMessages),
            in_flight: parse_attribute(
                &attributes,
                QueueAttributeName::ApproximateNumberOfMessagesNotVisible,
            ),
            delayed: parse_attribute(
                &attributes,
                QueueAttributeName::ApproximateNumberOfMessagesDelayed,
            ),
        })
    }
}

/// Add the outcome of one delete request for `chunk` to `report`. Failed entries are
/// identified by their index in the chunk.
fn record_delete_outcome(
    chunk: &[RawMessage],
    failed: &[BatchResultErrorEntry],
    report: &mut DeleteReport,
) {
    for entry in failed {
        let message_id = entry
            .id()
            .parse::<usize>()
            .ok()
            .and_then(|index| chunk.get(index))
            .and_then(|message| message.message_id.clone())
            .unwrap_or_else(|| entry.id().to_owned());
        warn!(
            message_id = %message_id,
            code = entry.code(),
            "failed to delete message from queue"
        );
        report.failed.push(message_id);
    }
    report.deleted += chunk.len().saturating_sub(failed.len());
}
