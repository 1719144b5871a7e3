use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingest_common::buffer::IngestionBuffer;
use ingest_common::dedup::DeduplicationGate;
use ingest_common::fingerprint::fingerprint;
use ingest_common::health::{ComponentStatus, HealthHandle};
use ingest_common::metrics::{
    MESSAGES_DELETED, MESSAGES_DELETE_FAILED, MESSAGES_DUPLICATE, MESSAGES_MALFORMED,
    MESSAGES_RECEIVED, POINTS_BUFFERED, POLL_ERRORS, RECORDS_REJECTED,
};
use ingest_common::source::{MessageSource, ReceiveOptions};

use crate::error::WorkerError;
use crate::normalize::normalize;

/// Pause after a failed cycle, so an unreachable queue is not hammered.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What a single poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub received: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub rejected: usize,
    pub buffered: usize,
    pub deleted: usize,
    pub delete_failed: usize,
}

/// Receives messages from a `MessageSource`, turns them into points in the shared
/// `IngestionBuffer` and deletes them from the source.
///
/// Many workers may poll the same source at once. They do not coordinate: exclusivity
/// comes from the source's visibility timeout, and redeliveries are caught by the
/// optional `DeduplicationGate`.
#[derive(Clone)]
pub struct PollWorker {
    name: String,
    source: Arc<dyn MessageSource>,
    buffer: Arc<IngestionBuffer>,
    dedup: Option<DeduplicationGate>,
    options: ReceiveOptions,
    measurement: String,
    poll_delay: Duration,
}

impl PollWorker {
    pub fn new(
        name: &str,
        source: Arc<dyn MessageSource>,
        buffer: Arc<IngestionBuffer>,
        options: ReceiveOptions,
        measurement: &str,
    ) -> Self {
        Self {
            name: name.to_owned(),
            source,
            buffer,
            dedup: None,
            options,
            measurement: measurement.to_owned(),
            poll_delay: Duration::ZERO,
        }
    }

    pub fn with_dedup(mut self, gate: DeduplicationGate) -> Self {
        self.dedup = Some(gate);
        self
    }

    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// A copy of this worker under another name, sharing all collaborators.
    pub fn named(&self, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<dyn MessageSource> {
        &self.source
    }

    pub fn buffer(&self) -> &Arc<IngestionBuffer> {
        &self.buffer
    }

    /// Receive one batch and process it.
    ///
    /// Every received message is deleted at the end of the cycle, once all of its points
    /// are in the buffer: duplicates and malformed messages included. A receive error ends
    /// the cycle before anything is buffered. A delete error leaves the messages to be
    /// redelivered after their visibility timeout.
    pub async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        let messages = self
            .source
            .receive(self.options)
            .await
            .map_err(WorkerError::ReceiveError)?;

        let mut report = CycleReport {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }
        metrics::counter!(MESSAGES_RECEIVED).increment(messages.len() as u64);

        let received_at = Utc::now();

        for message in messages.iter() {
            let message_id = message.message_id.as_deref().unwrap_or("unknown");

            let normalized = match normalize(&message.body, &self.measurement, received_at) {
                Ok(normalized) => normalized,
                Err(e) => {
                    warn!(
                        worker = %self.name,
                        message_id,
                        "discarding malformed message: {}",
                        e
                    );
                    report.malformed += 1;
                    continue;
                }
            };

            let fingerprint = match self.dedup {
                Some(ref gate) => {
                    let fingerprint = fingerprint(message.body.as_bytes());
                    if gate.has_processed(&fingerprint).await {
                        debug!(worker = %self.name, message_id, %fingerprint, "skipping duplicate message");
                        report.duplicates += 1;
                        continue;
                    }
                    Some((gate, fingerprint))
                }
                None => None,
            };

            if normalized.rejected > 0 {
                warn!(
                    worker = %self.name,
                    message_id,
                    "rejected {} incomplete machine records",
                    normalized.rejected
                );
            }
            report.rejected += normalized.rejected;

            if let Some((gate, fingerprint)) = fingerprint {
                gate.mark_processed(&fingerprint).await;
            }

            report.buffered += normalized.points.len();
            self.buffer.push(normalized.points);
        }

        metrics::counter!(MESSAGES_DUPLICATE).increment(report.duplicates as u64);
        metrics::counter!(MESSAGES_MALFORMED).increment(report.malformed as u64);
        metrics::counter!(RECORDS_REJECTED).increment(report.rejected as u64);
        metrics::counter!(POINTS_BUFFERED).increment(report.buffered as u64);

        let deleted = self
            .source
            .delete_batch(&messages)
            .await
            .map_err(WorkerError::DeleteError)?;

        report.deleted = deleted.deleted;
        report.delete_failed = deleted.failed.len();
        metrics::counter!(MESSAGES_DELETED).increment(report.deleted as u64);
        metrics::counter!(MESSAGES_DELETE_FAILED).increment(report.delete_failed as u64);

        Ok(report)
    }

    /// Run cycles until `shutdown` is cancelled. An in-flight cycle is always completed.
    pub async fn run(self, liveness: Option<HealthHandle>, shutdown: CancellationToken) {
        info!(worker = %self.name, "starting poll worker");

        while !shutdown.is_cancelled() {
            if let Some(ref liveness) = liveness {
                liveness.report_healthy().await;
            }

            let pause = match self.run_cycle().await {
                Ok(report) => {
                    if report.received > 0 {
                        debug!(worker = %self.name, ?report, "poll cycle done");
                    }
                    self.poll_delay
                }
                Err(e) => {
                    error!(worker = %self.name, "poll cycle failed: {}", e);
                    let stage = match e {
                        WorkerError::ReceiveError(_) => "receive",
                        WorkerError::DeleteError(_) => "delete",
                    };
                    metrics::counter!(POLL_ERRORS, "stage" => stage).increment(1);
                    self.poll_delay.max(ERROR_BACKOFF)
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        if let Some(ref liveness) = liveness {
            liveness.report_status(ComponentStatus::Stopped).await;
        }
        info!(worker = %self.name, "poll worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_common::dedup::DEFAULT_KEY_PREFIX;
    use ingest_common::test_utils::{MemorySource, MockDedupStore};

    const READING: &str = r#"{"machines": [{"position": [{"detail": {"machine_id": "18260", "temperature": 30.2, "command_id": "c-1"}}]}]}"#;

    fn worker(source: &MemorySource, buffer: &Arc<IngestionBuffer>) -> PollWorker {
        PollWorker::new(
            "poll-worker-0",
            Arc::new(source.clone()),
            buffer.clone(),
            ReceiveOptions::default(),
            "temperature",
        )
    }

    fn gate(store: &MockDedupStore) -> DeduplicationGate {
        DeduplicationGate::new(
            Arc::new(store.clone()),
            DEFAULT_KEY_PREFIX,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_cycle_buffers_points_then_deletes() {
        let source = MemorySource::new();
        let buffer = Arc::new(IngestionBuffer::new());
        let delivered = source.push_batch(&[READING, READING]);

        let report = worker(&source, &buffer).run_cycle().await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                received: 2,
                buffered: 2,
                deleted: 2,
                ..Default::default()
            }
        );
        assert_eq!(buffer.len(), 2);
        assert_eq!(source.deleted(), delivered);
    }

    #[tokio::test]
    async fn test_empty_receive_is_a_noop() {
        let source = MemorySource::new();
        let buffer = Arc::new(IngestionBuffer::new());

        let report = worker(&source, &buffer).run_cycle().await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert!(buffer.is_empty());
        assert!(source.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_deleted_and_others_processed() {
        let source = MemorySource::new();
        let buffer = Arc::new(IngestionBuffer::new());
        source.push_batch(&["not json at all", READING]);

        let report = worker(&source, &buffer).run_cycle().await.unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.buffered, 1);
        assert_eq!(report.deleted, 2);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_only_deleted() {
        let source = MemorySource::new();
        let store = MockDedupStore::new();
        let buffer = Arc::new(IngestionBuffer::new());
        let worker = worker(&source, &buffer).with_dedup(gate(&store));

        let first = source.push_batch(&[READING]);
        source.push_messages(first.clone());

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.buffered, 1);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.buffered, 0);
        assert_eq!(report.deleted, 1);

        assert_eq!(buffer.len(), 1);
        assert_eq!(source.deleted().len(), 2);
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_dedup_store_fails_open() {
        let source = MemorySource::new();
        let store = MockDedupStore::new();
        store.set_unavailable(true);
        let buffer = Arc::new(IngestionBuffer::new());
        let worker = worker(&source, &buffer).with_dedup(gate(&store));

        let first = source.push_batch(&[READING]);
        source.push_messages(first);

        worker.run_cycle().await.unwrap();
        worker.run_cycle().await.unwrap();

        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_receive_failure_ends_cycle() {
        let source = MemorySource::new();
        let buffer = Arc::new(IngestionBuffer::new());
        source.push_batch(&[READING]);
        source.set_failing_receives(true);

        let error = worker(&source, &buffer).run_cycle().await.unwrap_err();

        assert!(matches!(error, WorkerError::ReceiveError(_)));
        assert!(buffer.is_empty());
        assert_eq!(source.pending_batches(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_entries_are_reported() {
        let source = MemorySource::new();
        let buffer = Arc::new(IngestionBuffer::new());
        let delivered = source.push_batch(&[READING, READING]);
        source.refuse_delete(&delivered[1].receipt_handle);

        let report = worker(&source, &buffer).run_cycle().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.delete_failed, 1);
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let source = MemorySource::new();
        let buffer = Arc::new(IngestionBuffer::new());
        source.push_batch(&[READING]);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker(&source, &buffer).run(None, shutdown.clone()));
        while source.deleted().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(buffer.len(), 1);
    }
}
