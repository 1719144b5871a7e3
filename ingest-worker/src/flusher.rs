use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingest_common::buffer::IngestionBuffer;
use ingest_common::health::{ComponentStatus, HealthHandle};
use ingest_common::metrics::{BUFFER_DEPTH, FLUSH_DURATION, FLUSH_FAILURES, POINTS_WRITTEN};
use ingest_common::sink::TimeSeriesSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The buffer was empty.
    Idle,
    /// A chunk of this many points was written.
    Flushed(usize),
    /// A chunk of this many points failed to write and was put back.
    Failed(usize),
}

/// Periodically moves chunks of points from the `IngestionBuffer` to a `TimeSeriesSink`.
///
/// There is exactly one flusher per buffer: nothing else removes points from it.
#[derive(Clone)]
pub struct BufferFlusher {
    buffer: Arc<IngestionBuffer>,
    sink: Arc<dyn TimeSeriesSink>,
    interval: Duration,
    chunk_size: usize,
}

impl BufferFlusher {
    pub fn new(
        buffer: Arc<IngestionBuffer>,
        sink: Arc<dyn TimeSeriesSink>,
        interval: Duration,
        chunk_size: usize,
    ) -> Self {
        Self {
            buffer,
            sink,
            interval,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Write at most one chunk from the front of the buffer. On failure the chunk goes back
    /// to the front, ahead of anything pushed in the meantime.
    pub async fn flush_once(&self) -> FlushOutcome {
        let chunk = self.buffer.take_front(self.chunk_size);
        if chunk.is_empty() {
            return FlushOutcome::Idle;
        }

        let size = chunk.len();
        let start = Instant::now();
        let result = self.sink.write_batch(&chunk).await;
        metrics::histogram!(FLUSH_DURATION).record(start.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(()) => {
                debug!("flushed {} points in {:?}", size, start.elapsed());
                metrics::counter!(POINTS_WRITTEN).increment(size as u64);
                FlushOutcome::Flushed(size)
            }
            Err(e) => {
                error!("failed to flush {} points, restoring them: {}", size, e);
                metrics::counter!(FLUSH_FAILURES).increment(1);
                self.buffer.restore_front(chunk);
                FlushOutcome::Failed(size)
            }
        };

        metrics::gauge!(BUFFER_DEPTH).set(self.buffer.len() as f64);
        outcome
    }

    /// Flush until the buffer is empty or a write fails.
    pub async fn drain(&self) -> usize {
        let mut written = 0;
        loop {
            match self.flush_once().await {
                FlushOutcome::Flushed(size) => written += size,
                FlushOutcome::Idle => break,
                FlushOutcome::Failed(_) => {
                    warn!(
                        "giving up on final drain, {} points left in buffer",
                        self.buffer.len()
                    );
                    break;
                }
            }
        }
        written
    }

    /// Flush one chunk per tick until `shutdown` is cancelled, then drain what is left.
    pub async fn run(self, liveness: Option<HealthHandle>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Some(ref liveness) = liveness {
                liveness.report_healthy().await;
            }
            self.flush_once().await;
        }

        let written = self.drain().await;
        info!("flusher stopped after final drain of {} points", written);

        if let Some(ref liveness) = liveness {
            liveness.report_status(ComponentStatus::Stopped).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ingest_common::point::{DataPoint, FieldValue};
    use ingest_common::test_utils::MemorySink;

    fn points(range: std::ops::Range<usize>) -> Vec<DataPoint> {
        range
            .map(|i| DataPoint::new("temperature", Utc::now()).field("seq", i as f64))
            .collect()
    }

    fn seq(points: &[DataPoint]) -> Vec<f64> {
        points
            .iter()
            .map(|p| match p.fields["seq"] {
                FieldValue::Float(f) => f,
                _ => panic!("unexpected field type"),
            })
            .collect()
    }

    fn flusher(buffer: &Arc<IngestionBuffer>, sink: &MemorySink, chunk_size: usize) -> BufferFlusher {
        BufferFlusher::new(
            buffer.clone(),
            Arc::new(sink.clone()),
            Duration::from_millis(10),
            chunk_size,
        )
    }

    #[tokio::test]
    async fn test_empty_buffer_is_idle() {
        let buffer = Arc::new(IngestionBuffer::new());
        let sink = MemorySink::new();

        assert_eq!(flusher(&buffer, &sink, 1000).flush_once().await, FlushOutcome::Idle);
        assert_eq!(sink.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_chunks_are_bounded() {
        let buffer = Arc::new(IngestionBuffer::new());
        let sink = MemorySink::new();
        buffer.push(points(0..2500));
        let flusher = flusher(&buffer, &sink, 1000);

        assert_eq!(flusher.flush_once().await, FlushOutcome::Flushed(1000));
        assert_eq!(flusher.flush_once().await, FlushOutcome::Flushed(1000));
        assert_eq!(flusher.flush_once().await, FlushOutcome::Flushed(500));
        assert_eq!(flusher.flush_once().await, FlushOutcome::Idle);

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(seq(&sink.points()), seq(&points(0..2500)));
    }

    #[tokio::test]
    async fn test_failed_chunk_is_restored_in_order() {
        let buffer = Arc::new(IngestionBuffer::new());
        let sink = MemorySink::new();
        buffer.push(points(0..3));
        sink.set_failing(true);
        let flusher = flusher(&buffer, &sink, 1000);

        assert_eq!(flusher.flush_once().await, FlushOutcome::Failed(3));
        buffer.push(points(3..4));
        assert_eq!(seq(&buffer.snapshot()), vec![0.0, 1.0, 2.0, 3.0]);

        sink.set_failing(false);
        assert_eq!(flusher.flush_once().await, FlushOutcome::Flushed(4));
        assert_eq!(seq(&sink.points()), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let buffer = Arc::new(IngestionBuffer::new());
        let sink = MemorySink::new();
        buffer.push(points(0..5));
        sink.set_failing(true);

        assert_eq!(flusher(&buffer, &sink, 2).drain().await, 0);
        assert_eq!(buffer.len(), 5);
        assert_eq!(sink.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let buffer = Arc::new(IngestionBuffer::new());
        let sink = MemorySink::new();
        let shutdown = CancellationToken::new();
        let flusher = BufferFlusher::new(
            buffer.clone(),
            Arc::new(sink.clone()),
            Duration::from_secs(3600),
            2,
        );

        let handle = tokio::spawn(flusher.run(None, shutdown.clone()));
        // The first tick fires immediately, on an empty buffer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(points(0..5));
        shutdown.cancel();
        handle.await.unwrap();

        assert!(buffer.is_empty());
        assert_eq!(sink.points().len(), 5);
        assert_eq!(sink.batches().len(), 3);
    }
}
