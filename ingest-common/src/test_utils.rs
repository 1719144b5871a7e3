//! In-memory stand-ins for the queue, the dedup store and the time-series store.
//!
//! All of them are cheap to clone and share their state between clones, so a test can keep
//! one copy for assertions and hand another to the code under test.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dedup::{DedupError, DedupStore};
use crate::point::DataPoint;
use crate::query::{QueryResult, RangeQuery, RowMerger};
use crate::sink::{SinkError, TimeSeriesSink};
use crate::source::{
    DeleteReport, MessageSource, QueueDepth, RawMessage, ReceiveOptions, SourceError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Default)]
pub struct MockDedupStore {
    entries: Arc<Mutex<HashMap<String, (String, Duration)>>>,
    unavailable: Arc<AtomicBool>,
}

impl MockDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        lock(&self.entries).get(key).map(|(_, ttl)| *ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Make every call fail, as if the store could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every marker, as if their TTL had elapsed.
    pub fn expire_all(&self) {
        lock(&self.entries).clear();
    }

    fn check_available(&self) -> Result<(), DedupError> {
        match self.unavailable.load(Ordering::SeqCst) {
            true => Err(DedupError::Timeout(Duration::from_millis(100))),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl DedupStore for MockDedupStore {
    async fn exists(&self, key: &str) -> Result<bool, DedupError> {
        self.check_available()?;
        Ok(lock(&self.entries).contains_key(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DedupError> {
        self.check_available()?;
        lock(&self.entries).insert(key.to_owned(), (value.to_owned(), ttl));
        Ok(())
    }
}

#[derive(Default)]
struct SourceState {
    batches: VecDeque<Vec<RawMessage>>,
    deleted: Vec<RawMessage>,
    undeletable: HashSet<String>,
    depth: QueueDepth,
    receive_calls: usize,
    receive_latency: Duration,
    next_id: usize,
}

/// A queue whose receives return the batches queued with `push_batch`, in order.
///
/// An empty queue answers after a short pause, the way a long poll would, so that workers
/// polling it in a loop do not spin. `set_receive_latency` makes every receive wait before
/// taking its batch, like a long poll that a message arrives during.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
    failing_receives: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one receive worth of messages. Returns the messages as they will be delivered.
    pub fn push_batch(&self, bodies: &[&str]) -> Vec<RawMessage> {
        let mut state = lock(&self.state);
        let batch: Vec<RawMessage> = bodies
            .iter()
            .map(|body| {
                state.next_id += 1;
                RawMessage {
                    message_id: Some(format!("msg-{}", state.next_id)),
                    body: (*body).to_owned(),
                    receipt_handle: format!("receipt-{}", state.next_id),
                }
            })
            .collect();
        state.batches.push_back(batch.clone());
        batch
    }

    /// Queue an already built batch, e.g. to deliver the same message twice.
    pub fn push_messages(&self, messages: Vec<RawMessage>) {
        lock(&self.state).batches.push_back(messages);
    }

    pub fn pending_batches(&self) -> usize {
        lock(&self.state).batches.len()
    }

    pub fn deleted(&self) -> Vec<RawMessage> {
        lock(&self.state).deleted.clone()
    }

    pub fn receive_calls(&self) -> usize {
        lock(&self.state).receive_calls
    }

    pub fn set_failing_receives(&self, failing: bool) {
        self.failing_receives.store(failing, Ordering::SeqCst);
    }

    /// Report deletion of this receipt handle as failed.
    pub fn refuse_delete(&self, receipt_handle: &str) {
        lock(&self.state)
            .undeletable
            .insert(receipt_handle.to_owned());
    }

    pub fn set_depth(&self, depth: QueueDepth) {
        lock(&self.state).depth = depth;
    }

    pub fn set_receive_latency(&self, latency: Duration) {
        lock(&self.state).receive_latency = latency;
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<RawMessage>, SourceError> {
        let latency = lock(&self.state).receive_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let batch = {
            let mut state = lock(&self.state);
            state.receive_calls += 1;
            if self.failing_receives.load(Ordering::SeqCst) {
                return Err(SourceError::ReceiveError("queue unavailable".to_owned()));
            }
            state.batches.pop_front()
        };

        match batch {
            Some(mut batch) => {
                batch.truncate(options.max_messages.max(0) as usize);
                Ok(batch)
            }
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_batch(&self, messages: &[RawMessage]) -> Result<DeleteReport, SourceError> {
        let mut state = lock(&self.state);
        let mut report = DeleteReport::default();

        for message in messages {
            if state.undeletable.contains(&message.receipt_handle) {
                report.failed.push(
                    message
                        .message_id
                        .clone()
                        .unwrap_or_else(|| message.receipt_handle.clone()),
                );
            } else {
                state.deleted.push(message.clone());
                report.deleted += 1;
            }
        }

        Ok(report)
    }

    async fn queue_depth(&self) -> Result<QueueDepth, SourceError> {
        Ok(lock(&self.state).depth)
    }
}

#[derive(Default)]
struct SinkState {
    batches: Vec<Vec<DataPoint>>,
    deletes: Vec<(String, DateTime<Utc>, DateTime<Utc>)>,
    queries: Vec<RangeQuery>,
    query_csv: Vec<String>,
}

/// A time-series store keeping every successful write in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
    failing: Arc<AtomicBool>,
    write_attempts: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful `write_batch` call, in order.
    pub fn batches(&self) -> Vec<Vec<DataPoint>> {
        lock(&self.state).batches.clone()
    }

    /// Every point written so far, in write order.
    pub fn points(&self) -> Vec<DataPoint> {
        lock(&self.state).batches.concat()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deletes(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        lock(&self.state).deletes.clone()
    }

    pub fn queries(&self) -> Vec<RangeQuery> {
        lock(&self.state).queries.clone()
    }

    /// Annotated CSV bodies merged into the result of every `query` call.
    pub fn set_query_csv(&self, bodies: &[&str]) {
        lock(&self.state).query_csv = bodies.iter().map(|body| (*body).to_owned()).collect();
    }

    fn check_available(&self) -> Result<(), SinkError> {
        match self.failing.load(Ordering::SeqCst) {
            true => Err(SinkError::StatusError {
                status: 503,
                body: "store unavailable".to_owned(),
            }),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write_batch(&self, points: &[DataPoint]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        lock(&self.state).batches.push(points.to_vec());
        Ok(())
    }

    async fn delete_range(
        &self,
        measurement: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.check_available()?;

        let mut state = lock(&self.state);
        state.deletes.push((measurement.to_owned(), start, stop));
        for batch in state.batches.iter_mut() {
            batch.retain(|point| {
                point.measurement != measurement
                    || point.timestamp < start
                    || point.timestamp > stop
            });
        }
        Ok(())
    }

    async fn query(&self, query: &RangeQuery) -> Result<QueryResult, SinkError> {
        self.check_available()?;

        let mut state = lock(&self.state);
        state.queries.push(query.clone());

        let mut merger = RowMerger::new();
        for body in state.query_csv.iter() {
            merger.merge_csv(body)?;
        }
        Ok(merger.finish())
    }
}
