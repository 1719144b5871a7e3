use std::sync::Arc;
use std::time::Duration;

use ingest_common::buffer::IngestionBuffer;
use ingest_common::dedup::{DeduplicationGate, DEFAULT_KEY_PREFIX};
use ingest_common::point::FieldValue;
use ingest_common::source::ReceiveOptions;
use ingest_common::test_utils::{MemorySink, MemorySource, MockDedupStore};
use ingest_worker::flusher::{BufferFlusher, FlushOutcome};
use ingest_worker::pipeline::{Pipeline, PipelineSettings};
use ingest_worker::worker::PollWorker;

const READING: &str = r#"{"gw": {"id": "gw-1"}, "machines": [{"position": [{"detail": {"machine_id": "18260", "temperature": 30.2, "command_id": "c-1"}}]}]}"#;

struct Harness {
    source: MemorySource,
    sink: MemorySink,
    store: MockDedupStore,
    buffer: Arc<IngestionBuffer>,
    worker: PollWorker,
    flusher: BufferFlusher,
}

fn harness() -> Harness {
    let source = MemorySource::new();
    let sink = MemorySink::new();
    let store = MockDedupStore::new();
    let buffer = Arc::new(IngestionBuffer::new());

    let worker = PollWorker::new(
        "poll-worker",
        Arc::new(source.clone()),
        buffer.clone(),
        ReceiveOptions::default(),
        "temperature",
    )
    .with_dedup(DeduplicationGate::new(
        Arc::new(store.clone()),
        DEFAULT_KEY_PREFIX,
        Duration::from_secs(3600),
    ));
    let flusher = BufferFlusher::new(
        buffer.clone(),
        Arc::new(sink.clone()),
        Duration::from_millis(20),
        1000,
    );

    Harness {
        source,
        sink,
        store,
        buffer,
        worker,
        flusher,
    }
}

#[tokio::test]
async fn two_messages_end_up_in_one_write() {
    let h = harness();
    let delivered = h.source.push_batch(&[READING, READING.replace("c-1", "c-2").as_str()]);

    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.buffered, 2);
    assert_eq!(h.buffer.len(), 2);

    assert_eq!(h.flusher.flush_once().await, FlushOutcome::Flushed(2));

    let batches = h.sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    for point in batches[0].iter() {
        assert_eq!(point.measurement, "temperature");
        assert_eq!(point.tags["machine_id"], "18260");
        assert_eq!(point.fields["temperature"], FieldValue::Float(30.2));
    }
    assert_eq!(h.source.deleted(), delivered);
    assert!(h.buffer.is_empty());
}

#[tokio::test]
async fn redelivery_within_ttl_is_written_once() {
    let h = harness();
    let delivered = h.source.push_batch(&[READING]);
    h.source.push_messages(delivered);

    h.worker.run_cycle().await.unwrap();
    let second = h.worker.run_cycle().await.unwrap();
    h.flusher.drain().await;

    assert_eq!(second.duplicates, 1);
    assert_eq!(h.sink.points().len(), 1);
    assert_eq!(h.source.deleted().len(), 2);
}

#[tokio::test]
async fn redelivery_after_ttl_is_written_again() {
    let h = harness();
    let delivered = h.source.push_batch(&[READING]);
    h.source.push_messages(delivered);

    h.worker.run_cycle().await.unwrap();
    h.store.expire_all();
    h.worker.run_cycle().await.unwrap();
    h.flusher.drain().await;

    assert_eq!(h.sink.points().len(), 2);
}

#[tokio::test]
async fn malformed_message_does_not_stop_the_cycle() {
    let h = harness();
    h.source.push_batch(&[READING, "\u{0}garbage", r#"{"machines": 3}"#, READING]);

    let report = h.worker.run_cycle().await.unwrap();

    assert_eq!(report.received, 4);
    assert_eq!(report.malformed, 1);
    // Identical bodies: the second copy is a duplicate of the first.
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.buffered, 1);
    assert_eq!(report.deleted, 4);
}

#[tokio::test]
async fn sink_outage_keeps_points_in_order() {
    let h = harness();
    let bodies: Vec<String> = (0..3)
        .map(|i| READING.replace("c-1", &format!("c-{}", i)))
        .collect();
    let bodies: Vec<&str> = bodies.iter().map(String::as_str).collect();
    h.source.push_batch(&bodies);
    h.worker.run_cycle().await.unwrap();

    h.sink.set_failing(true);
    assert_eq!(h.flusher.flush_once().await, FlushOutcome::Failed(3));
    assert_eq!(h.flusher.flush_once().await, FlushOutcome::Failed(3));
    assert_eq!(h.buffer.len(), 3);

    h.sink.set_failing(false);
    assert_eq!(h.flusher.flush_once().await, FlushOutcome::Flushed(3));

    let commands: Vec<FieldValue> = h
        .sink
        .points()
        .iter()
        .map(|p| p.fields["command_id"].clone())
        .collect();
    assert_eq!(
        commands,
        vec![
            FieldValue::String("c-0".to_owned()),
            FieldValue::String("c-1".to_owned()),
            FieldValue::String("c-2".to_owned()),
        ]
    );
}

#[tokio::test]
async fn many_points_take_three_flushes() {
    let h = harness();
    for batch in 0..250 {
        let bodies: Vec<String> = (0..10)
            .map(|i| READING.replace("c-1", &format!("c-{}-{}", batch, i)))
            .collect();
        let bodies: Vec<&str> = bodies.iter().map(String::as_str).collect();
        h.source.push_batch(&bodies);
    }
    while h.source.pending_batches() > 0 {
        h.worker.run_cycle().await.unwrap();
    }
    assert_eq!(h.buffer.len(), 2500);

    let mut flushes = 0;
    while h.flusher.flush_once().await != FlushOutcome::Idle {
        flushes += 1;
    }

    assert_eq!(flushes, 3);
    assert_eq!(h.sink.points().len(), 2500);
}

#[tokio::test]
async fn pool_ingests_everything_and_stop_drains() {
    let h = harness();
    for batch in 0..20 {
        let bodies: Vec<String> = (0..5)
            .map(|i| READING.replace("c-1", &format!("c-{}-{}", batch, i)))
            .collect();
        let bodies: Vec<&str> = bodies.iter().map(String::as_str).collect();
        h.source.push_batch(&bodies);
    }

    let pipeline = Pipeline::new(
        h.worker.clone(),
        h.flusher.clone(),
        PipelineSettings {
            poll_workers: 4,
            ..Default::default()
        },
    );
    pipeline.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.source.deleted().len() < 100 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pipeline.stop().await.unwrap();

    assert_eq!(h.source.deleted().len(), 100);
    assert_eq!(h.sink.points().len(), 100);
    assert_eq!(pipeline.buffer_depth(), 0);
    assert_eq!(h.store.keys().len(), 100);
}

#[tokio::test]
async fn stop_during_a_long_poll_loses_nothing_deleted() {
    let h = harness();
    h.source.set_receive_latency(Duration::from_millis(300));
    for i in 0..4 {
        h.source
            .push_batch(&[READING.replace("c-1", &format!("c-{}", i)).as_str()]);
    }

    let pipeline = Pipeline::new(
        h.worker.clone(),
        h.flusher.clone(),
        PipelineSettings {
            poll_workers: 2,
            ..Default::default()
        },
    );
    pipeline.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline.stop().await.unwrap();

    assert_eq!(h.source.deleted().len(), 2);
    assert_eq!(h.sink.points().len(), h.source.deleted().len());
    assert_eq!(pipeline.buffer_depth(), 0);
}
