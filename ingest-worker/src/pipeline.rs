use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingest_common::buffer::IngestionBuffer;
use ingest_common::health::HealthRegistry;
use ingest_common::metrics::{BUFFER_DEPTH, QUEUE_DEPTH};
use ingest_common::source::MessageSource;

use crate::error::{PipelineError, WorkerError};
use crate::flusher::BufferFlusher;
use crate::worker::{CycleReport, PollWorker};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub poll_workers: usize,
    pub queue_depth_interval: Duration,
    /// How long a worker or the flusher may go without reporting before it is `Stalled`.
    pub liveness_deadline: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_workers: 30,
            queue_depth_interval: Duration::from_secs(10),
            liveness_deadline: Duration::from_secs(60),
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    /// Cancelled only once every worker has returned.
    flusher_shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    flusher: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

/// Owns the poll workers, the flusher and the queue depth reporter.
///
/// The units only share the buffer and are otherwise independent tasks. Stopping cancels
/// the workers and waits for each to finish its current cycle. Only then is the flusher
/// cancelled, so its final drain sees every point the last cycles buffered.
pub struct Pipeline {
    worker: PollWorker,
    flusher: BufferFlusher,
    settings: PipelineSettings,
    liveness: Option<HealthRegistry>,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    /// `worker` is the template every pool worker is cloned from.
    pub fn new(worker: PollWorker, flusher: BufferFlusher, settings: PipelineSettings) -> Self {
        Self {
            worker,
            flusher,
            settings,
            liveness: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_liveness(mut self, liveness: HealthRegistry) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn buffer(&self) -> &Arc<IngestionBuffer> {
        self.worker.buffer()
    }

    pub fn buffer_depth(&self) -> usize {
        self.buffer().len()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn every unit and return without waiting for them.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let flusher_shutdown = CancellationToken::new();

        let mut workers = Vec::with_capacity(self.settings.poll_workers);
        for index in 0..self.settings.poll_workers {
            let worker = self.worker.named(&format!("poll-worker-{}", index));
            let liveness = match self.liveness {
                Some(ref registry) => Some(
                    registry
                        .register(worker.name(), self.settings.liveness_deadline)
                        .await,
                ),
                None => None,
            };
            workers.push(tokio::spawn(worker.run(liveness, shutdown.child_token())));
        }

        let flusher_liveness = match self.liveness {
            Some(ref registry) => Some(
                registry
                    .register("flusher", self.settings.liveness_deadline)
                    .await,
            ),
            None => None,
        };
        let flusher = tokio::spawn(
            self.flusher
                .clone()
                .run(flusher_liveness, flusher_shutdown.clone()),
        );

        let reporter = tokio::spawn(report_queue_depth(
            self.worker.source().clone(),
            self.buffer().clone(),
            self.settings.queue_depth_interval,
            shutdown.child_token(),
        ));

        info!(
            workers = self.settings.poll_workers,
            "ingestion pipeline started"
        );
        *running = Some(Running {
            shutdown,
            flusher_shutdown,
            workers,
            flusher,
            reporter,
        });

        Ok(())
    }

    /// Stop every unit. Stopping a pipeline that is not running does nothing.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("stopping ingestion pipeline");
        running.shutdown.cancel();

        let mut result = Ok(());
        for worker in running.workers {
            if let Err(e) = worker.await {
                error!("poll worker task failed: {}", e);
                result = Err(PipelineError::TaskPanicked(e));
            }
        }

        running.flusher_shutdown.cancel();
        if let Err(e) = running.flusher.await {
            error!("flusher task failed: {}", e);
            result = Err(PipelineError::TaskPanicked(e));
        }

        if let Err(e) = running.reporter.await {
            warn!("queue depth reporter task failed: {}", e);
        }

        info!(
            remaining = self.buffer_depth(),
            "ingestion pipeline stopped"
        );
        result
    }

    /// Run a single poll cycle now, independently of the pool.
    pub async fn ingest_once(&self) -> Result<CycleReport, WorkerError> {
        self.worker.named("ingest-once").run_cycle().await
    }
}

/// Log and export the approximate queue depth every `interval`. Never affects ingestion.
async fn report_queue_depth(
    source: Arc<dyn MessageSource>,
    buffer: Arc<IngestionBuffer>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        metrics::gauge!(BUFFER_DEPTH).set(buffer.len() as f64);

        match source.queue_depth().await {
            Ok(depth) => {
                info!(
                    total = depth.total,
                    in_flight = depth.in_flight,
                    delayed = depth.delayed,
                    buffered = buffer.len(),
                    "queue depth"
                );
                metrics::gauge!(QUEUE_DEPTH, "state" => "visible").set(depth.total as f64);
                metrics::gauge!(QUEUE_DEPTH, "state" => "in_flight").set(depth.in_flight as f64);
                metrics::gauge!(QUEUE_DEPTH, "state" => "delayed").set(depth.delayed as f64);
            }
            Err(e) => warn!("failed to read queue depth: {}", e),
        }
    }
}
