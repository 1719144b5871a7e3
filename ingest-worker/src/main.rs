//! Poll telemetry messages from SQS, buffer them as points and flush them to InfluxDB.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ingest_common::buffer::IngestionBuffer;
use ingest_common::dedup::{DeduplicationGate, RedisDedupStore};
use ingest_common::health::HealthRegistry;
use ingest_common::metrics::setup_metrics_recorder;
use ingest_common::sink::{InfluxSink, TimeSeriesSink};
use ingest_common::source::{ReceiveOptions, SqsSource};
use ingest_worker::config::Config;
use ingest_worker::flusher::BufferFlusher;
use ingest_worker::handlers::{app, AppState};
use ingest_worker::pipeline::{Pipeline, PipelineSettings};
use ingest_worker::worker::PollWorker;

async fn shutdown() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = terminate => {},
        _ = signal::ctrl_c() => {},
    };

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    let recorder_handle = match config.export_prometheus {
        true => Some(setup_metrics_recorder().wrap_err("failed to install metrics recorder")?),
        false => None,
    };

    let source = Arc::new(
        SqsSource::from_env(
            config.sqs.queue_url.as_str(),
            &config.sqs.region,
            config.sqs.credentials(),
            config.sqs.endpoint.clone(),
        )
        .await,
    );

    let sink: Arc<dyn TimeSeriesSink> = Arc::new(
        InfluxSink::new(
            &config.influx.url,
            config.influx.org.as_str(),
            config.influx.bucket.as_str(),
            config.influx.token.as_str(),
            config.influx.request_timeout.0,
        )
        .wrap_err("failed to create influx client")?,
    );

    let buffer = Arc::new(IngestionBuffer::new());
    let pipeline_config = &config.pipeline;

    let mut worker = PollWorker::new(
        "poll-worker",
        source,
        buffer.clone(),
        ReceiveOptions {
            max_messages: pipeline_config.max_messages,
            wait_seconds: pipeline_config.wait_time_secs,
            visibility_timeout_seconds: pipeline_config.visibility_timeout_secs,
        },
        pipeline_config.measurement.as_str(),
    )
    .with_poll_delay(pipeline_config.poll_delay.0);

    if config.dedup.enabled {
        let store = RedisDedupStore::new(&config.dedup.redis_url, config.dedup.command_timeout.0)
            .wrap_err("failed to create redis client")?;
        worker = worker.with_dedup(DeduplicationGate::new(
            Arc::new(store),
            config.dedup.key_prefix.as_str(),
            Duration::from_secs(config.dedup.ttl_secs),
        ));
    } else {
        info!("message deduplication is disabled");
    }

    let flusher = BufferFlusher::new(
        buffer,
        sink.clone(),
        pipeline_config.flush_interval.0,
        pipeline_config.flush_chunk_size,
    );

    let liveness = HealthRegistry::new("liveness");
    let settings = PipelineSettings {
        poll_workers: pipeline_config.poll_workers,
        queue_depth_interval: pipeline_config.queue_depth_interval.0,
        liveness_deadline: PipelineSettings::default().liveness_deadline
            + pipeline_config.poll_delay.0,
    };
    let pipeline =
        Arc::new(Pipeline::new(worker, flusher, settings).with_liveness(liveness.clone()));

    pipeline.start().await?;

    let router = app(
        AppState {
            pipeline: pipeline.clone(),
            sink,
            liveness,
            measurement: pipeline_config.measurement.as_str().to_owned(),
        },
        recorder_handle,
    );

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("failed to bind {}", bind))?;
    info!("listening on {}", bind);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown())
        .await;

    pipeline.stop().await?;
    served?;

    Ok(())
}
