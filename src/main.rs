//! SpotR classifier service - main entry point
//!
//! Serves car classifications over NATS request/reply. The model is loaded
//! lazily on the first prediction and evicted under memory pressure.

use anyhow::{Context, Result};
use async_nats::Subscriber;
use futures::StreamExt;
use spotr_serve::{
    config::{AppConfig, LoggingConfig},
    consumer::RequestConsumer,
    labels::ClassLabelTable,
    memory::PressureMonitor,
    metrics::{MetricsReporter, ServingMetrics},
    models::{host::InferenceHost, loader::SafetensorsLoader},
    producer::ReplyPublisher,
    service::ClassifierService,
    types::{ClearReply, ErrorReply, PredictReply},
    ServeError,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config.logging)?;

    info!("Starting SpotR classifier service");
    info!(
        architecture = %config.model.architecture,
        precision = ?config.model.precision,
        classes = config.model.num_classes,
        pressure_threshold = config.memory.pressure_threshold_percent,
        "Configuration loaded"
    );

    // Label table and declared head width are checked before serving anything
    let labels = Arc::new(
        ClassLabelTable::load(&config.model.labels_path).context("Failed to load class labels")?,
    );
    let loader = SafetensorsLoader::new(
        &config.model.weights_path,
        config.model.architecture,
        config.model.num_classes,
        config.model.precision,
    );
    let host = Arc::new(
        InferenceHost::new(Box::new(loader), labels.clone())
            .context("Class labels do not match the model")?,
    );

    if config.model.warm_up {
        let host = host.clone();
        tokio::task::spawn_blocking(move || host.warm_up())
            .await?
            .context("Model warm-up failed")?;
    } else {
        info!("Model will load on first prediction");
    }

    let metrics = Arc::new(ServingMetrics::new());
    let monitor = PressureMonitor::system(config.memory.pressure_threshold_percent);
    let service = Arc::new(ClassifierService::new(host, monitor).with_metrics(metrics.clone()));

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url).await?;
    info!("Connected to NATS at {}", config.nats.url);

    let publisher = ReplyPublisher::new(client.clone());

    let predictions = RequestConsumer::new(client.clone(), &config.nats.predict_subject)
        .in_queue_group(config.nats.queue_group.as_deref())
        .subscribe()
        .await?;
    let health = RequestConsumer::new(client.clone(), &config.nats.health_subject)
        .subscribe()
        .await?;
    let clears = RequestConsumer::new(client.clone(), &config.nats.clear_subject)
        .subscribe()
        .await?;

    if config.pipeline.metrics_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.metrics_interval_secs);
        tokio::spawn(reporter.start());
    }

    let health_task = tokio::spawn(serve_health(health, service.clone(), publisher.clone()));
    let clear_task = tokio::spawn(serve_clears(clears, service.clone(), publisher.clone()));

    info!(
        workers = config.pipeline.workers,
        "Serving predictions on {}", config.nats.predict_subject
    );

    tokio::select! {
        _ = serve_predictions(
            predictions,
            service,
            publisher,
            metrics.clone(),
            config.pipeline.workers,
        ) => warn!("Prediction subscription closed"),
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    health_task.abort();
    clear_task.abort();

    info!("Service shutting down...");
    metrics.print_summary();

    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("spotr_serve={}", logging.level).parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn serve_predictions(
    mut subscription: Subscriber,
    service: Arc<ClassifierService>,
    publisher: ReplyPublisher,
    metrics: Arc<ServingMetrics>,
    workers: usize,
) {
    // Bounds the number of decoded images and forward passes in memory
    let semaphore = Arc::new(Semaphore::new(workers));

    while let Some(message) = subscription.next().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        let service = service.clone();
        let publisher = publisher.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let request_id = Uuid::new_v4();
            let started = Instant::now();
            let payload = message.payload;
            let payload_bytes = payload.len();

            // Decode, forward pass and pressure check are blocking work
            let outcome = tokio::task::spawn_blocking(move || service.predict(&payload))
                .await
                .unwrap_or_else(|e| {
                    Err(ServeError::Inference(format!("prediction task failed: {}", e)))
                });
            let elapsed = started.elapsed();

            let sent = match outcome {
                Ok(prediction) => {
                    metrics.record_prediction(elapsed, &prediction.label);
                    info!(
                        request_id = %request_id,
                        pred_class = %prediction.label,
                        payload_bytes,
                        latency_ms = elapsed.as_millis() as u64,
                        "Prediction served"
                    );
                    let reply = PredictReply::new(request_id, prediction, elapsed);
                    publisher.reply(message.reply, &reply).await
                }
                Err(e) => {
                    metrics.record_failure(elapsed, e.kind());
                    if e.is_client_error() {
                        warn!(request_id = %request_id, error = %e, "Rejected prediction request");
                    } else {
                        error!(request_id = %request_id, error = %e, "Prediction failed");
                    }
                    publisher
                        .reply(message.reply, &ErrorReply::from_error(request_id, &e))
                        .await
                }
            };

            if let Err(e) = sent {
                error!(request_id = %request_id, error = %e, "Failed to publish reply");
            }

            drop(permit);
        });
    }
}

async fn serve_health(
    mut subscription: Subscriber,
    service: Arc<ClassifierService>,
    publisher: ReplyPublisher,
) {
    while let Some(message) = subscription.next().await {
        let report = service.health();
        if let Err(e) = publisher.reply(message.reply, &report).await {
            error!(error = %e, "Failed to publish health reply");
        }
    }
}

async fn serve_clears(
    mut subscription: Subscriber,
    service: Arc<ClassifierService>,
    publisher: ReplyPublisher,
) {
    while let Some(message) = subscription.next().await {
        let svc = service.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || svc.clear_model()).await {
            error!(error = %e, "Cache clear task failed");
        }
        info!("Model cache cleared on request");

        if let Err(e) = publisher.reply(message.reply, &ClearReply::cleared()).await {
            error!(error = %e, "Failed to publish clear reply");
        }
    }
}
