//! Docflow Worker
//!
//! Consumes tasks from the task queue:
//! 1. Receives index and query tasks
//! 2. Runs the indexing pipeline or the two-pass query pipeline
//! 3. Records progress and the terminal state on the job row
//! 4. Acknowledges the task once the job is terminal

mod dispatcher;

use crate::dispatcher::{TaskDispatcher, Worker};
use docflow_common::{
    completion::{create_completion_model, CompletionClient},
    config::{AppConfig, ObservabilityConfig},
    db::{DbPool, PgRecordStore, RecordStore},
    embeddings::{create_embedder, EmbeddingClient},
    metrics::{register_metrics, JOB_BUCKETS, METRICS_PREFIX, PROVIDER_BUCKETS},
    queue::{SqsTaskQueue, TaskQueue},
    storage::create_content_store,
    tokens::{TiktokenTokenizer, Tokenizer},
    VERSION,
};
use docflow_context::{GeneratorConfig, QueryProcessor, SuggestionCreator, TwoPassGenerator};
use docflow_ingestion::{GitFetcher, IndexingOrchestrator, TokenChunker};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config.observability);
    info!("Starting Docflow Worker v{}", VERSION);

    if config.observability.metrics_port != 0 {
        install_metrics(config.observability.metrics_port)?;
        info!(port = config.observability.metrics_port, "Prometheus exporter listening");
    }

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    db.ping().await?;
    if config.database.run_migrations {
        db.migrate(&config.database.migrations_dir).await?;
    }
    let records: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(db));

    let content = create_content_store(&config.storage)?;
    let embedder = create_embedder(&config.embedding)?;
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(TiktokenTokenizer::cl100k()?);
    let embeddings = EmbeddingClient::from_config(embedder, tokenizer.clone(), &config.embedding);

    info!(
        model = %embeddings.model_name(),
        dimension = embeddings.dimension(),
        "Embedder initialized"
    );

    let chunker = TokenChunker::new(
        tokenizer,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
    )?;
    let indexing = IndexingOrchestrator::new(
        records.clone(),
        content.clone(),
        embeddings.clone(),
        chunker,
        Arc::new(GitFetcher::new(config.indexing.git_host.clone())),
        config.storage.bucket.clone(),
        config.indexing.clone(),
    )
    .with_lookback(config.chunking.lookback_chars);

    let completion = CompletionClient::from_config(
        create_completion_model(&config.completion)?,
        &config.completion,
    );
    let generator = TwoPassGenerator::new(
        records.clone(),
        content.clone(),
        embeddings,
        completion,
        GeneratorConfig::from_app_config(&config),
    );
    info!(model = %generator.model_name(), "Completion model initialized");

    let creator = SuggestionCreator::new(
        records.clone(),
        content,
        config.storage.bucket.clone(),
        config.generation.confidence,
    );
    let dispatcher = TaskDispatcher::new(indexing, QueryProcessor::new(records, generator, creator));

    let queue: Arc<dyn TaskQueue> = match &config.queue.task_queue_url {
        Some(url) => {
            info!(url = %url, "Connecting to task queue...");
            Arc::new(SqsTaskQueue::new(&config.queue).await?)
        }
        None => {
            warn!("queue.task_queue_url not set, waiting for shutdown signal...");
            tokio::signal::ctrl_c().await?;
            info!("Docflow worker shutting down");
            return Ok(());
        }
    };

    info!("Worker ready, starting queue polling...");
    Worker::new(queue, dispatcher)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    info!("Docflow worker shutting down");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Serve `/metrics` on `port` and describe the pipeline metrics
fn install_metrics(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let provider_latency = [
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        format!("{}_completion_duration_seconds", METRICS_PREFIX),
    ];
    let job_latency = [
        format!("{}_index_duration_seconds", METRICS_PREFIX),
        format!("{}_query_duration_seconds", METRICS_PREFIX),
    ];

    let mut builder = PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port));
    for name in provider_latency {
        builder = builder.set_buckets_for_metric(Matcher::Full(name), PROVIDER_BUCKETS)?;
    }
    for name in job_latency {
        builder = builder.set_buckets_for_metric(Matcher::Full(name), JOB_BUCKETS)?;
    }
    builder.install()?;

    register_metrics();
    Ok(())
}
