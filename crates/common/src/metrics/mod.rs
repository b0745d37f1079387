//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the indexing and query pipelines
//! with standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all Docflow metrics
pub const METRICS_PREFIX: &str = "docflow";

/// Buckets for provider latency (embedding and completion calls)
pub const PROVIDER_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 60s
];

/// Buckets for whole-job latency
pub const JOB_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

/// Register all metric descriptions
pub fn register_metrics() {
    // Provider metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API errors"
    );

    describe_counter!(
        format!("{}_completion_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total completion API requests"
    );

    describe_histogram!(
        format!("{}_completion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Completion latency in seconds"
    );

    // Search metrics
    describe_counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of search queries by retrieval mode"
    );

    describe_histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Search latency in seconds"
    );

    describe_gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of results returned from search"
    );

    describe_counter!(
        format!("{}_elbow_cutoffs_total", METRICS_PREFIX),
        Unit::Count,
        "Elbow cutoffs computed by method"
    );

    describe_gauge!(
        format!("{}_elbow_cutoff_count", METRICS_PREFIX),
        Unit::Count,
        "Most recent elbow cutoff"
    );

    // Pipeline metrics
    describe_counter!(
        format!("{}_chunks_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks ensured, by outcome (created or reused)"
    );

    describe_counter!(
        format!("{}_index_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Index jobs finished, by mode and status"
    );

    describe_histogram!(
        format!("{}_index_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Index job latency in seconds"
    );

    describe_counter!(
        format!("{}_query_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Query jobs finished, by status"
    );

    describe_counter!(
        format!("{}_suggestions_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total suggestions persisted"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Query job latency in seconds"
    );

    tracing::info!("Metrics registered");
}

fn status_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status_label(success)
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string(),
            "batched" => (batch_size > 1).to_string()
        )
        .record(duration_secs);
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Helper to record completion metrics
pub fn record_completion(duration_secs: f64, model: &str, success: bool) {
    counter!(
        format!("{}_completion_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status_label(success)
    )
    .increment(1);

    histogram!(
        format!("{}_completion_duration_seconds", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .record(duration_secs);
}

/// Helper to record search metrics
pub fn record_search(duration_secs: f64, mode: &str, result_count: usize) {
    counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .set(result_count as f64);
}

/// Helper to record an elbow cutoff decision
pub fn record_elbow(method: &str, count: usize) {
    counter!(
        format!("{}_elbow_cutoffs_total", METRICS_PREFIX),
        "method" => method.to_string()
    )
    .increment(1);

    gauge!(format!("{}_elbow_cutoff_count", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record a chunk ensure outcome
pub fn record_chunk(created: bool) {
    let outcome = if created { "created" } else { "reused" };
    counter!(
        format!("{}_chunks_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

/// Helper to record a finished index job
pub fn record_indexing(duration_secs: f64, soft: bool, success: bool) {
    let mode = if soft { "soft" } else { "hard" };
    counter!(
        format!("{}_index_jobs_total", METRICS_PREFIX),
        "mode" => mode,
        "status" => status_label(success)
    )
    .increment(1);

    histogram!(
        format!("{}_index_duration_seconds", METRICS_PREFIX),
        "mode" => mode
    )
    .record(duration_secs);
}

/// Helper to record a finished query job
pub fn record_query(duration_secs: f64, suggestions_created: usize, success: bool) {
    counter!(
        format!("{}_query_jobs_total", METRICS_PREFIX),
        "status" => status_label(success)
    )
    .increment(1);

    counter!(format!("{}_suggestions_created_total", METRICS_PREFIX))
        .increment(suggestions_created as u64);

    histogram!(format!("{}_query_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}
