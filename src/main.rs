mod app_state;
mod config;
mod models;
mod routes;
mod services;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::{AppConfig, RunMode};
use services::classifier::create_classifier;
use services::failure_tracker::FailureTracker;
use services::immich::{ImmichClient, RetryPolicy};
use services::orchestrator::{Orchestrator, OrchestratorOptions};
use services::scheduler::{LastRunStore, Scheduler};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(mode = ?config.run_mode, "Initializing immich-autotag");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "immich_api_requests_total",
        "Total requests sent to the Immich API"
    );
    metrics::describe_histogram!(
        "immich_api_request_seconds",
        "Latency of Immich API requests"
    );
    metrics::describe_counter!("assets_processed_total", "Assets successfully tagged");
    metrics::describe_counter!("tags_assigned_total", "Tags assigned to assets");
    metrics::describe_counter!("assets_failed_total", "Assets that failed processing");
    metrics::describe_counter!("batches_processed_total", "Batches completed");
    metrics::describe_counter!("immich_tag_cache_hits_total", "Tag lookups served from cache");
    metrics::describe_counter!(
        "immich_tag_cache_misses_total",
        "Tag lookups that missed the cache"
    );
    metrics::describe_counter!("immich_tags_created_total", "Tags created on the server");
    metrics::describe_histogram!(
        "asset_processing_seconds",
        "Time to process a single asset end to end"
    );

    // Initialize the tagging model; a broken model setup is a startup failure,
    // not something to discover mid-batch.
    let classifier = create_classifier(&config).expect("Failed to initialize tagging model");
    tracing::info!(model = classifier.name(), "tagging model ready");

    let libraries = config.libraries().expect("Invalid library configuration");
    let client = ImmichClient::new(
        &config.immich_base_url,
        libraries,
        RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
        },
        Duration::from_secs(config.request_timeout_secs),
        Duration::from_secs(config.tag_cache_ttl_secs),
    )
    .expect("Failed to initialize Immich client");

    let tracker = FailureTracker::new(&config.failure_file, config.failure_threshold);

    let orchestrator = Orchestrator::new(
        client,
        classifier,
        tracker,
        OrchestratorOptions::from_config(&config),
    );
    let stop = orchestrator.stop_handle();
    let orchestrator = Arc::new(Mutex::new(orchestrator));

    // Health/metrics surface runs in every mode.
    let state = AppState::new(
        Arc::clone(&orchestrator),
        Duration::from_secs(config.health_probe_ttl_secs),
    );
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind health server address");
    tracing::info!(%bind_addr, "health server listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "health server exited");
        }
    });

    // Ctrl-C requests a stop; the loop honors it between assets.
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    match config.run_mode {
        RunMode::Single => {
            // One fetch+process transition per library, then exit.
            orchestrator.lock().await.run_all_libraries(Some(1)).await;
        }
        RunMode::Continuous => {
            // Runs until every library reports an empty page (or the cycle
            // cap); an empty page is terminal success, not a reason to poll.
            orchestrator
                .lock()
                .await
                .run_all_libraries(config.max_cycles)
                .await;
        }
        RunMode::Scheduled => {
            let scheduler = Scheduler::new(
                &config.cron_schedule,
                &config.timezone,
                config.schedule_lookback_hours,
            )
            .expect("Invalid schedule configuration");
            let state = LastRunStore::new(
                std::path::Path::new(&config.failure_file).with_file_name("scheduler_last_run.json"),
            );
            scheduler
                .run(state, Arc::clone(&orchestrator), Arc::clone(&stop))
                .await;
        }
        RunMode::HealthOnly => {
            tracing::info!("running health server only");
            while !stop.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    tracing::info!("immich-autotag stopped");
}
