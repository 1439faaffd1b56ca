//! Integration tests against an in-process mock Immich server.
//!
//! The mock speaks just enough of the Immich HTTP API for the client and
//! batch processor to run end to end: metadata search, tag listing and
//! creation, bulk tagging, thumbnail download. Call counters let tests
//! assert on how often each endpoint was hit.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;

use immich_autotag::config::LibraryConfig;
use immich_autotag::models::TagPrediction;
use immich_autotag::services::classifier::{Classifier, ClassifierError};
use immich_autotag::services::failure_tracker::FailureTracker;
use immich_autotag::services::immich::{ImmichClient, RetryPolicy};
use immich_autotag::services::orchestrator::{Orchestrator, OrchestratorOptions};
use immich_autotag::services::processor::BatchProcessor;

#[derive(Clone)]
struct MockState {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    tags: Vec<serde_json::Value>,
    assets: Vec<serde_json::Value>,
    next_tag_id: usize,
    list_calls: usize,
    create_calls: usize,
    search_calls: usize,
    bulk_tag_calls: usize,
    failing_tag_names: HashSet<String>,
    search_failures_remaining: usize,
}

impl MockState {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                tags: Vec::new(),
                assets: Vec::new(),
                next_tag_id: 1,
                list_calls: 0,
                create_calls: 0,
                search_calls: 0,
                bulk_tag_calls: 0,
                failing_tag_names: HashSet::new(),
                search_failures_remaining: 0,
            })),
        }
    }

    fn seed_tag(&self, id: &str, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .tags
            .push(json!({"id": id, "name": name, "value": name}));
    }
}

async fn search_metadata(State(state): State<MockState>) -> impl IntoResponse {
    let mut inner = state.inner.lock().unwrap();
    inner.search_calls += 1;
    if inner.search_failures_remaining > 0 {
        inner.search_failures_remaining -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
    }
    let items = inner.assets.clone();
    let total = items.len();
    Json(json!({"assets": {"items": items, "total": total}})).into_response()
}

async fn list_tags(State(state): State<MockState>) -> impl IntoResponse {
    let mut inner = state.inner.lock().unwrap();
    inner.list_calls += 1;
    Json(inner.tags.clone())
}

async fn create_tag(
    State(state): State<MockState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let mut inner = state.inner.lock().unwrap();
    inner.create_calls += 1;
    let name = body["name"].as_str().unwrap_or_default().to_string();
    if inner.failing_tag_names.contains(&name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "tag rejected"})),
        )
            .into_response();
    }
    if inner
        .tags
        .iter()
        .any(|t| t["name"].as_str() == Some(name.as_str()))
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": format!("tag '{name}' already exists")})),
        )
            .into_response();
    }
    let tag = json!({"id": format!("t{}", inner.next_tag_id), "name": name, "value": name});
    inner.next_tag_id += 1;
    inner.tags.push(tag.clone());
    Json(tag).into_response()
}

async fn bulk_tag(State(state): State<MockState>) -> impl IntoResponse {
    state.inner.lock().unwrap().bulk_tag_calls += 1;
    Json(json!([]))
}

async fn delete_tag_by_id(
    State(state): State<MockState>,
    Path(tag_id): Path<String>,
) -> impl IntoResponse {
    let mut inner = state.inner.lock().unwrap();
    inner.tags.retain(|t| t["id"].as_str() != Some(tag_id.as_str()));
    StatusCode::OK
}

async fn untag_asset(Path((_tag_id, _asset_id)): Path<(String, String)>) -> impl IntoResponse {
    StatusCode::OK
}

async fn get_asset_by_id(
    State(state): State<MockState>,
    Path(asset_id): Path<String>,
) -> impl IntoResponse {
    let inner = state.inner.lock().unwrap();
    match inner
        .assets
        .iter()
        .find(|a| a["id"].as_str() == Some(asset_id.as_str()))
    {
        Some(asset) => Json(asset.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn thumbnail(Path(_id): Path<String>) -> impl IntoResponse {
    // Content does not matter; the test classifiers never decode it.
    vec![0xFFu8, 0xD8, 0xFF, 0xE0]
}

async fn current_user() -> impl IntoResponse {
    Json(json!({"id": "u1", "name": "Test User", "email": "test@example.com"}))
}

/// Spawn the mock server on an ephemeral port and return its state handle
/// plus the bound address.
async fn spawn_mock_server() -> (MockState, SocketAddr) {
    let state = MockState::new();
    let app = Router::new()
        .route("/api/search/metadata", post(search_metadata))
        .route("/api/tags", get(list_tags).post(create_tag))
        .route("/api/tags/assets", put(bulk_tag))
        .route("/api/tags/{tag_id}", delete(delete_tag_by_id))
        .route("/api/tags/{tag_id}/assets/{asset_id}", delete(untag_asset))
        .route("/api/assets/{id}", get(get_asset_by_id))
        .route("/api/assets/{id}/thumbnail", get(thumbnail))
        .route("/api/users/me", get(current_user))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

fn test_client(addr: SocketAddr) -> ImmichClient {
    ImmichClient::new(
        &format!("http://{addr}"),
        vec![LibraryConfig {
            name: "default".to_string(),
            api_key: "test-key".to_string(),
        }],
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        },
        Duration::from_secs(5),
        Duration::from_secs(300),
    )
    .unwrap()
}

struct FixedClassifier {
    predictions: Vec<TagPrediction>,
}

#[async_trait]
impl Classifier for FixedClassifier {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn classify(&self, _image: &[u8]) -> Result<Vec<TagPrediction>, ClassifierError> {
        Ok(self.predictions.clone())
    }
}

struct FailingClassifier;

#[async_trait]
impl Classifier for FailingClassifier {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn classify(&self, _image: &[u8]) -> Result<Vec<TagPrediction>, ClassifierError> {
        Err(ClassifierError::Inference("model exploded".to_string()))
    }
}

#[tokio::test]
async fn batch_counts_processed_skipped_and_unsupported() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t-marker", "auto:processed");
    {
        let mut inner = mock.inner.lock().unwrap();
        inner.assets = vec![
            json!({"id": "a1", "type": "IMAGE", "originalFileName": "fresh.jpg", "tags": []}),
            json!({"id": "a2", "type": "IMAGE", "originalFileName": "done.jpg",
                   "tags": [{"id": "t-marker", "name": "auto:processed"}]}),
            json!({"id": "a3", "type": "VIDEO", "originalFileName": "clip.mp4", "tags": []}),
        ];
    }

    let mut client = test_client(addr);
    let assets = client.fetch_untagged_page().await.unwrap();
    assert_eq!(assets.len(), 3);

    let dir = tempfile::tempdir().unwrap();
    let mut tracker = FailureTracker::new(dir.path().join("failures.json"), 3);
    let classifier = FixedClassifier {
        predictions: vec![
            TagPrediction {
                name: "sunset".to_string(),
                confidence: 0.92,
            },
            TagPrediction {
                name: "beach".to_string(),
                confidence: 0.81,
            },
            TagPrediction {
                name: "blurry".to_string(),
                confidence: 0.05,
            },
        ],
    };

    let processor = BatchProcessor::new(0.35, "auto:processed");
    let marker = client.get_or_create_tag("auto:processed").await.unwrap();
    let stop = AtomicBool::new(false);
    let stats = processor
        .process_batch(&mut client, &classifier, &mut tracker, &assets, &marker, &stop)
        .await;

    assert_eq!(stats.batch_size, 3);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.unsupported, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.labels_assigned, 2);

    // Neither the skipped nor the unsupported asset touches the tracker.
    assert_eq!(tracker.summary().total_failed_assets, 0);
}

#[tokio::test]
async fn classification_failure_is_recorded_not_fatal() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t-marker", "auto:processed");
    {
        let mut inner = mock.inner.lock().unwrap();
        inner.assets = vec![
            json!({"id": "a1", "type": "IMAGE", "originalFileName": "one.jpg", "tags": []}),
            json!({"id": "a2", "type": "IMAGE", "originalFileName": "two.jpg", "tags": []}),
        ];
    }

    let mut client = test_client(addr);
    let assets = client.fetch_untagged_page().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut tracker = FailureTracker::new(dir.path().join("failures.json"), 3);
    let processor = BatchProcessor::new(0.35, "auto:processed");
    let marker = client.get_or_create_tag("auto:processed").await.unwrap();
    let stop = AtomicBool::new(false);
    let stats = processor
        .process_batch(
            &mut client,
            &FailingClassifier,
            &mut tracker,
            &assets,
            &marker,
            &stop,
        )
        .await;

    assert_eq!(stats.failed, 2);
    assert_eq!(stats.processed, 0);

    let summary = tracker.summary();
    assert_eq!(summary.total_failed_assets, 2);
    assert_eq!(summary.retry_candidates, 2);
    assert_eq!(summary.permanently_failed, 0);
}

#[tokio::test]
async fn existing_tag_is_matched_case_insensitively() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t1", "Sunset");

    let mut client = test_client(addr);
    let tag = client.get_or_create_tag("sunset").await.unwrap();
    assert_eq!(tag.id, "t1");
    assert_eq!(tag.name, "Sunset");

    let inner = mock.inner.lock().unwrap();
    assert_eq!(inner.create_calls, 0, "existing tag must not be re-created");
}

#[tokio::test]
async fn bulk_resolution_refreshes_once_and_creates_misses() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t1", "existing");

    let mut client = test_client(addr);
    let names = vec![
        "existing".to_string(),
        "new-one".to_string(),
        "new-two".to_string(),
    ];
    let resolved = client.get_or_create_tags_bulk(&names).await.unwrap();
    assert_eq!(resolved.len(), 3);
    assert_eq!(resolved["existing"].id, "t1");

    let inner = mock.inner.lock().unwrap();
    assert_eq!(inner.list_calls, 1, "one refresh for the whole bulk pass");
    assert_eq!(inner.create_calls, 2, "only the misses are created");
}

#[tokio::test]
async fn bulk_resolution_survives_individual_create_failures() {
    let (mock, addr) = spawn_mock_server().await;
    mock.inner
        .lock()
        .unwrap()
        .failing_tag_names
        .insert("rejected".to_string());

    let mut client = test_client(addr);
    let names = vec!["good".to_string(), "rejected".to_string()];
    let resolved = client.get_or_create_tags_bulk(&names).await.unwrap();

    assert_eq!(resolved.len(), 1);
    assert!(resolved.contains_key("good"));
    assert!(!resolved.contains_key("rejected"));
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let (mock, addr) = spawn_mock_server().await;
    {
        let mut inner = mock.inner.lock().unwrap();
        inner.search_failures_remaining = 2;
        inner.assets = vec![json!({
            "id": "a1", "type": "IMAGE", "originalFileName": "x.jpg", "tags": []
        })];
    }

    let client = test_client(addr);
    let assets = client.fetch_untagged_page().await.unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(mock.inner.lock().unwrap().search_calls, 3);
}

#[tokio::test]
async fn create_race_falls_back_to_refreshed_cache() {
    let (mock, addr) = spawn_mock_server().await;

    let mut client = test_client(addr);
    // Warm the (empty) cache so the client believes "latecomer" is missing.
    client.all_tags().await.unwrap();
    // Another actor creates the tag behind the client's back.
    mock.seed_tag("t9", "latecomer");

    let tag = client.get_or_create_tag("latecomer").await.unwrap();
    assert_eq!(tag.id, "t9");
}

fn test_orchestrator(addr: SocketAddr, dir: &std::path::Path) -> Orchestrator {
    let classifier = FixedClassifier {
        predictions: vec![TagPrediction {
            name: "landscape".to_string(),
            confidence: 0.9,
        }],
    };
    Orchestrator::new(
        test_client(addr),
        Box::new(classifier),
        FailureTracker::new(dir.join("failures.json"), 3),
        OrchestratorOptions {
            confidence_threshold: 0.35,
            processed_tag_name: "auto:processed".to_string(),
            batch_size: 25,
            cycle_delay: Duration::from_millis(1),
        },
    )
}

#[tokio::test]
async fn orchestrator_cycle_processes_page_and_tracks_progress() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t-marker", "auto:processed");
    mock.inner.lock().unwrap().assets = vec![json!({
        "id": "a1", "type": "IMAGE", "originalFileName": "x.jpg", "tags": []
    })];

    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = test_orchestrator(addr, dir.path());

    let stats = orchestrator.run_single_cycle().await.unwrap().unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.labels_assigned, 1);
    assert_eq!(orchestrator.progress().total_processed, 1);
    assert_eq!(
        orchestrator.progress().per_library["default"].assets_processed,
        1
    );

    // A raised stop flag ends continuous mode without running a cycle.
    orchestrator
        .stop_handle()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let cycles = orchestrator.run_continuous(None).await.unwrap();
    assert_eq!(cycles, 0);
}

#[tokio::test]
async fn cycle_cap_of_one_stops_after_a_single_transition() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t-marker", "auto:processed");
    // The mock never empties its page, so only the cap can end the pass.
    mock.inner.lock().unwrap().assets = vec![json!({
        "id": "a1", "type": "IMAGE", "originalFileName": "x.jpg", "tags": []
    })];

    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = test_orchestrator(addr, dir.path());
    orchestrator.run_all_libraries(Some(1)).await;

    assert_eq!(mock.inner.lock().unwrap().search_calls, 1);
    assert_eq!(orchestrator.progress().total_processed, 1);
}

#[tokio::test]
async fn continuous_run_ends_on_empty_page() {
    let (mock, addr) = spawn_mock_server().await;

    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator = test_orchestrator(addr, dir.path());
    let cycles = orchestrator.run_continuous(None).await.unwrap();

    // The empty first page is terminal success after exactly one fetch.
    assert_eq!(cycles, 1);
    assert_eq!(mock.inner.lock().unwrap().search_calls, 1);
}

#[tokio::test]
async fn tag_cleanup_flow_removes_tag_and_invalidates_cache() {
    let (mock, addr) = spawn_mock_server().await;
    mock.seed_tag("t1", "auto:processed");
    mock.inner.lock().unwrap().assets = vec![json!({
        "id": "a1", "type": "IMAGE", "originalFileName": "x.jpg",
        "tags": [{"id": "t1", "name": "auto:processed"}]
    })];

    let mut client = test_client(addr);

    let tagged = client.assets_with_tag("t1", 10).await.unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, "a1");

    let asset = client.get_asset("a1").await.unwrap();
    assert!(asset.has_tag_named("auto:processed"));

    client
        .remove_tags_from_asset("a1", &["t1".to_string()])
        .await
        .unwrap();
    client.delete_tag("t1").await.unwrap();

    // The delete invalidated the cache, so the next listing refetches.
    let tags = client.all_tags().await.unwrap();
    assert!(tags.is_empty());
}

#[tokio::test]
async fn silent_connection_probe_reports_user() {
    let (_mock, addr) = spawn_mock_server().await;
    let client = test_client(addr);

    assert!(client.test_connection_silent().await);
    let user = client.current_user().await.unwrap();
    assert_eq!(user.name, "Test User");
    assert_eq!(user.email, "test@example.com");
}
