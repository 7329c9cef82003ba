//! HTTP gateway: submission, retry, task reads, live progress, stats.
//!
//! Axum router with body-size and timeout layers on the request/response
//! routes; the SSE subscription route sits outside the timeout layer
//! because it is expected to outlive any request budget (it has its own
//! idle ceiling instead).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::dialogue;
use crate::engine::TaskEngine;
use crate::error::{ErrorKind, SynthError};
use crate::limiter::ConcurrencyLimiter;
use crate::monitor::{StartOutcome, TaskEvent, TaskMonitor, TaskRecord, TaskStatus};
use crate::storage::{TaskIndex, TextRow};

/// Dialogue scripts are larger than chat payloads; 1 MiB covers the
/// configured character cap with plenty of headroom.
pub const MAX_BODY_SIZE: usize = 1_048_576;
/// Request timeout for the non-streaming routes.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskEngine>,
    pub monitor: Arc<dyn TaskMonitor>,
    pub limiter: Arc<dyn ConcurrencyLimiter>,
    pub index: Arc<TaskIndex>,
    pub backend_name: &'static str,
    pub max_text_chars: usize,
    pub sse_idle: Duration,
    pub sse_keepalive: Duration,
}

/// Bind and serve until the process exits.
pub async fn run_gateway(config: &Config, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        backend = state.backend_name,
        capacity = state.limiter.capacity(),
        "voxweave gateway listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let timed = Router::new()
        .route("/health", get(handle_health))
        .route("/api/synthesize", post(handle_synthesize))
        .route("/api/tasks/{text_id}", get(handle_get_task))
        .route("/api/tasks/{text_id}/retry", post(handle_retry))
        .route("/api/stats", get(handle_stats))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)));

    let streaming = Router::new().route("/api/tasks/{text_id}/events", get(handle_events));

    timed
        .merge(streaming)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ── Submission ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub text_id: String,
    pub text: String,
    pub user_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// SHA-256 hex over the submitted text; the idempotency key.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Error-kind → HTTP status, per the taxonomy mapping (400 input,
/// 503 transient after retries, 500 otherwise).
fn kind_status(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn handle_synthesize(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.text_id.trim().is_empty() || req.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "text_id and user_id are required"})),
        );
    }
    let char_count = req.text.chars().count();
    if char_count > state.max_text_chars {
        let e = SynthError::OversizedText {
            chars: char_count,
            limit: state.max_text_chars,
        };
        return (
            kind_status(e.kind(state.engine.transient_codes())),
            Json(json!({"error": e.to_string()})),
        );
    }
    // Reject unusable input up front instead of admitting a task that can
    // only fail.
    if let Err(e) = dialogue::parse(&req.text, &state.engine.voices()) {
        return (
            kind_status(e.kind(state.engine.transient_codes())),
            Json(json!({"error": e.to_string()})),
        );
    }

    let row = TextRow {
        text_id: req.text_id.clone(),
        user_id: req.user_id.clone(),
        filename: req
            .filename
            .clone()
            .unwrap_or_else(|| format!("{}.txt", req.text_id)),
        title: req.title.clone().unwrap_or_default(),
        content: req.text.clone(),
        char_count,
    };
    if let Err(e) = state.index.upsert_text(&row) {
        tracing::error!(text_id = %req.text_id, error = %e, "text row write failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "persistence failure"})),
        );
    }

    admit(&state, &req.text_id, &req.text, &req.user_id).await
}

/// Register with the monitor and, when admitted, dispatch the engine.
async fn admit(
    state: &AppState,
    text_id: &str,
    text: &str,
    user_id: &str,
) -> (StatusCode, Json<serde_json::Value>) {
    let hash = content_hash(text);
    match state.monitor.start_task(text_id, &hash, user_id).await {
        Ok(StartOutcome::Started) => {
            tracing::info!(text_id = %text_id, chars = text.chars().count(), "task accepted");
            tokio::spawn(
                Arc::clone(&state.engine).run_task(text_id.to_string(), text.to_string()),
            );
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": "accepted", "text_id": text_id})),
            )
        }
        Ok(StartOutcome::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({"status": "already_running", "text_id": text_id})),
        ),
        Ok(StartOutcome::DuplicateContent { existing_text_id }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "duplicate_content",
                "existing_text_id": existing_text_id,
            })),
        ),
        Err(e) => {
            tracing::error!(text_id = %text_id, error = %e, "task admission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "task admission failed"})),
            )
        }
    }
}

// ── Retry ──────────────────────────────────────────────────────────

async fn handle_retry(
    State(state): State<AppState>,
    Path(text_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    // A live artifact makes retry a no-op.
    match state.index.live_audio(&text_id) {
        Ok(Some(audio)) => {
            return (
                StatusCode::OK,
                Json(json!({
                    "status": "exists",
                    "audio_key": audio.object_key,
                    "version_num": audio.version_num,
                })),
            );
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(text_id = %text_id, error = %e, "audio lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "persistence failure"})),
            );
        }
    }

    match state.monitor.get_task(&text_id).await {
        Ok(Some(task)) if !task.status.is_terminal() => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"status": "already_running", "text_id": text_id})),
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(text_id = %text_id, error = %e, "task lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "monitor failure"})),
            );
        }
    }

    let text = match state.index.get_text(&text_id) {
        Ok(Some(row)) => row,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown text"})),
            );
        }
        Err(e) => {
            tracing::error!(text_id = %text_id, error = %e, "text lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "persistence failure"})),
            );
        }
    };

    admit(&state, &text_id, &text.content, &text.user_id).await
}

// ── Reads ──────────────────────────────────────────────────────────

async fn handle_get_task(
    State(state): State<AppState>,
    Path(text_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.monitor.get_task(&text_id).await {
        Ok(Some(task)) => {
            // FAILED tasks report the taxonomy-mapped status for their
            // recorded kind (503 for transient-after-retries, 400 input,
            // 500 otherwise) while still carrying the full record.
            let status = if task.status == TaskStatus::Failed {
                kind_status(ErrorKind::from_str_lossy(
                    task.error_kind.as_deref().unwrap_or(""),
                ))
            } else {
                StatusCode::OK
            };
            match serde_json::to_value(&task) {
                Ok(value) => (status, Json(value)),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": e.to_string()})),
                ),
            }
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown task"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn handle_stats(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let monitor_stats = match state.monitor.get_stats().await {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    };
    // Totals and the success rate come from the durable index: in-process
    // counters reset on restart and would overstate the rate.
    let index_stats = match state.index.stats() {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    };
    let success_rate = if index_stats.texts_total > 0 {
        index_stats.audios_live as f64 / index_stats.texts_total as f64
    } else {
        monitor_stats.success_rate
    };

    (
        StatusCode::OK,
        Json(json!({
            "active": monitor_stats.active,
            "queued": monitor_stats.queued,
            "total": index_stats.texts_total,
            "completed": monitor_stats.completed,
            "failed": monitor_stats.failed,
            "timeout": monitor_stats.timeout,
            "success_rate": success_rate,
            "p50_duration_ms": monitor_stats.p50_duration_ms,
            "p95_duration_ms": monitor_stats.p95_duration_ms,
        })),
    )
}

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "backend": state.backend_name,
            "capacity": state.limiter.capacity(),
        })),
    )
}

// ── Event subscription (SSE) ───────────────────────────────────────

/// The state a late subscriber sees immediately, rendered as an event.
fn snapshot_event(task: &TaskRecord) -> TaskEvent {
    let ts_ms = crate::monitor::now_ms();
    match task.status {
        TaskStatus::Completed => TaskEvent::Completed {
            text_id: task.text_id.clone(),
            status: task.status,
            audio_key: task.audio_key.clone().unwrap_or_default(),
            audio_filename: task.audio_filename.clone().unwrap_or_default(),
            ts_ms,
        },
        TaskStatus::Failed | TaskStatus::Timeout => TaskEvent::Failed {
            text_id: task.text_id.clone(),
            status: task.status,
            error_kind: task.error_kind.clone().unwrap_or_default(),
            error_message: task.error_message.clone().unwrap_or_default(),
            ts_ms,
        },
        TaskStatus::Processing => TaskEvent::Progress {
            text_id: task.text_id.clone(),
            status: task.status,
            completed: task.segments_completed,
            total: task.segment_count,
            ts_ms,
        },
        TaskStatus::Queued => TaskEvent::Status {
            text_id: task.text_id.clone(),
            status: task.status,
            ts_ms,
        },
    }
}

async fn handle_events(State(state): State<AppState>, Path(text_id): Path<String>) -> Response {
    let task = match state.monitor.get_task(&text_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown task"})),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    // Subscribe before emitting the snapshot so no transition can fall
    // between the read and the subscription.
    let mut rx = state.monitor.subscribe();
    let idle = state.sse_idle;

    let stream = async_stream::stream! {
        let snapshot = snapshot_event(&task);
        let terminal = snapshot.is_terminal();
        if let Ok(json) = serde_json::to_string(&snapshot) {
            yield Ok::<Event, Infallible>(Event::default().data(json));
        }
        if terminal {
            return;
        }

        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.text_id() != text_id {
                        continue;
                    }
                    let terminal = event.is_terminal();
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    // At-least-once channel: the client can recover the
                    // current state with a task read.
                    tracing::warn!(text_id = %text_id, skipped, "event subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => {
                    tracing::debug!(text_id = %text_id, "event subscription idle ceiling reached");
                    break;
                }
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.sse_keepalive)
                .text("keepalive"),
        )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dialogue::Segment;
    use crate::limiter::LocalLimiter;
    use crate::monitor::memory::MemoryMonitor;
    use crate::provider::SpeechSynthesizer;
    use async_trait::async_trait;

    /// Slow enough that tasks stay PROCESSING for the whole test.
    struct SlowSynth;

    #[async_trait]
    impl SpeechSynthesizer for SlowSynth {
        async fn synthesize(&self, _segment: &Segment) -> Result<Vec<u8>, SynthError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![0])
        }
    }

    struct FastSynth;

    #[async_trait]
    impl SpeechSynthesizer for FastSynth {
        async fn synthesize(&self, _segment: &Segment) -> Result<Vec<u8>, SynthError> {
            Ok(b"audio".to_vec())
        }
    }

    struct NullStore;

    #[async_trait]
    impl crate::storage::ObjectStore for NullStore {
        async fn put(
            &self,
            key: &str,
            _bytes: Vec<u8>,
            _content_type: &str,
            _public_read: bool,
        ) -> Result<String, SynthError> {
            Ok(format!("https://blob.test/{key}"))
        }
    }

    fn app_state(synth: Arc<dyn SpeechSynthesizer>) -> AppState {
        let config = Config::load(None).unwrap();
        let monitor: Arc<dyn TaskMonitor> = Arc::new(MemoryMonitor::new(&config));
        let limiter: Arc<dyn ConcurrencyLimiter> =
            Arc::new(LocalLimiter::new(config.engine.max_concurrent_tasks));
        let index = Arc::new(TaskIndex::open_in_memory().unwrap());
        let engine = Arc::new(TaskEngine::new(
            &config,
            Arc::clone(&monitor),
            Arc::clone(&limiter),
            synth,
            Arc::new(NullStore),
            Arc::clone(&index),
        ));
        AppState {
            engine,
            monitor,
            limiter,
            index,
            backend_name: "memory",
            max_text_chars: config.engine.max_text_chars,
            sse_idle: Duration::from_secs(300),
            sse_keepalive: Duration::from_secs(15),
        }
    }

    fn submit(text_id: &str, text: &str) -> SubmitRequest {
        SubmitRequest {
            text_id: text_id.into(),
            text: text.into(),
            user_id: "u1".into(),
            filename: None,
            title: None,
        }
    }

    #[test]
    fn content_hash_is_stable_sha256_hex() {
        let a = content_hash("A: hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_hash("A: hello"));
        assert_ne!(a, content_hash("A: hello!"));
    }

    #[test]
    fn snapshot_event_mirrors_task_state() {
        let mut task = TaskRecord::new("t1", "u1", "hash", 0);
        assert!(matches!(snapshot_event(&task), TaskEvent::Status { .. }));

        task.status = TaskStatus::Processing;
        task.segment_count = 4;
        task.segments_completed = 2;
        match snapshot_event(&task) {
            TaskEvent::Progress { completed, total, .. } => {
                assert_eq!((completed, total), (2, 4));
            }
            other => panic!("expected progress, got {other:?}"),
        }

        task.status = TaskStatus::Completed;
        task.audio_key = Some("audio/2026/08/t1_0_v01.mp3".into());
        assert!(snapshot_event(&task).is_terminal());
    }

    #[tokio::test]
    async fn submission_is_accepted_then_conflicts_while_running() {
        let state = app_state(Arc::new(SlowSynth));
        let text = "A: hello\nB: hi there";

        let (status, body) =
            handle_synthesize(State(state.clone()), Json(submit("t1", text))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.0["status"], "accepted");

        // Same text id while non-terminal.
        let (status, body) =
            handle_synthesize(State(state.clone()), Json(submit("t1", text))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.0["status"], "already_running");

        // Identical content under a different id.
        let (status, body) =
            handle_synthesize(State(state.clone()), Json(submit("t2", text))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.0["status"], "duplicate_content");
        assert_eq!(body.0["existing_text_id"], "t1");
    }

    #[tokio::test]
    async fn unparseable_submission_is_a_400() {
        let state = app_state(Arc::new(SlowSynth));
        let (status, body) =
            handle_synthesize(State(state.clone()), Json(submit("t1", "just prose"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.0["error"].as_str().unwrap().contains("empty input"));

        let (status, _) = handle_synthesize(State(state), Json(submit("", "A: hi"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retry_conflicts_while_running_and_404s_unknown_text() {
        let state = app_state(Arc::new(SlowSynth));
        let text = "A: hello\nB: hi";
        let (status, _) = handle_synthesize(State(state.clone()), Json(submit("t1", text))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = handle_retry(State(state.clone()), Path("t1".to_string())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.0["status"], "already_running");

        let (status, _) = handle_retry(State(state), Path("ghost".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_after_timeout_starts_a_new_task() {
        let state = app_state(Arc::new(FastSynth));
        let text = "A: hello\nB: hi";
        let (status, _) = handle_synthesize(State(state.clone()), Json(submit("t1", text))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        // Force the first run to a terminal TIMEOUT before it finishes.
        state.monitor.timeout_task("t1").await.unwrap();

        let (status, body) = handle_retry(State(state.clone()), Path("t1".to_string())).await;
        // Either the artifact already landed (no-op retry) or a fresh task
        // was dispatched; both are legal post-timeout outcomes.
        assert!(
            status == StatusCode::ACCEPTED || status == StatusCode::OK,
            "unexpected status {status}: {:?}",
            body.0
        );
    }

    #[tokio::test]
    async fn failed_task_reads_carry_taxonomy_status() {
        let state = app_state(Arc::new(SlowSynth));

        // Transient provider failure after retries → 503.
        state.monitor.start_task("t1", "h1", "u1").await.unwrap();
        state
            .monitor
            .fail_task("t1", ErrorKind::TransientProvider, "idle timeout after 3 attempts")
            .await
            .unwrap();
        let (status, body) = handle_get_task(State(state.clone()), Path("t1".into())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0["error_kind"], "transient_provider");

        // Fatal provider failure → 500.
        state.monitor.start_task("t2", "h2", "u1").await.unwrap();
        state
            .monitor
            .fail_task("t2", ErrorKind::FatalProvider, "voice rejected")
            .await
            .unwrap();
        let (status, _) = handle_get_task(State(state.clone()), Path("t2".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        // Non-failed states stay 200.
        state.monitor.start_task("t3", "h3", "u1").await.unwrap();
        let (status, _) = handle_get_task(State(state), Path("t3".into())).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn get_task_and_stats_answer() {
        let state = app_state(Arc::new(SlowSynth));
        let (status, _) = handle_get_task(State(state.clone()), Path("none".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            handle_synthesize(State(state.clone()), Json(submit("t1", "A: hi\nB: yo"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = handle_get_task(State(state.clone()), Path("t1".into())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["text_id"], "t1");

        let (status, body) = handle_stats(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["total"], 1);
    }
}
