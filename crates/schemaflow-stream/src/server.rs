//! Axum web server exposing runs as text event streams

use crate::transport::pump;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::Stream;
use schemaflow_core::{FlowError, ProgressEvent, Result, RunRequest};
use schemaflow_orchestrator::{guard, replay, ErrorReporter, Orchestrator, RunStart};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Frames buffered between a run and a slow client
const FRAME_BUFFER: usize = 64;

/// Shared application state
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Wall-clock budget per streamed request
    pub timeout: Duration,
}

pub type SharedState = Arc<AppState>;

/// Body of `POST /api/chat/stream`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Continue the thread from its latest checkpoint instead of starting over
    #[serde(default)]
    pub resume: bool,
}

impl ChatStreamRequest {
    fn into_start(self) -> std::result::Result<RunStart, String> {
        if self.resume {
            let thread_id = self
                .thread_id
                .ok_or_else(|| "threadId is required to resume".to_string())?;
            return Ok(RunStart::Resume { thread_id });
        }

        let message = self
            .message
            .ok_or_else(|| "message is required".to_string())?;
        Ok(RunStart::New(RunRequest {
            thread_id: self
                .thread_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            organization_id: self.organization_id,
            user_id: self.user_id,
            message,
        }))
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/chat/replay/:thread_id", get(chat_replay))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the process is stopped
pub async fn serve(state: SharedState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FlowError::Transport(format!("Failed to bind {}: {}", addr, e)))?;
    info!("Listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| FlowError::Transport(e.to_string()))?;
    Ok(())
}

/// POST /api/chat/stream - start or resume a run and stream its events
async fn chat_stream(
    State(app): State<SharedState>,
    Json(request): Json<ChatStreamRequest>,
) -> Response {
    let start = match request.into_start() {
        Ok(start) => start,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "message": message })),
            )
                .into_response()
        }
    };

    let thread_id = start.thread_id().to_string();
    info!("Streaming run for thread {}", thread_id);
    let orchestrator = app.orchestrator.clone();
    stream_response(&app, thread_id, move |signal| orchestrator.stream(start, signal))
}

/// GET /api/chat/replay/:thread_id - replay the latest checkpoint
async fn chat_replay(
    State(app): State<SharedState>,
    Path(thread_id): Path<String>,
) -> Response {
    let store = app.orchestrator.checkpoints();
    let replayed = thread_id.clone();
    stream_response(&app, thread_id, move |_signal| replay(store, replayed))
}

/// GET /api/health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "schemaflow"
    }))
}

/// Run `make_events` under the request guard and stream its frames
///
/// Dropping the response body (client disconnect) cancels the run's signal.
fn stream_response<F, S>(app: &AppState, thread_id: String, make_events: F) -> Response
where
    F: FnOnce(CancellationToken) -> S + Send + 'static,
    S: Stream<Item = ProgressEvent> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let external = CancellationToken::new();
    let disconnect = external.clone().drop_guard();

    tokio::spawn(deliver(
        make_events,
        tx,
        app.timeout,
        external,
        thread_id,
        app.orchestrator.reporter(),
    ));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames(rx, disconnect)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Pump a run's frames into `tx`; delivery failures go to error tracking
async fn deliver<F, S>(
    make_events: F,
    tx: mpsc::Sender<String>,
    timeout: Duration,
    external: CancellationToken,
    thread_id: String,
    reporter: Arc<dyn ErrorReporter>,
) where
    F: FnOnce(CancellationToken) -> S,
    S: Stream<Item = ProgressEvent>,
{
    let result = guard(
        move |signal| async move {
            let mut tx = tx;
            let events = make_events(signal.clone());
            pump(events, &mut tx, &signal).await.map(|_| ())
        },
        timeout,
        &external,
    )
    .await;

    if let Err(e) = result {
        warn!("Stream for thread {} ended with error: {}", thread_id, e);
        reporter.capture(&thread_id, &e);
    }
}

fn frames(
    mut rx: mpsc::Receiver<String>,
    disconnect: DropGuard,
) -> impl Stream<Item = std::result::Result<String, Infallible>> + Send + 'static {
    async_stream::stream! {
        let _disconnect = disconnect;
        while let Some(frame) = rx.recv().await {
            yield Ok(frame);
        }
    }
}
