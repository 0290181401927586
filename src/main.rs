//! timecraft HTTP server.
//!
//! - `GET  /health` server status
//! - `GET  /api/dashboard?date=YYYY-MM-DD&force=bool` full dashboard snapshot
//! - `GET  /api/dashboard/daily?date=YYYY-MM-DD` same, for an explicit day
//! - `GET  /api/dashboard/stream?date&force` SSE of one refresh, ending with the final snapshot
//! - `GET  /api/dashboard/context` context text used for title suggestions
//! - `POST /api/todoist/update-task` rename a task and stop suggesting titles for it
//! - `GET  /api/logs` SSE of every refresh and command log line
//!
//! The workspace (config, state, logs) lives in `TIMECRAFT_HOME`, or the current directory.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;

use timecraft::application::commands::{
    AppState, failed_snapshot, get_context_impl, get_dashboard_impl, update_task_title_impl,
};
use timecraft::application::progress::{DashboardEvent, ProgressSink, RequestSink};
use timecraft::infrastructure::error::InfraError;

type SharedState = Arc<AppState>;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    log_subscribers: usize,
}

#[derive(Debug, Deserialize)]
struct DashboardQuery {
    date: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTaskRequest {
    task_id: String,
    new_title: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    details: String,
}

fn status_for(error: &InfraError) -> StatusCode {
    match error {
        InfraError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        InfraError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sse_event(event: &DashboardEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|error| Event::default().event("error").data(error.to_string()))
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        log_subscribers: state.hub().subscriber_count(),
    })
}

async fn dashboard(
    State(state): State<SharedState>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    match get_dashboard_impl(&state, query.date.clone(), query.force, state.hub()).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(error) => {
            let message = state.command_error("get_dashboard", &error);
            let snapshot = failed_snapshot(&state, query.date.as_deref(), message);
            (status_for(&error), Json(snapshot)).into_response()
        }
    }
}

async fn dashboard_stream(
    State(state): State<SharedState>,
    Query(query): Query<DashboardQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (sink, receiver) = RequestSink::new(Some(state.hub().clone()));

    tokio::spawn(async move {
        let result = get_dashboard_impl(&state, query.date.clone(), query.force, &sink).await;
        if let Err(error) = result {
            let message = state.command_error("get_dashboard_stream", &error);
            let snapshot = failed_snapshot(&state, query.date.as_deref(), message);
            sink.emit(DashboardEvent::Snapshot {
                snapshot: Box::new(snapshot),
            });
        }
    });

    let events = stream::unfold(receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        Some((Ok::<_, Infallible>(sse_event(&event)), receiver))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn context(State(state): State<SharedState>) -> Response {
    match get_context_impl(&state) {
        Ok(context) => Json(context).into_response(),
        Err(error) => {
            let message = state.command_error("get_context", &error);
            (
                status_for(&error),
                Json(ErrorResponse {
                    error: "Failed to read context".to_string(),
                    details: message,
                }),
            )
                .into_response()
        }
    }
}

async fn update_task(
    State(state): State<SharedState>,
    Json(request): Json<UpdateTaskRequest>,
) -> Response {
    match update_task_title_impl(&state, request.task_id, request.new_title).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => {
            let message = state.command_error("update_task_title", &error);
            (
                status_for(&error),
                Json(ErrorResponse {
                    error: "Failed to update task".to_string(),
                    details: message,
                }),
            )
                .into_response()
        }
    }
}

async fn logs(State(state): State<SharedState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.hub().subscribe();
    let ping = stream::once(async {
        Ok::<_, Infallible>(Event::default().data(r#"{"type":"ping"}"#))
    });
    let updates = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((Ok::<_, Infallible>(sse_event(&event)), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "log subscriber lagged; dropping events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(ping.chain(updates)).keep_alive(KeepAlive::default())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,timecraft=debug")),
        )
        .init();

    let workspace_root = match std::env::var("TIMECRAFT_HOME") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => std::env::current_dir().unwrap_or_else(|e| {
            tracing::error!("failed to resolve current directory: {e}");
            std::process::exit(1);
        }),
    };

    let state = AppState::new(workspace_root.clone()).unwrap_or_else(|e| {
        tracing::error!("failed to initialize workspace {}: {e}", workspace_root.display());
        std::process::exit(1);
    });
    let addr = state.listen_addr().to_string();
    let state = Arc::new(state);

    tracing::info!(workspace = %workspace_root.display(), "timecraft initialized");

    let app = Router::new()
        .route("/health", get(health))
        // Dashboard.
        .route("/api/dashboard", get(dashboard))
        .route("/api/dashboard/daily", get(dashboard))
        .route("/api/dashboard/stream", get(dashboard_stream))
        .route("/api/dashboard/context", get(context))
        // Tasks.
        .route("/api/todoist/update-task", post(update_task))
        // Live log.
        .route("/api/logs", get(logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!("timecraft listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
