// SPDX-License-Identifier: MIT

//! HTTP API over one compiled graph
//!
//! Threads are addressed by id; the graph and its checkpoint store are shared
//! by every request.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::engine::error::{CheckpointError, GraphError};
use crate::stategraph::checkpoint::Checkpoint;
use crate::stategraph::workflow::graph::{CompiledGraph, GraphEvent, RunOutcome, ThreadState};

#[derive(Clone)]
struct AppState {
    graph: Arc<CompiledGraph>,
}

pub fn router(graph: Arc<CompiledGraph>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/threads", get(list_threads))
        .route("/api/threads/{thread_id}", delete(purge_thread))
        .route("/api/threads/{thread_id}/runs", post(create_run))
        .route("/api/threads/{thread_id}/runs/stream", post(stream_run))
        .route(
            "/api/threads/{thread_id}/state",
            get(get_state).post(update_state),
        )
        .route("/api/threads/{thread_id}/history", get(get_history))
        .with_state(AppState { graph })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(graph: Arc<CompiledGraph>, port: u16) -> Result<(), GraphError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, graph).await
}

/// Serve on an already bound listener
pub async fn serve_listener(listener: TcpListener, graph: Arc<CompiledGraph>) -> Result<(), GraphError> {
    log::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(graph)).await?;
    Ok(())
}

/// `GraphError` rendered as a JSON error response
#[derive(Debug)]
pub enum ApiError {
    Graph(GraphError),
    NotFound(String),
}

impl From<GraphError> for ApiError {
    fn from(e: GraphError) -> Self {
        ApiError::Graph(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Graph(e) => match e {
                GraphError::SchemaMismatch { .. } => (StatusCode::BAD_REQUEST, "schema_mismatch"),
                GraphError::Routing { .. } => (StatusCode::BAD_REQUEST, "routing"),
                GraphError::UnknownNode(_) => (StatusCode::BAD_REQUEST, "unknown_node"),
                GraphError::Json(_) | GraphError::Yaml(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                GraphError::Build(_) | GraphError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_graph"),
                GraphError::Checkpoint(CheckpointError::ThreadIdRequired) => {
                    (StatusCode::BAD_REQUEST, "thread_id_required")
                }
                GraphError::NothingToResume(_) => (StatusCode::NOT_FOUND, "nothing_to_resume"),
                GraphError::Deadlock { .. } => (StatusCode::CONFLICT, "deadlock"),
                GraphError::Node { .. } | GraphError::Router { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "node_failed")
                }
                GraphError::CycleBudgetExceeded { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "cycle_budget_exceeded")
                }
                GraphError::Checkpoint(_) | GraphError::Io(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "storage")
                }
            },
        };
        let message = match &self {
            ApiError::NotFound(thread_id) => format!("Thread '{}' not found", thread_id),
            ApiError::Graph(e) => e.to_string(),
        };
        if status.is_server_error() {
            log::error!("{}", message);
        }

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_threads(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.graph.threads().await?))
}

#[derive(Deserialize)]
struct RunRequest {
    /// Initial state; absent or null resumes the thread
    #[serde(default)]
    input: Option<Value>,
}

async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<RunRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let outcome = state.graph.invoke(payload.input, &thread_id).await?;
    Ok(Json(outcome))
}

async fn stream_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<RunRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    log::info!("Starting streaming run on thread '{}'", thread_id);
    let stream = state.graph.stream(payload.input, &thread_id).map(to_sse);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse(event: GraphEvent) -> Result<Event, Infallible> {
    let name = match &event {
        GraphEvent::Step { .. } => "step",
        GraphEvent::Paused { .. } => "paused",
        GraphEvent::Completed { .. } => "completed",
        GraphEvent::Failed { .. } => "failed",
    };
    Ok(match Event::default().event(name).json_data(&event) {
        Ok(sse) => sse,
        Err(e) => Event::default().event("failed").data(e.to_string()),
    })
}

async fn get_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadState>, ApiError> {
    match state.graph.get_state(&thread_id).await? {
        Some(thread) => Ok(Json(thread)),
        None => Err(ApiError::NotFound(thread_id)),
    }
}

#[derive(Deserialize)]
struct UpdateRequest {
    values: Value,
    #[serde(default)]
    as_node: Option<String>,
}

async fn update_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<UpdateRequest>,
) -> Result<Json<ThreadState>, ApiError> {
    let thread = state
        .graph
        .update_state(&thread_id, payload.values, payload.as_node.as_deref())
        .await?;
    Ok(Json(thread))
}

async fn get_history(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<Checkpoint>>, ApiError> {
    Ok(Json(state.graph.history(&thread_id).await?))
}

async fn purge_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.graph.purge(&thread_id).await?;
    Ok(Json(json!({ "thread_id": thread_id, "removed": removed })))
}
