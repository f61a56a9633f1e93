//! HTTP control surface: a thin axum front end that proxies operator verbs
//! to the supervisor over its parent channel, so the same verb dispatch
//! the supervisor already answers for the root caller is reachable over
//! the network without the supervisor knowing HTTP exists.

use crate::broker::{Args, ParentMessage, Reply};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
pub struct ControlState {
    supervisor_tx: mpsc::Sender<ParentMessage>,
}

pub fn router(supervisor_tx: mpsc::Sender<ParentMessage>) -> Router {
    let state = Arc::new(ControlState { supervisor_tx });

    Router::new()
        .route("/", get(list_tasks))
        .route("/tasks", get(list_tasks))
        .route("/tasks/current", get(current_task))
        .route("/tasks/current/procs", get(current_task_procs))
        .route(
            "/tasks/current/procs/:pid/kill",
            post(kill_current_task_proc),
        )
        .route("/tasks/current/shutdown", post(shutdown_current_task))
        .route("/shutdown", post(shutdown_supervisor))
        .route("/health", get(health))
        .route("/help", get(help))
        .fallback(not_found)
        .with_state(state)
}

async fn ask(state: &ControlState, verb: &str, args: Args) -> Result<Reply, StatusCode> {
    let (tx, rx) = oneshot::channel();
    let env = crate::broker::Envelope::new("http", verb, args);
    state
        .supervisor_tx
        .send(ParentMessage::Ask(env, tx))
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

fn reply_to_response(reply: Reply) -> impl IntoResponse {
    if reply.is_ok() {
        (StatusCode::OK, Json(reply.payload)).into_response()
    } else {
        let body = json!({"content": reply.content.unwrap_or_default(), "status": 500});
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

async fn list_tasks(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match ask(&state, "available_tasks", Args::Null).await {
        Ok(reply) => reply_to_response(reply).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn current_task(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match ask(&state, "current_task", Args::Null).await {
        Ok(reply) => reply_to_response(reply).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn current_task_procs(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match ask(&state, "current_task_processes", Args::Null).await {
        Ok(reply) => reply_to_response(reply).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn kill_current_task_proc(
    State(state): State<Arc<ControlState>>,
    Path(pid): Path<u32>,
) -> impl IntoResponse {
    match ask(&state, "current_task_kill_proc", json!({"pid": pid})).await {
        Ok(reply) => reply_to_response(reply).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn shutdown_current_task(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match ask(&state, "current_task_shutdown", Args::Null).await {
        Ok(reply) => reply_to_response(reply).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn shutdown_supervisor(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match ask(&state, "shutdown", Args::Null).await {
        Ok(reply) => reply_to_response(reply).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn help() -> impl IntoResponse {
    Json(json!({
        "routes": [
            "GET /tasks",
            "GET /tasks/current",
            "GET /tasks/current/procs",
            "POST /tasks/current/procs/:pid/kill",
            "POST /tasks/current/shutdown",
            "POST /shutdown",
            "GET /health",
            "GET /help",
        ]
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"content": "inexistant URL", "status": 404})),
    )
}
