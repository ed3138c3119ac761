use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::{info, warn};

use hackademia_core::bus::{SubscriberHandle, ALL_PIPELINES, ALL_TERMINALS};
use hackademia_core::types::{now_ts, TriggerInfo};

use crate::AppState;

// ── Liveness ──────────────────────────────────────────────────────────────

pub(crate) async fn root() -> Json<Value> {
    Json(json!({
        "message": "Hackademia AI Pipeline is running!",
        "status": "healthy",
        "agents": ["build", "analyze", "fix", "test"],
    }))
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "pipeline": "ready",
        "agents_available": true,
    }))
}

// ── Webhook ingress ───────────────────────────────────────────────────────

fn server_error(detail: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": detail.to_string() })),
    )
        .into_response()
}

/// GitHub pull-request webhook. Accepts `opened` and `synchronize`; applies
/// the recursion filter to the head commit on `synchronize`.
pub(crate) async fn github_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return server_error(format!("invalid webhook payload: {e}")),
    };

    if payload.get("pull_request").is_none() {
        return Json(json!({ "message": "Not a pull request event, ignoring" })).into_response();
    }

    let action = payload["action"].as_str().unwrap_or_default();
    if action != "opened" && action != "synchronize" {
        return Json(json!({ "message": format!("Action '{action}' not processed") }))
            .into_response();
    }

    let pr = &payload["pull_request"];
    let (Some(pr_number), Some(repo_name)) = (
        pr["number"].as_u64(),
        payload["repository"]["full_name"].as_str(),
    ) else {
        return server_error("webhook payload missing pull_request.number or repository.full_name");
    };

    info!(pr_number, repo_name, action, "processing pull request event");

    if action == "synchronize" {
        let head = pr["head"]["sha"]
            .as_str()
            .or_else(|| pr["head"]["ref"].as_str())
            .unwrap_or_default();
        if let Some(message) = state.orchestrator.should_suppress(repo_name, head).await {
            info!(repo_name, pr_number, "suppressing self-triggered pipeline: {message}");
            return Json(json!({
                "message": "Pipeline suppressed for AI-generated commit",
                "reason": "ai_generated_commit",
                "pr_number": pr_number,
                "repo": repo_name,
            }))
            .into_response();
        }
    }

    let triggered_by = pr["user"]["login"].as_str().unwrap_or("system");
    let trigger = TriggerInfo::webhook(triggered_by, format!("pull_request.{action}"));

    match state
        .orchestrator
        .start_pipeline(pr_number, repo_name, trigger)
        .await
    {
        Ok(pipeline_id) => Json(json!({
            "message": "PR processing initiated",
            "pr_number": pr_number,
            "repo": repo_name,
            "pipeline_id": pipeline_id,
            "pipeline_status": "starting",
        }))
        .into_response(),
        Err(e) => server_error(e),
    }
}

/// Manual trigger, equivalent to a webhook `opened` event.
pub(crate) async fn trigger_agents(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let (Some(pr_number), Some(repo_name)) =
        (body["pr_number"].as_u64(), body["repo_name"].as_str())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "pr_number and repo_name required" })),
        )
            .into_response();
    };

    match state
        .orchestrator
        .start_pipeline(pr_number, repo_name, TriggerInfo::manual("api"))
        .await
    {
        Ok(pipeline_id) => Json(json!({
            "message": "Manual agent triggering successful",
            "pipeline_id": pipeline_id,
            "status": "initiated",
            "agents": ["build", "analyze", "fix", "test"],
        }))
        .into_response(),
        Err(e) => server_error(e),
    }
}

/// Inbound endpoint for this system's own comprehensive-results POST.
pub(crate) async fn webhook_results(Json(body): Json<Value>) -> Response {
    let valid = body["event_type"] == "pipeline_complete" && body.get("results").is_some();
    if !valid {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "expected event_type 'pipeline_complete' with results" })),
        )
            .into_response();
    }
    let pipeline_id = body["results"]["pipeline_id"].as_str().unwrap_or("unknown");
    info!(pipeline_id, "received comprehensive pipeline results");
    Json(json!({ "status": "received", "pipeline_id": pipeline_id })).into_response()
}

// ── Status endpoints ──────────────────────────────────────────────────────

pub(crate) async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
) -> Json<Value> {
    match state.orchestrator.snapshot(&pipeline_id).await {
        Some(snapshot) => Json(snapshot),
        None => Json(json!({ "error": "Pipeline not found" })),
    }
}

pub(crate) async fn active_pipelines(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.bus.stats().await;
    let total: usize = stats.values().sum();
    Json(json!({
        "active_connections": stats,
        "total_connections": total,
        "pipeline_count": state.orchestrator.active_count().await,
    }))
}

// ── Pipeline event subscription (WebSocket) ───────────────────────────────

pub(crate) async fn ws_pipeline(
    Path(pipeline_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| pipeline_socket(socket, pipeline_id, state))
}

async fn pipeline_socket(mut socket: WebSocket, pipeline_id: String, state: Arc<AppState>) {
    let topic = if pipeline_id == "all" {
        ALL_PIPELINES.to_string()
    } else {
        pipeline_id.clone()
    };
    let (handle, mut rx) = state.bus.subscribe(&topic).await;
    info!(topic, "event subscriber connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                // Any client message is acknowledged.
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    let ack = json!({
                        "type": "ack",
                        "message": format!("Connected to {pipeline_id}"),
                        "timestamp": now_ts(),
                    });
                    if socket.send(Message::Text(ack.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    disconnect(&state, &handle).await;
    info!(topic = handle.topic(), "event subscriber disconnected");
}

// ── Terminal streaming (WebSocket) ────────────────────────────────────────

pub(crate) async fn ws_terminal(
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| terminal_socket(socket, session_id, state))
}

async fn terminal_socket(mut socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let topic = if session_id == "all" {
        ALL_TERMINALS.to_string()
    } else {
        session_id.clone()
    };
    let (handle, mut rx) = state.bus.subscribe(&topic).await;

    let connected = json!({
        "type": "terminal_connected",
        "session_id": session_id,
        "timestamp": now_ts(),
        "message": format!("Connected to terminal session: {session_id}"),
    });
    if socket.send(Message::Text(connected.to_string())).await.is_err() {
        disconnect(&state, &handle).await;
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = terminal_command(&state, &session_id, &text).await;
                    if socket.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    disconnect(&state, &handle).await;

    // Auto-terminate a concrete session once its last subscriber is gone.
    if topic != ALL_TERMINALS && state.bus.subscriber_count(&topic).await == 0 {
        state.terminals.cleanup(&topic).await;
    }
}

/// Handle one client control message on a terminal socket.
async fn terminal_command(state: &Arc<AppState>, session_id: &str, text: &str) -> Value {
    let Ok(command) = serde_json::from_str::<Value>(text) else {
        return json!({ "type": "ack", "timestamp": now_ts() });
    };
    match command["type"].as_str().unwrap_or_default() {
        "ping" => json!({ "type": "pong", "timestamp": now_ts() }),
        "list_sessions" => {
            let sessions = state.terminals.list_sessions().await;
            json!({ "type": "session_list", "sessions": sessions, "timestamp": now_ts() })
        }
        "start_session" => {
            let Some(cmd) = command["command"].as_str() else {
                return json!({ "type": "error", "message": "command required", "timestamp": now_ts() });
            };
            let cwd = command["cwd"].as_str().map(str::to_string);
            match state.terminals.start(session_id, cmd, cwd).await {
                Ok(()) => json!({ "type": "session_started", "session_id": session_id, "success": true, "timestamp": now_ts() }),
                Err(e) => {
                    warn!(session_id, "terminal start failed: {e}");
                    json!({ "type": "error", "message": e.to_string(), "timestamp": now_ts() })
                }
            }
        }
        "terminate_session" => {
            let terminated = state.terminals.terminate(session_id).await;
            json!({ "type": "ack", "terminated": terminated, "timestamp": now_ts() })
        }
        "get_status" => match state.terminals.status(session_id).await {
            Some(status) => json!({ "type": "session_status", "status": status, "timestamp": now_ts() }),
            None => json!({ "type": "error", "message": "session not found", "timestamp": now_ts() }),
        },
        _ => json!({ "type": "ack", "timestamp": now_ts() }),
    }
}

async fn disconnect(state: &Arc<AppState>, handle: &SubscriberHandle) {
    state.bus.disconnect(handle).await;
}
