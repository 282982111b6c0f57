//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;

use chainmail_core::types::{TriggerEvent, TriggerOutcome};

use super::server::AppState;

/// Trigger request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    #[serde(default)]
    pub user_uuid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub trigger_id: i64,
    #[serde(default)]
    pub geo: String,
}

impl TriggerRequest {
    /// Required fields that arrived missing or blank.
    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.user_uuid.trim().is_empty() {
            missing.push("userUuid");
        }
        if self.email.trim().is_empty() {
            missing.push("email");
        }
        if self.geo.trim().is_empty() {
            missing.push("geo");
        }
        missing
    }
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chainmail-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed();
    Json(serde_json::json!({
        "service": "chainmail-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": uptime.as_secs(),
    }))
}

/// Trigger a follow-up chain for a user event.
pub async fn trigger_chain(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let missing = req.missing_fields();
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "error": format!("Missing required fields: {}", missing.join(", ")),
            })),
        );
    }

    let event = TriggerEvent {
        user_uuid: req.user_uuid,
        email: req.email,
        trigger_id: req.trigger_id,
        geo: req.geo,
    };

    match state.scheduler.trigger_chain(event).await {
        Ok(TriggerOutcome::New { trigger_id }) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "new", "triggerId": trigger_id})),
        ),
        Ok(TriggerOutcome::Merged { count }) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "merged", "count": count})),
        ),
        Err(e) => {
            tracing::error!("Trigger failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": e.to_string()})),
            )
        }
    }
}
