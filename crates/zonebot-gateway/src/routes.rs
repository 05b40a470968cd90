//! API route handlers for the gateway.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::Json;
use std::sync::Arc;
use tracing::{info, warn};

use super::server::AppState;

/// Liveness probe. Peers (and our own keep-alive loop) hit this to keep
/// the instance warm and to check reachability before a fan-out.
pub async fn ping(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "active",
        "bot": state.self_bot_id,
    }))
}

/// Minimal human-readable status page.
pub async fn status_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let uptime = state.start_time.elapsed();
    Html(format!(
        "<html><body><h1>🥷 {}</h1><p>status: active</p><p>uptime: {}s</p></body></html>",
        state.self_bot_id,
        uptime.as_secs()
    ))
}

/// Inbound release call from a peer instance. The body carries the target
/// user and the shared secret; the shortened `u`/`s` keys are accepted for
/// compatibility with older peers.
pub async fn release_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let presented = body["secretKey"]
        .as_str()
        .or_else(|| body["s"].as_str())
        .unwrap_or("");

    if !secret_matches(state.secret_key.as_deref(), presented) {
        warn!("Rejected release call with bad secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"success": false, "error": "Unauthorized"})),
        );
    }

    let user_id = body["userId"].as_i64().or_else(|| body["u"].as_i64());
    let Some(user_id) = user_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"success": false, "error": "Missing userId"})),
        );
    };

    info!("Release acknowledged for user {}", user_id);
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "botId": state.self_bot_id})),
    )
}

/// A configured, non-empty secret must match exactly. No secret configured
/// means the endpoint accepts nothing.
fn secret_matches(expected: Option<&str>, presented: &str) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => expected == presented,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_must_match_exactly() {
        assert!(secret_matches(Some("zone-secret"), "zone-secret"));
        assert!(!secret_matches(Some("zone-secret"), "wrong"));
        assert!(!secret_matches(Some("zone-secret"), ""));
    }

    #[test]
    fn missing_or_empty_secret_rejects_everything() {
        assert!(!secret_matches(None, "anything"));
        assert!(!secret_matches(None, ""));
        assert!(!secret_matches(Some(""), ""));
    }
}
