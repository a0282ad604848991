//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health` — readiness probe (§4.8, §6).
///
/// Uses the cached adapter health value rather than probing the sandbox
/// runtime on every call.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.registry.len().await;
    let lifetime_sessions = state.registry.lifetime_sessions();
    let sandbox_ok = state.health_cache.get(&state.adapter).await;

    Json(json!({
        "status": if sandbox_ok { "ok" } else { "degraded" },
        "sandbox": if sandbox_ok { "ok" } else { "unavailable" },
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "lifetimeSessions": lifetime_sessions,
    }))
}
