use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// GET /: liveness check.
pub async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Server is running successfully",
        "timeStamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "environment": app.environment,
    }))
}
