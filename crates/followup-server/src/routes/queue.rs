use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use followup_core::orchestrator::PROCESS_FOLLOW_UPS;
use followup_core::queue::JobState;
use followup_core::FollowupError;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    pub state: Option<String>,
}

fn parse_state(raw: &str) -> Result<JobState, AppError> {
    match raw {
        "waiting" => Ok(JobState::Waiting),
        "active" => Ok(JobState::Active),
        "completed" => Ok(JobState::Completed),
        "failed" => Ok(JobState::Failed),
        other => Err(AppError::bad_request(format!(
            "unknown job state '{other}' (expected waiting, active, completed or failed)"
        ))),
    }
}

/// GET /api/queue: counts by state plus jobs, newest first.
pub async fn get_queue(
    State(app): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = query.state.as_deref().map(parse_state).transpose()?;
    let queue = app.queue.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<_, FollowupError> {
        let counts = queue.counts()?;
        let jobs: Vec<_> = queue
            .list()?
            .into_iter()
            .filter(|j| filter.map_or(true, |s| j.state == s))
            .collect();
        Ok(serde_json::json!({
            "queue": queue.name(),
            "counts": counts,
            "jobs": jobs,
        }))
    })
    .await??;
    Ok(Json(result))
}

/// GET /api/queue/jobs/{id}
pub async fn get_job(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job_id =
        Uuid::parse_str(&id).map_err(|_| AppError::bad_request(format!("invalid job id '{id}'")))?;
    let queue = app.queue.clone();
    let job = tokio::task::spawn_blocking(move || queue.get(job_id))
        .await??
        .ok_or(FollowupError::JobNotFound(id))?;
    Ok(Json(serde_json::to_value(job)?))
}

/// POST /api/queue/jobs: enqueue a follow-up run due now.
pub async fn enqueue_follow_ups(
    State(app): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let queue = app.queue.clone();
    let options = app.job_options;
    let job = tokio::task::spawn_blocking(move || {
        let now = chrono::Utc::now();
        queue.enqueue(
            PROCESS_FOLLOW_UPS,
            serde_json::json!({ "triggered_at": now, "source": "http" }),
            options,
            now,
        )
    })
    .await??;
    tracing::info!(job_id = %job.id, "follow-up run enqueued over http");
    Ok((StatusCode::CREATED, Json(serde_json::to_value(job)?)))
}
