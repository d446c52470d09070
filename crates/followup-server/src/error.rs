use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use followup_core::error::{ErrorKind, FollowupError};

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(anyhow::Error::new(BadRequest(msg.into())))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BadRequest(String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequest>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<FollowupError>() {
            match e {
                FollowupError::JobNotFound(_) | FollowupError::TenantNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                other => match other.kind() {
                    ErrorKind::Auth => StatusCode::UNAUTHORIZED,
                    ErrorKind::Configuration => StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorKind::ContentUnavailable | ErrorKind::Transient => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                },
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
