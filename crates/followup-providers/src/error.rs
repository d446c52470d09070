use followup_core::FollowupError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} rejected the grant ({status}): {body}")]
    GrantRejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {service}: {reason}")]
    InvalidResponse {
        service: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

impl From<ProviderError> for FollowupError {
    fn from(e: ProviderError) -> Self {
        match e {
            // The credential manager attaches the tenant id.
            ProviderError::GrantRejected { .. } => FollowupError::Auth {
                tenant_id: String::new(),
                reason: e.to_string(),
            },
            other => FollowupError::Provider(other.to_string()),
        }
    }
}

/// Turn a non-2xx response into [`ProviderError::Status`].
pub(crate) async fn check(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        service,
        status: status.as_u16(),
        body,
    })
}

/// Like [`check`] for OAuth token endpoints: 400 and 401 mean the refresh
/// token is no longer accepted.
pub(crate) async fn check_grant(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status().as_u16();
    match check(service, response).await {
        Err(ProviderError::Status { body, .. }) if status == 400 || status == 401 => {
            Err(ProviderError::GrantRejected {
                service,
                status,
                body,
            })
        }
        other => other,
    }
}
