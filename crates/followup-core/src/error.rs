use thiserror::Error;

#[derive(Debug, Error)]
pub enum FollowupError {
    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("provider call failed: {0}")]
    Provider(String),

    #[error("authentication failed for tenant {tenant_id}: {reason}")]
    Auth { tenant_id: String, reason: String },

    #[error("no content available for lead {lead_id}")]
    ContentUnavailable { lead_id: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid id '{0}': ids may not contain '/'")]
    InvalidId(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job handler panicked: {0}")]
    HandlerPanicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by the orchestrator to decide how a failure
/// is reported and whether the unit of work is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store or provider I/O failed. Retried by the queue at job level, or
    /// simply picked up again on the next daily run at lead level.
    Transient,
    /// Credential refresh failed. Terminal for the tenant until re-linked.
    Auth,
    /// Generation returned nothing. Skip without advancing.
    ContentUnavailable,
    /// Missing template step, reference timestamp or channel data.
    Configuration,
}

impl FollowupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FollowupError::Auth { .. } => ErrorKind::Auth,
            FollowupError::ContentUnavailable { .. } => ErrorKind::ContentUnavailable,
            FollowupError::Configuration(_)
            | FollowupError::InvalidId(_)
            | FollowupError::TenantNotFound(_) => ErrorKind::Configuration,
            FollowupError::Store(_)
            | FollowupError::Queue(_)
            | FollowupError::Provider(_)
            | FollowupError::JobNotFound(_)
            | FollowupError::HandlerPanicked(_)
            | FollowupError::Io(_)
            | FollowupError::Yaml(_)
            | FollowupError::Json(_) => ErrorKind::Transient,
        }
    }

    pub fn auth(tenant_id: impl Into<String>, reason: impl Into<String>) -> Self {
        FollowupError::Auth {
            tenant_id: tenant_id.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FollowupError>;
