use std::sync::Arc;

use followup_core::queue::{JobOptions, JobQueue};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    /// Reported by the health endpoint.
    pub environment: String,
    /// Applied to follow-up jobs enqueued over HTTP.
    pub job_options: JobOptions,
}

impl AppState {
    pub fn new(queue: Arc<JobQueue>, environment: impl Into<String>) -> Self {
        Self {
            queue,
            environment: environment.into(),
            job_options: JobOptions::default(),
        }
    }

    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.job_options = options;
        self
    }
}
