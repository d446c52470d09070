//! Queue worker: claims due jobs and runs the handler registered under the
//! job's name.
//!
//! Each handler runs in its own task so a panic surfaces as a `JoinError`
//! and is recorded as a job failure instead of taking the worker down.
//! Shutdown stops claiming new jobs; a job already running is awaited.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{FollowupError, Result};
use crate::queue::{FailOutcome, Job, JobQueue};

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one job. The returned value is logged on completion.
    async fn handle(&self, job: &Job) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Sleep between polls when the queue has nothing due.
    pub poll_interval: std::time::Duration,
    /// How long a claimed job stays locked to this worker.
    pub lock_duration: chrono::Duration,
    /// How often expired locks are swept back into the queue.
    pub stalled_interval: chrono::Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(1),
            lock_duration: chrono::Duration::seconds(300),
            stalled_interval: chrono::Duration::seconds(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobRunOutcome {
    Completed(serde_json::Value),
    Failed { error: String, outcome: FailOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub job_id: Uuid,
    pub name: String,
    pub outcome: JobRunOutcome,
}

pub struct Worker {
    queue: Arc<JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            settings,
        }
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Claim and run at most one job due at `now`.
    pub async fn process_one(&self, now: DateTime<Utc>) -> Result<Option<JobRun>> {
        let Some(job) = self.queue.claim_next(now, self.settings.lock_duration)? else {
            return Ok(None);
        };
        let job_id = job.id;
        let name = job.name.clone();

        let result = match self.handlers.get(&job.name) {
            None => Err(FollowupError::Configuration(format!(
                "no handler registered for job '{}'",
                job.name
            ))),
            Some(handler) => {
                let handler = handler.clone();
                let task = tokio::spawn(async move { handler.handle(&job).await });
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(FollowupError::HandlerPanicked(panic_message(e))),
                    Err(e) => Err(FollowupError::HandlerPanicked(e.to_string())),
                }
            }
        };

        let finished = Utc::now().max(now);
        let outcome = match result {
            Ok(value) => {
                self.queue.complete(job_id, finished)?;
                JobRunOutcome::Completed(value)
            }
            Err(e) => {
                let error = e.to_string();
                let outcome = self.queue.fail(job_id, &error, finished)?;
                JobRunOutcome::Failed { error, outcome }
            }
        };
        Ok(Some(JobRun {
            job_id,
            name,
            outcome,
        }))
    }

    /// Poll until `shutdown` flips to `true`. Handler and queue errors are
    /// logged; the loop keeps going.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.queue.name(), handlers = self.handlers.len(), "worker started");
        let mut next_stall_check = Utc::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            if now >= next_stall_check {
                if let Err(e) = self.queue.recover_stalled(now) {
                    tracing::warn!(error = %e, "stalled job sweep failed");
                }
                next_stall_check = now + self.settings.stalled_interval;
            }

            match self.process_one(now).await {
                Ok(Some(run)) => {
                    match &run.outcome {
                        JobRunOutcome::Completed(value) => {
                            tracing::info!(job_id = %run.job_id, name = %run.name, result = %value, "job completed")
                        }
                        JobRunOutcome::Failed { error, outcome } => {
                            tracing::warn!(job_id = %run.job_id, name = %run.name, error = %error, outcome = ?outcome, "job failed")
                        }
                    }
                    // Drain whatever else is due before sleeping.
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "worker poll failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(queue = %self.queue.name(), "worker stopped");
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
