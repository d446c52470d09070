//! Wiring from configuration to running services: the store, the job queue,
//! the orchestrator behind the worker, the daily trigger, and the HTTP
//! listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use followup_core::config::Config;
use followup_core::content::ContentResolver;
use followup_core::credentials::CredentialManager;
use followup_core::dispatch::Dispatcher;
use followup_core::orchestrator::{FollowUpJob, Orchestrator, PROCESS_FOLLOW_UPS};
use followup_core::queue::JobQueue;
use followup_core::scheduler::DailyTrigger;
use followup_core::store::{DocumentStore, LockStore, RedbStore};
use followup_core::worker::Worker;
use followup_providers::Secrets;

use crate::state::AppState;

pub fn open_store(config: &Config) -> anyhow::Result<Arc<RedbStore>> {
    let path = &config.storage.state_path;
    let store = RedbStore::open(path).with_context(|| format!("opening store {}", path.display()))?;
    Ok(Arc::new(store))
}

pub fn open_queue(config: &Config) -> anyhow::Result<Arc<JobQueue>> {
    let path = &config.storage.queue_path;
    let queue = JobQueue::open(path, config.queue.name.clone())
        .with_context(|| format!("opening job queue {}", path.display()))?;
    Ok(Arc::new(queue))
}

/// Assemble the orchestrator with the HTTP-backed collaborators. `locks`
/// must be shared by every worker serving the same tenants.
pub fn build_orchestrator(
    config: &Config,
    secrets: &Secrets,
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockStore>,
) -> anyhow::Result<Arc<Orchestrator>> {
    let http = followup_providers::http_client().context("building http client")?;
    let providers = followup_providers::mail_providers(&http, secrets);
    let sms = followup_providers::sms_transport(&http, secrets);
    if sms.is_none() {
        tracing::warn!("TWILIO_ACCOUNT_SID/TWILIO_AUTH_TOKEN not set; sms steps will fail");
    }
    let generator = followup_providers::content_generator(&http, secrets, &config.generation);

    let credentials = CredentialManager::new(
        store.clone(),
        locks,
        providers,
        config.credentials.refresh_policy(),
    );
    let content = ContentResolver::new(store.clone(), generator);
    let dispatcher = Dispatcher::new(store.clone(), sms, config.delivery.settings());
    Ok(Arc::new(Orchestrator::new(
        store,
        credentials,
        content,
        dispatcher,
    )))
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Worker, daily trigger and HTTP server sharing one shutdown signal.
pub struct Runtime {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    queue: Arc<JobQueue>,
    addr: SocketAddr,
}

impl Runtime {
    /// Open storage, bind the configured port, and start every service.
    pub async fn start(config: &Config, secrets: &Secrets) -> anyhow::Result<Self> {
        let store = open_store(config)?;
        let queue = open_queue(config)?;
        let orchestrator = build_orchestrator(config, secrets, store.clone(), store)?;
        let addr = format!("0.0.0.0:{}", config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        Self::start_with(config, queue, orchestrator, listener)
    }

    /// Start on a pre-bound listener with an already-built orchestrator.
    pub fn start_with(
        config: &Config,
        queue: Arc<JobQueue>,
        orchestrator: Arc<Orchestrator>,
        listener: tokio::net::TcpListener,
    ) -> anyhow::Result<Self> {
        let addr = listener.local_addr()?;
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let worker = Worker::new(queue.clone(), config.queue.worker_settings())
            .register(PROCESS_FOLLOW_UPS, Arc::new(FollowUpJob::new(orchestrator)));
        tasks.push(("worker", tokio::spawn(worker.run(rx.clone()))));

        if config.schedule.enabled {
            let trigger = DailyTrigger::new(
                queue.clone(),
                config.schedule.hour,
                config.schedule.minute,
                config.queue.job_options(),
            )?;
            tasks.push(("trigger", tokio::spawn(trigger.run(rx.clone()))));
        } else {
            tracing::info!("daily schedule disabled; jobs run only when enqueued");
        }

        let state = AppState::new(queue.clone(), config.server.environment.clone())
            .with_job_options(config.queue.job_options());
        let mut http_rx = rx;
        tasks.push((
            "http",
            tokio::spawn(async move {
                let stopped = async move {
                    while !*http_rx.borrow_and_update() {
                        if http_rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if let Err(e) = crate::serve_on(state, listener, stopped).await {
                    tracing::error!(error = %e, "http server failed");
                }
            }),
        ));

        tracing::info!(%addr, "follow-up service started");
        Ok(Self {
            shutdown,
            tasks,
            queue,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal every service, wait for in-flight work, then close the queue.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(service = name, error = %e, "service task ended abnormally");
            }
        }
        self.queue.close();
        tracing::info!("follow-up service stopped");
    }
}
