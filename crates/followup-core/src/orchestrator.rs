//! The daily follow-up run.
//!
//! Tenants are processed one after another, and so are the leads of each
//! tenant. A failure is contained to the unit it happened in: a lead error
//! is counted and the next lead proceeds; a tenant error (credential refresh
//! failure, lead query failure) is counted and the next tenant proceeds.
//! Only failing to list tenants aborts the run, which fails the job and lets
//! the queue retry it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::Mailbox;
use crate::content::ContentResolver;
use crate::credentials::{ChannelResolution, CredentialManager};
use crate::dispatch::{DeliveryResult, Dispatcher};
use crate::error::{ErrorKind, Result};
use crate::lead::Lead;
use crate::queue::Job;
use crate::sequencer::{self, Decision, SkipReason};
use crate::store::DocumentStore;
use crate::tenant::Tenant;
use crate::worker::JobHandler;

/// Queue job name for the daily run.
pub const PROCESS_FOLLOW_UPS: &str = "process-follow-ups";

/// Tally of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub tenants_seen: usize,
    pub tenants_not_connected: usize,
    pub tenants_failed: usize,
    pub leads_seen: usize,
    pub sent: usize,
    pub skipped: usize,
    pub content_unavailable: usize,
    pub lead_failures: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeadOutcome {
    Sent {
        step: String,
        delivery: DeliveryResult,
    },
    Skipped(SkipReason),
}

pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    credentials: CredentialManager,
    content: ContentResolver,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        credentials: CredentialManager,
        content: ContentResolver,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            credentials,
            content,
            dispatcher,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let tenants = self.store.active_tenants()?;
        tracing::info!(tenants = tenants.len(), "follow-up run started");

        let mut report = RunReport::default();
        for tenant in &tenants {
            report.tenants_seen += 1;
            if let Err(e) = self.run_tenant(tenant, now, &mut report).await {
                report.tenants_failed += 1;
                tracing::error!(tenant_id = %tenant.id, kind = ?e.kind(), error = %e, "tenant run failed");
            }
        }

        tracing::info!(
            tenants = report.tenants_seen,
            not_connected = report.tenants_not_connected,
            tenants_failed = report.tenants_failed,
            leads = report.leads_seen,
            sent = report.sent,
            skipped = report.skipped,
            content_unavailable = report.content_unavailable,
            lead_failures = report.lead_failures,
            "follow-up run finished"
        );
        Ok(report)
    }

    async fn run_tenant(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<()> {
        let channel = match self.credentials.resolve(&tenant.id, now).await? {
            ChannelResolution::NotConnected => {
                report.tenants_not_connected += 1;
                tracing::info!(tenant_id = %tenant.id, "no channel connected; skipping tenant");
                return Ok(());
            }
            ChannelResolution::Connected(channel) => channel,
        };

        let leads = self.store.eligible_leads(&tenant.id)?;
        tracing::debug!(tenant_id = %tenant.id, leads = leads.len(), token = ?channel.token_source, "processing tenant");

        for lead in &leads {
            report.leads_seen += 1;
            match self
                .process_lead(tenant, lead, channel.mailbox.as_ref(), now)
                .await
            {
                Ok(LeadOutcome::Sent { .. }) => report.sent += 1,
                Ok(LeadOutcome::Skipped(reason)) => {
                    report.skipped += 1;
                    if reason.is_configuration_problem() {
                        tracing::warn!(tenant_id = %tenant.id, lead_id = %lead.id, %reason, "lead skipped");
                    } else {
                        tracing::debug!(tenant_id = %tenant.id, lead_id = %lead.id, %reason, "lead skipped");
                    }
                }
                Err(e) if e.kind() == ErrorKind::ContentUnavailable => {
                    report.content_unavailable += 1;
                    tracing::warn!(tenant_id = %tenant.id, lead_id = %lead.id, "no content generated; will retry next run");
                }
                Err(e) => {
                    report.lead_failures += 1;
                    tracing::error!(tenant_id = %tenant.id, lead_id = %lead.id, kind = ?e.kind(), error = %e, "lead follow-up failed");
                }
            }
        }
        Ok(())
    }

    /// Sequencer, content, delivery, then persist. State is written only
    /// after the message went out.
    pub async fn process_lead(
        &self,
        tenant: &Tenant,
        lead: &Lead,
        mailbox: &dyn Mailbox,
        now: DateTime<Utc>,
    ) -> Result<LeadOutcome> {
        let conversation = self.store.conversation(&tenant.id, &lead.id)?;
        let fire = match sequencer::next_action(lead, tenant, conversation.as_ref(), now) {
            Decision::Fire(fire) => fire,
            Decision::Skip(reason) => return Ok(LeadOutcome::Skipped(reason)),
        };

        let content = self.content.resolve(tenant, lead, &fire).await?;
        let delivery = self
            .dispatcher
            .deliver(tenant, lead, fire.step.delivery_method, &content.body, mailbox, now)
            .await?;

        let advanced = sequencer::advance(lead, &fire, now);
        self.store.put_lead(&advanced)?;
        self.store
            .record_sent(&tenant.id, &lead.id, &content.body, delivery.method, now)?;
        tracing::info!(
            tenant_id = %tenant.id,
            lead_id = %lead.id,
            step = %fire.step.key,
            next = %fire.next_step.key,
            method = %delivery.method,
            "follow-up sent"
        );

        Ok(LeadOutcome::Sent {
            step: fire.step.key,
            delivery,
        })
    }
}

// ---------------------------------------------------------------------------
// Queue integration
// ---------------------------------------------------------------------------

/// Runs the orchestrator for each `process-follow-ups` job.
pub struct FollowUpJob {
    orchestrator: Arc<Orchestrator>,
}

impl FollowUpJob {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for FollowUpJob {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value> {
        tracing::info!(job_id = %job.id, attempt = job.attempts_made + 1, "processing follow-ups");
        let report = self.orchestrator.run(Utc::now()).await?;
        Ok(serde_json::to_value(report)?)
    }
}
