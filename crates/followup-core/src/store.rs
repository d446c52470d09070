//! Document store seams and the redb implementation.
//!
//! The engine reads and writes through two narrow traits:
//! [`DocumentStore`] for tenants, leads, conversations and their side
//! records, and [`LockStore`] for per-tenant refresh locks. A deployment
//! whose workers share one database supplies its own implementations;
//! [`RedbStore`] serves a single worker process from a local file.
//!
//! # Table design
//!
//! Every redb table maps a `&str` key to a JSON-encoded document:
//! ```text
//! tenants          tenant_id                         -> Tenant
//! leads            lead_id                           -> Lead
//! conversations    tenant_id/lead_id                 -> Conversation
//! messages         tenant_id/lead_id/ts_ms/uuid      -> ConversationMessage
//! locks            tenant_id                         -> RefreshLock
//! sms_transcripts  tenant_id/phone                   -> SmsTranscript
//! metrics          tenant_id                         -> TenantMetrics
//! ```
//!
//! Ids may not contain `/`, so a key prefix names exactly one tenant or
//! conversation. Message keys zero-pad the millisecond timestamp so lexical
//! order equals time order, and a prefix range scan returns one
//! conversation's history. redb serializes write transactions, so the
//! read-modify-write helpers below (lock acquisition in particular) are
//! atomic with respect to every other task sharing this `RedbStore`.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::conversation::{
    Conversation, ConversationMessage, Direction, SmsTranscript, TenantMetrics, TranscriptEntry,
};
use crate::error::{FollowupError, Result};
use crate::lead::Lead;
use crate::lock::RefreshLock;
use crate::tenant::{Credential, Tenant};
use crate::types::DeliveryMethod;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type Docs = TableDefinition<'static, &'static str, &'static [u8]>;

const TENANTS: Docs = TableDefinition::new("tenants");
const LEADS: Docs = TableDefinition::new("leads");
const CONVERSATIONS: Docs = TableDefinition::new("conversations");
const MESSAGES: Docs = TableDefinition::new("messages");
const LOCKS: Docs = TableDefinition::new("locks");
const TRANSCRIPTS: Docs = TableDefinition::new("sms_transcripts");
const METRICS: Docs = TableDefinition::new("metrics");

const ALL_TABLES: [Docs; 7] = [
    TENANTS,
    LEADS,
    CONVERSATIONS,
    MESSAGES,
    LOCKS,
    TRANSCRIPTS,
    METRICS,
];

fn db_err(e: impl std::fmt::Display) -> FollowupError {
    FollowupError::Store(e.to_string())
}

fn key_part(id: &str) -> Result<&str> {
    if id.contains('/') {
        return Err(FollowupError::InvalidId(id.to_string()));
    }
    Ok(id)
}

fn pair_key(tenant_id: &str, other: &str) -> Result<String> {
    Ok(format!("{}/{}", key_part(tenant_id)?, key_part(other)?))
}

fn message_key(tenant_id: &str, lead_id: &str, at: DateTime<Utc>) -> Result<String> {
    let ms = at.timestamp_millis().max(0);
    Ok(format!("{}/{ms:020}/{}", pair_key(tenant_id, lead_id)?, Uuid::new_v4()))
}

/// `[start, end)` covering every key that begins with `tenant/lead/`.
fn message_range(tenant_id: &str, lead_id: &str) -> Result<(String, String)> {
    let prefix = pair_key(tenant_id, lead_id)?;
    // '0' is the byte right after '/'.
    Ok((format!("{prefix}/"), format!("{prefix}0")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Documents the follow-up run reads and writes.
pub trait DocumentStore: Send + Sync {
    fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;

    /// Tenants with the sales agent switched on, in id order.
    fn active_tenants(&self) -> Result<Vec<Tenant>>;

    /// Persist a refreshed credential. The only tenant mutation in the core
    /// besides [`DocumentStore::clear_credential`].
    fn set_credential(&self, tenant_id: &str, credential: Credential) -> Result<()>;

    /// Drop the credential and the connected-inbox marker so future runs skip
    /// the tenant until the mailbox is reconnected.
    fn clear_credential(&self, tenant_id: &str) -> Result<()>;

    /// Leads of `tenant_id` assigned to the agent and in a follow-up-able
    /// status, in id order.
    fn eligible_leads(&self, tenant_id: &str) -> Result<Vec<Lead>>;

    fn put_lead(&self, lead: &Lead) -> Result<()>;

    fn conversation(&self, tenant_id: &str, lead_id: &str) -> Result<Option<Conversation>>;

    /// Full bidirectional history of one conversation, newest first.
    fn messages(&self, tenant_id: &str, lead_id: &str) -> Result<Vec<ConversationMessage>>;

    /// Record an outbound follow-up: bump the conversation (creating it if
    /// absent), append the message to its history, and update counters.
    fn record_sent(
        &self,
        tenant_id: &str,
        lead_id: &str,
        body: &str,
        method: DeliveryMethod,
        now: DateTime<Utc>,
    ) -> Result<Conversation>;

    /// Append to the transcript for `phone`, creating it if absent.
    fn append_transcript(
        &self,
        tenant_id: &str,
        phone: &str,
        client_name: &str,
        entry: TranscriptEntry,
    ) -> Result<SmsTranscript>;
}

/// Refresh lock records. Every worker that may refresh a tenant's token
/// must share one `LockStore`.
pub trait LockStore: Send + Sync {
    fn refresh_lock(&self, tenant_id: &str) -> Result<Option<RefreshLock>>;

    /// Write `candidate` unless a live (unexpired at `now`) lock already
    /// exists, atomically. Returns whether the candidate was written.
    fn try_put_lock(&self, candidate: RefreshLock, now: DateTime<Utc>) -> Result<bool>;

    /// Returns whether a record was removed.
    fn delete_lock(&self, tenant_id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// Single-process store on a local redb file.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the redb database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for table in ALL_TABLES {
            wt.open_table(table).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    // -- generic document helpers ------------------------------------------

    fn get<T: DeserializeOwned>(&self, table: Docs, key: &str) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(table).map_err(db_err)?;
        match t.get(key).map_err(db_err)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, table: Docs, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut t = wt.open_table(table).map_err(db_err)?;
            t.insert(key, bytes.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, table: Docs, key: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let removed = {
            let mut t = wt.open_table(table).map_err(db_err)?;
            let old = t.remove(key).map_err(db_err)?;
            old.is_some()
        };
        wt.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn scan<T: DeserializeOwned>(&self, table: Docs) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(table).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    /// Read-modify-write a single document inside one write transaction.
    ///
    /// `f` receives the current value (if any) and returns the value to
    /// store, or `None` to leave the table untouched.
    fn modify<T, F>(&self, table: Docs, key: &str, f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let updated = {
            let mut t = wt.open_table(table).map_err(db_err)?;
            let current: Option<T> = match t.get(key).map_err(db_err)? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            let updated = f(current);
            if let Some(value) = &updated {
                let bytes = serde_json::to_vec(value)?;
                t.insert(key, bytes.as_slice()).map_err(db_err)?;
            }
            updated
        };
        wt.commit().map_err(db_err)?;
        Ok(updated)
    }

    // -- seeding and inspection --------------------------------------------

    pub fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.put(TENANTS, key_part(&tenant.id)?, tenant)
    }

    pub fn lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        self.get(LEADS, lead_id)
    }

    pub fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.put(
            CONVERSATIONS,
            &pair_key(&conversation.tenant_id, &conversation.lead_id)?,
            conversation,
        )
    }

    pub fn add_message(
        &self,
        tenant_id: &str,
        lead_id: &str,
        message: &ConversationMessage,
    ) -> Result<()> {
        self.put(MESSAGES, &message_key(tenant_id, lead_id, message.at)?, message)
    }

    pub fn metrics(&self, tenant_id: &str) -> Result<TenantMetrics> {
        Ok(self.get(METRICS, tenant_id)?.unwrap_or_default())
    }

    pub fn transcript(&self, tenant_id: &str, phone: &str) -> Result<Option<SmsTranscript>> {
        self.get(TRANSCRIPTS, &pair_key(tenant_id, phone)?)
    }
}

impl DocumentStore for RedbStore {
    fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.get(TENANTS, tenant_id)
    }

    fn active_tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.scan(TENANTS)?;
        tenants.retain(|t| t.agent_enabled);
        Ok(tenants)
    }

    fn set_credential(&self, tenant_id: &str, credential: Credential) -> Result<()> {
        let updated = self.modify(TENANTS, tenant_id, |t: Option<Tenant>| {
            t.map(|mut t| {
                t.credential = Some(credential);
                t
            })
        })?;
        updated
            .map(|_| ())
            .ok_or_else(|| FollowupError::TenantNotFound(tenant_id.to_string()))
    }

    fn clear_credential(&self, tenant_id: &str) -> Result<()> {
        let updated = self.modify(TENANTS, tenant_id, |t: Option<Tenant>| {
            t.map(|mut t| {
                t.credential = None;
                t.connected_inbox = None;
                t
            })
        })?;
        updated
            .map(|_| ())
            .ok_or_else(|| FollowupError::TenantNotFound(tenant_id.to_string()))
    }

    fn eligible_leads(&self, tenant_id: &str) -> Result<Vec<Lead>> {
        let mut leads: Vec<Lead> = self.scan(LEADS)?;
        leads.retain(|l| l.tenant_id == tenant_id && l.ai_assigned && l.status.is_eligible());
        Ok(leads)
    }

    fn put_lead(&self, lead: &Lead) -> Result<()> {
        self.put(LEADS, key_part(&lead.id)?, lead)
    }

    fn conversation(&self, tenant_id: &str, lead_id: &str) -> Result<Option<Conversation>> {
        self.get(CONVERSATIONS, &pair_key(tenant_id, lead_id)?)
    }

    fn messages(&self, tenant_id: &str, lead_id: &str) -> Result<Vec<ConversationMessage>> {
        let (start, end) = message_range(tenant_id, lead_id)?;
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(MESSAGES).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.range(start.as_str()..end.as_str()).map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(decode::<ConversationMessage>(v.value())?);
        }
        out.reverse();
        Ok(out)
    }

    fn record_sent(
        &self,
        tenant_id: &str,
        lead_id: &str,
        body: &str,
        method: DeliveryMethod,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let convo_key = pair_key(tenant_id, lead_id)?;
        let msg_key = message_key(tenant_id, lead_id, now)?;
        let message = ConversationMessage {
            direction: Direction::Outbound,
            body: body.to_string(),
            at: now,
        };
        let message_bytes = serde_json::to_vec(&message)?;

        let wt = self.db.begin_write().map_err(db_err)?;
        let conversation = {
            let mut convos = wt.open_table(CONVERSATIONS).map_err(db_err)?;
            let existing: Option<Conversation> = match convos.get(convo_key.as_str()).map_err(db_err)? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            let first_contact = existing.is_none();
            let mut conversation =
                existing.unwrap_or_else(|| Conversation::new(tenant_id, lead_id, now));
            conversation.last_sent_at = Some(now);
            conversation.sent_count += 1;
            conversation.updated_at = now;
            let bytes = serde_json::to_vec(&conversation)?;
            convos
                .insert(convo_key.as_str(), bytes.as_slice())
                .map_err(db_err)?;

            let mut messages = wt.open_table(MESSAGES).map_err(db_err)?;
            messages
                .insert(msg_key.as_str(), message_bytes.as_slice())
                .map_err(db_err)?;

            let mut metrics_table = wt.open_table(METRICS).map_err(db_err)?;
            let mut metrics: TenantMetrics = match metrics_table.get(tenant_id).map_err(db_err)? {
                Some(v) => decode(v.value())?,
                None => TenantMetrics::default(),
            };
            metrics.messages_sent += 1;
            match method {
                DeliveryMethod::Email => metrics.emails_sent += 1,
                DeliveryMethod::Sms => metrics.sms_sent += 1,
            }
            if first_contact {
                metrics.first_contacts += 1;
            }
            metrics.updated_at = Some(now);
            let bytes = serde_json::to_vec(&metrics)?;
            metrics_table
                .insert(tenant_id, bytes.as_slice())
                .map_err(db_err)?;

            conversation
        };
        wt.commit().map_err(db_err)?;
        Ok(conversation)
    }

    fn append_transcript(
        &self,
        tenant_id: &str,
        phone: &str,
        client_name: &str,
        entry: TranscriptEntry,
    ) -> Result<SmsTranscript> {
        let updated = self.modify(
            TRANSCRIPTS,
            &pair_key(tenant_id, phone)?,
            |current: Option<SmsTranscript>| {
                let mut transcript = current.unwrap_or_else(|| SmsTranscript {
                    tenant_id: tenant_id.to_string(),
                    phone: phone.to_string(),
                    client_name: client_name.to_string(),
                    messages: Vec::new(),
                    deleted: false,
                });
                transcript.messages.push(entry);
                transcript.deleted = false;
                Some(transcript)
            },
        )?;
        updated.ok_or_else(|| FollowupError::Store("transcript write produced nothing".into()))
    }
}

impl LockStore for RedbStore {
    fn refresh_lock(&self, tenant_id: &str) -> Result<Option<RefreshLock>> {
        self.get(LOCKS, tenant_id)
    }

    fn try_put_lock(&self, candidate: RefreshLock, now: DateTime<Utc>) -> Result<bool> {
        let key = candidate.tenant_id.clone();
        let mut acquired = false;
        self.modify(LOCKS, &key, |current: Option<RefreshLock>| match current {
            Some(lock) if lock.expires_at > now => None,
            _ => {
                acquired = true;
                Some(candidate)
            }
        })?;
        Ok(acquired)
    }

    fn delete_lock(&self, tenant_id: &str) -> Result<bool> {
        self.remove(LOCKS, tenant_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
