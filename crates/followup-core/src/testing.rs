//! In-memory collaborators for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::channel::{
    ContentGenerator, GenerationRequest, MailProvider, Mailbox, OutgoingEmail, SentEmail,
    SmsMessage, SmsReceipt, SmsTransport, ThreadRef, TokenGrant,
};
use crate::conversation::{Conversation, ConversationMessage, SmsTranscript, TranscriptEntry};
use crate::error::{FollowupError, Result};
use crate::lead::Lead;
use crate::store::{DocumentStore, RedbStore};
use crate::tenant::{Credential, Tenant};
use crate::types::{DeliveryMethod, ProviderKind};

#[derive(Default)]
pub struct FakeMailbox {
    pub thread: Mutex<Option<ThreadRef>>,
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub fail_send: AtomicBool,
}

impl FakeMailbox {
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn find_latest_thread(&self, _lead_address: &str) -> Result<Option<ThreadRef>> {
        Ok(self.thread.lock().unwrap().clone())
    }

    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(FollowupError::Provider("mailbox unavailable".into()));
        }
        self.sent.lock().unwrap().push(email);
        Ok(SentEmail {
            message_id: Some("msg-1".into()),
        })
    }
}

pub struct FakeProvider {
    pub kind: ProviderKind,
    pub grant: TokenGrant,
    pub fail_refresh: bool,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub connected_with: Mutex<Vec<String>>,
    pub mailbox: Arc<FakeMailbox>,
    /// `(entered, proceed)`: refresh signals `entered` then waits on `proceed`.
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            grant: TokenGrant {
                access_token: "refreshed-access".into(),
                refresh_token: None,
                expires_in_seconds: 3600,
            },
            fail_refresh: false,
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            connected_with: Mutex::new(Vec::new()),
            mailbox: Arc::new(FakeMailbox::default()),
            gate: None,
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn revokes(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, proceed)) = &self.gate {
            entered.notify_one();
            proceed.notified().await;
        }
        if self.fail_refresh {
            return Err(FollowupError::auth("fake", "invalid_grant"));
        }
        Ok(self.grant.clone())
    }

    async fn revoke(&self, _credential: &Credential) {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn connect(&self, access_token: &str) -> Arc<dyn Mailbox> {
        self.connected_with
            .lock()
            .unwrap()
            .push(access_token.to_string());
        self.mailbox.clone()
    }
}

#[derive(Default)]
pub struct FakeSms {
    pub sent: Mutex<Vec<SmsMessage>>,
}

#[async_trait]
impl SmsTransport for FakeSms {
    async fn send(&self, message: SmsMessage) -> Result<SmsReceipt> {
        self.sent.lock().unwrap().push(message);
        Ok(SmsReceipt {
            message_sid: "SM123".into(),
        })
    }
}

pub struct FakeGenerator {
    pub reply: String,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        Ok(self.reply.clone())
    }
}

/// Redb-backed store whose SMS transcript writes always fail.
pub struct BrokenTranscripts(pub Arc<RedbStore>);

impl DocumentStore for BrokenTranscripts {
    fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.0.tenant(tenant_id)
    }

    fn active_tenants(&self) -> Result<Vec<Tenant>> {
        self.0.active_tenants()
    }

    fn set_credential(&self, tenant_id: &str, credential: Credential) -> Result<()> {
        self.0.set_credential(tenant_id, credential)
    }

    fn clear_credential(&self, tenant_id: &str) -> Result<()> {
        self.0.clear_credential(tenant_id)
    }

    fn eligible_leads(&self, tenant_id: &str) -> Result<Vec<Lead>> {
        self.0.eligible_leads(tenant_id)
    }

    fn put_lead(&self, lead: &Lead) -> Result<()> {
        self.0.put_lead(lead)
    }

    fn conversation(&self, tenant_id: &str, lead_id: &str) -> Result<Option<Conversation>> {
        self.0.conversation(tenant_id, lead_id)
    }

    fn messages(&self, tenant_id: &str, lead_id: &str) -> Result<Vec<ConversationMessage>> {
        self.0.messages(tenant_id, lead_id)
    }

    fn record_sent(
        &self,
        tenant_id: &str,
        lead_id: &str,
        body: &str,
        method: DeliveryMethod,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        self.0.record_sent(tenant_id, lead_id, body, method, now)
    }

    fn append_transcript(
        &self,
        _tenant_id: &str,
        _phone: &str,
        _client_name: &str,
        _entry: TranscriptEntry,
    ) -> Result<SmsTranscript> {
        Err(FollowupError::Store("transcript table unavailable".into()))
    }
}
