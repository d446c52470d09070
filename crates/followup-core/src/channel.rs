//! Interfaces to the external collaborators: mailbox providers, the SMS
//! transport, and the content generator.
//!
//! Each mailbox provider implements [`MailProvider`] once. The credential
//! manager selects the provider for a tenant from its stored credential and
//! hands back a connected [`Mailbox`]; call sites never branch on the
//! provider tag again.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::ConversationMessage;
use crate::error::Result;
use crate::tenant::Credential;
use crate::types::ProviderKind;

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

/// Result of a successful token refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in_seconds: i64,
}

/// Latest message exchanged with a lead, used to thread a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub thread_id: String,
    /// Provider message id to reply to (RFC 822 Message-ID for Gmail).
    pub message_id: String,
    pub subject: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    Send,
    Reply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub mode: SendMode,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Label (Gmail) or category (Outlook) applied to the sent message.
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    /// Some providers (Outlook `sendMail`) accept without returning an id.
    pub message_id: Option<String>,
}

/// A mailbox connected with a specific access token.
#[async_trait]
pub trait Mailbox: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Most recent message received from `lead_address`, if any.
    async fn find_latest_thread(&self, lead_address: &str) -> Result<Option<ThreadRef>>;

    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail>;
}

/// Identity-provider and mailbox factory for one provider kind.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Exchange a refresh token for a new access token. Fails with
    /// `FollowupError::Auth` on an invalid or revoked grant.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// Best-effort revocation. Implementations swallow their own errors.
    async fn revoke(&self, credential: &Credential);

    fn connect(&self, access_token: &str) -> Arc<dyn Mailbox>;
}

/// Registered mail providers keyed by kind.
#[derive(Clone, Default)]
pub struct MailProviders {
    providers: BTreeMap<ProviderKind, Arc<dyn MailProvider>>,
}

impl MailProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn MailProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn MailProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// SMS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SmsMessage {
    pub to: String,
    pub from: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmsReceipt {
    pub message_sid: String,
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, message: SmsMessage) -> Result<SmsReceipt>;
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Everything the generator is given to draft one follow-up.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub lead_name: String,
    pub business_name: String,
    /// Full bidirectional history, newest first.
    pub history: Vec<ConversationMessage>,
    /// Names which step of how many this message is.
    pub instruction: String,
    pub knowledge_base: String,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Draft a message body. An empty string means nothing usable came back.
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}
