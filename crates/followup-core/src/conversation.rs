//! Per-(tenant, lead) conversation state, the SMS transcript, and the simple
//! per-tenant counters bumped after each send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the tenant (or by this engine on its behalf).
    Outbound,
    /// Received from the lead.
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub direction: Direction,
    pub body: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub tenant_id: String,
    pub lead_id: String,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_replied: bool,
    #[serde(default)]
    pub sent_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(tenant_id: impl Into<String>, lead_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            lead_id: lead_id.into(),
            last_sent_at: None,
            last_received_at: None,
            has_replied: false,
            sent_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// SMS transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub body: String,
    pub sender: String,
    pub at: DateTime<Utc>,
}

/// Text-message thread between a tenant's number and one lead phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsTranscript {
    pub tenant_id: String,
    pub phone: String,
    pub client_name: String,
    #[serde(default)]
    pub messages: Vec<TranscriptEntry>,
    #[serde(default)]
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantMetrics {
    pub messages_sent: u64,
    pub emails_sent: u64,
    pub sms_sent: u64,
    /// Sends that opened a new conversation record.
    pub first_contacts: u64,
    pub updated_at: Option<DateTime<Utc>>,
}
