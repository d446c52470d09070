//! Tenant (business) records and the pieces nested inside them: the
//! connected-mailbox credential, the ordered follow-up template steps, and
//! the knowledge base handed to the content generator.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{DeliveryMethod, ProviderKind};

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// OAuth token pair authorizing the engine to act on a tenant's mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: ProviderKind,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Push-notification subscription registered with the provider, torn
    /// down on revocation.
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl Credential {
    /// True while `now + buffer` is still strictly before expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, buffer: chrono::Duration) -> bool {
        now + buffer < self.expires_at
    }
}

// ---------------------------------------------------------------------------
// FollowUpTemplateStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTemplateStep {
    /// Step identifier, e.g. `wedding_follow_up_3`.
    pub key: String,
    /// Whole days that must elapse since the reference timestamp.
    #[serde(alias = "schedule", deserialize_with = "deserialize_days")]
    pub delay_days: u32,
    /// Static HTML body. Empty (after stripping tags) means "generate".
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    #[serde(default)]
    pub enabled: bool,
}

impl FollowUpTemplateStep {
    pub fn new(key: impl Into<String>, delay_days: u32) -> Self {
        Self {
            key: key.into(),
            delay_days,
            content: String::new(),
            delivery_method: DeliveryMethod::Email,
            enabled: true,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_method(mut self, method: DeliveryMethod) -> Self {
        self.delivery_method = method;
        self
    }
}

/// Step delays arrive either as numbers or as numeric strings ("7").
fn deserialize_days<'de, D>(d: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Days {
        Number(u32),
        Text(String),
    }

    match Days::deserialize(d)? {
        Days::Number(n) => Ok(n),
        Days::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid step delay '{s}'"))),
    }
}

// ---------------------------------------------------------------------------
// KnowledgeBase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub question: String,
    pub answer: String,
}

/// Business facts given to the generator as grounding context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub questions: Vec<QuestionAnswer>,
    #[serde(default)]
    pub available_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub free_text: String,
    #[serde(default)]
    pub appointment_duration_minutes: Option<u32>,
    #[serde(default)]
    pub max_appointments: Option<u32>,
    /// Appointment slot configuration, passed through opaquely.
    #[serde(default)]
    pub appointment_slots: serde_json::Value,
}

impl KnowledgeBase {
    /// Render as the tagged text block the generator prompt expects.
    pub fn render(&self, business_name: &str, tenant_id: &str) -> String {
        let mut out = String::new();
        out.push_str("<knowledgebase>\n");
        out.push_str(&format!(
            "This is the knowledgebase data for {business_name}.\n"
        ));
        out.push_str("<questions_and_answers>\n");
        for qa in &self.questions {
            out.push_str(&format!(
                "<question>{}</question><answer>{}</answer>\n",
                qa.question, qa.answer
            ));
        }
        out.push_str("</questions_and_answers>\n");
        if let Some(max) = self.max_appointments {
            out.push_str(&format!(
                "<max_appointments_per_slot>{max}</max_appointments_per_slot>\n"
            ));
        }
        if let Some(minutes) = self.appointment_duration_minutes {
            out.push_str(&format!(
                "<appointment_duration_minutes>{minutes}</appointment_duration_minutes>\n"
            ));
        }
        out.push_str(&format!("<free_text>\n{}\n</free_text>\n", self.free_text));
        out.push_str("</knowledgebase>\n");
        out.push_str("<available_dates>\n");
        let dates: Vec<String> = self
            .available_dates
            .iter()
            .map(|d| d.format("%-d %B %Y").to_string())
            .collect();
        out.push_str(&dates.join(", "));
        out.push_str("\n</available_dates>\n");
        if !self.appointment_slots.is_null() {
            out.push_str(&format!(
                "<appointment_slots>\n{}\n</appointment_slots>\n",
                self.appointment_slots
            ));
        }
        out.push_str(&format!("<business_id>{tenant_id}</business_id>\n"));
        out
    }
}

// ---------------------------------------------------------------------------
// Tenant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Business mailbox address; conversations are keyed against it.
    pub email: String,
    /// Whether the AI sales agent is switched on for this business.
    #[serde(default)]
    pub agent_enabled: bool,
    #[serde(default)]
    pub credential: Option<Credential>,
    /// Address of the connected inbox, cleared together with the credential.
    #[serde(default)]
    pub connected_inbox: Option<String>,
    /// Sender number for SMS steps.
    #[serde(default)]
    pub sms_number: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub steps: Vec<FollowUpTemplateStep>,
    #[serde(default)]
    pub knowledge_base: KnowledgeBase,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            agent_enabled: true,
            credential: None,
            connected_inbox: None,
            sms_number: None,
            signature: None,
            steps: Vec::new(),
            knowledge_base: KnowledgeBase::default(),
        }
    }
}
