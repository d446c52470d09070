use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{LeadStatus, StepFamily};

/// A prospective customer being followed up with on behalf of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    /// Key of the next step to send; unset until the first follow-up goes out.
    #[serde(default)]
    pub follow_up_sent: Option<String>,
    pub status: LeadStatus,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Only leads handed to the AI sales agent are processed.
    #[serde(default)]
    pub ai_assigned: bool,
}

impl Lead {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: String::new(),
            email: None,
            phone: None,
            event_type: None,
            follow_up_sent: None,
            status: LeadStatus::NewInquiry,
            scheduled_for: None,
            ai_assigned: true,
        }
    }

    pub fn family(&self) -> StepFamily {
        StepFamily::for_event(self.event_type.as_deref())
    }

    /// First name with its initial capitalized, for greetings.
    pub fn first_name(&self) -> String {
        let first = self.name.split_whitespace().next().unwrap_or("");
        let mut chars = first.chars();
        match chars.next() {
            Some(c) => c.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}
