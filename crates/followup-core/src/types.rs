use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::error::FollowupError;

/// Number of steps in every follow-up family. The marker pointing at the
/// last one means the sequence is exhausted.
pub const STEPS_PER_FAMILY: u32 = 7;

// ---------------------------------------------------------------------------
// LeadStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a lead, stored as its human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LeadStatus {
    NewInquiry,
    LeadContacted,
    /// "First Follow Up" through "Seventh Follow Up", or "Follow Up N" beyond.
    FollowUp(u32),
    AppointmentSet,
    VenueToured,
    /// Any status this engine does not act on (e.g. "Event Booked").
    Other(String),
}

impl LeadStatus {
    /// Statuses this engine never sends to.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::AppointmentSet | LeadStatus::VenueToured)
    }

    /// Statuses pulled by the daily eligible-lead query.
    pub fn is_eligible(&self) -> bool {
        match self {
            LeadStatus::NewInquiry | LeadStatus::LeadContacted => true,
            LeadStatus::FollowUp(n) => (1..STEPS_PER_FAMILY).contains(n),
            _ => false,
        }
    }
}

const ORDINALS: [&str; 7] = [
    "First", "Second", "Third", "Fourth", "Fifth", "Sixth", "Seventh",
];

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadStatus::NewInquiry => f.write_str("New Inquiry"),
            LeadStatus::LeadContacted => f.write_str("Lead Contacted"),
            LeadStatus::FollowUp(n) => match ORDINALS.get((*n as usize).wrapping_sub(1)) {
                Some(ordinal) => write!(f, "{ordinal} Follow Up"),
                None => write!(f, "Follow Up {n}"),
            },
            LeadStatus::AppointmentSet => f.write_str("Appointment Set"),
            LeadStatus::VenueToured => f.write_str("Venue Toured"),
            LeadStatus::Other(s) => f.write_str(s),
        }
    }
}

impl From<String> for LeadStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "New Inquiry" => return LeadStatus::NewInquiry,
            "Lead Contacted" => return LeadStatus::LeadContacted,
            "Appointment Set" => return LeadStatus::AppointmentSet,
            "Venue Toured" => return LeadStatus::VenueToured,
            _ => {}
        }
        if let Some(ordinal) = s.strip_suffix(" Follow Up") {
            if let Some(i) = ORDINALS.iter().position(|o| *o == ordinal) {
                return LeadStatus::FollowUp(i as u32 + 1);
            }
        }
        if let Some(n) = s.strip_prefix("Follow Up ").and_then(|n| n.parse().ok()) {
            return LeadStatus::FollowUp(n);
        }
        LeadStatus::Other(s)
    }
}

impl From<LeadStatus> for String {
    fn from(status: LeadStatus) -> Self {
        status.to_string()
    }
}

// ---------------------------------------------------------------------------
// DeliveryMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    #[default]
    Email,
    #[serde(alias = "text")]
    Sms,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMethod::Email => "email",
            DeliveryMethod::Sms => "sms",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProviderKind
// ---------------------------------------------------------------------------

/// Which mailbox provider a tenant's credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Google,
    Outlook,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Outlook => "outlook",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = FollowupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(ProviderKind::Google),
            "outlook" => Ok(ProviderKind::Outlook),
            _ => Err(FollowupError::Configuration(format!(
                "unknown mail provider '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StepFamily
// ---------------------------------------------------------------------------

/// Template family a lead follows, chosen from its event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepFamily {
    Wedding,
    NonWedding,
}

impl StepFamily {
    pub fn for_event(event_type: Option<&str>) -> Self {
        match event_type {
            Some(t) if t.trim().eq_ignore_ascii_case("wedding") => StepFamily::Wedding,
            _ => StepFamily::NonWedding,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            StepFamily::Wedding => "wedding_follow_up_",
            StepFamily::NonWedding => "non_wedding_follow_up_",
        }
    }

    pub fn key(self, number: u32) -> String {
        format!("{}{number}", self.prefix())
    }

    pub fn first_key(self) -> String {
        self.key(1)
    }

    pub fn final_key(self) -> String {
        self.key(STEPS_PER_FAMILY)
    }
}

fn step_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"follow_up_(\d+)$").expect("static regex"))
}

/// Extract the trailing step number from a key like `wedding_follow_up_3`.
pub fn step_number(key: &str) -> Option<u32> {
    step_number_re()
        .captures(key)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
