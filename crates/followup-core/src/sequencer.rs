//! Per-lead follow-up state machine.
//!
//! States are the ordered step keys of the lead's family plus the terminal
//! statuses. A lead's `follow_up_sent` marker names the next step to send;
//! it only ever moves to the step configured after it, and only once the
//! step's delay has elapsed since the reference timestamp. Every function
//! here is pure: the orchestrator persists the result of [`advance`] after a
//! successful send.

use chrono::{DateTime, Duration, Utc};

use crate::conversation::Conversation;
use crate::lead::Lead;
use crate::tenant::{FollowUpTemplateStep, Tenant};
use crate::types::{step_number, LeadStatus, StepFamily};

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    TerminalStatus(LeadStatus),
    /// The marker points at the family's final step.
    SequenceComplete,
    NoSteps,
    /// The stored marker matches no configured step.
    UnknownStep(String),
    /// The current step is the last one configured.
    NoNextStep(String),
    StepDisabled(String),
    /// No last-received (step 1) or last-sent (later steps) timestamp.
    MissingReference { step: String },
    NotDue { elapsed_days: i64, required_days: u32 },
}

impl SkipReason {
    /// Skips caused by tenant or lead data that a human needs to fix, as
    /// opposed to the sequence simply not being due.
    pub fn is_configuration_problem(&self) -> bool {
        matches!(
            self,
            SkipReason::NoSteps
                | SkipReason::UnknownStep(_)
                | SkipReason::NoNextStep(_)
                | SkipReason::MissingReference { .. }
        )
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TerminalStatus(s) => write!(f, "lead status '{s}' is terminal"),
            SkipReason::SequenceComplete => f.write_str("no more follow-ups to send"),
            SkipReason::NoSteps => f.write_str("tenant has no follow-up steps configured"),
            SkipReason::UnknownStep(k) => write!(f, "step '{k}' is not configured"),
            SkipReason::NoNextStep(k) => write!(f, "no step configured after '{k}'"),
            SkipReason::StepDisabled(k) => write!(f, "step '{k}' is disabled"),
            SkipReason::MissingReference { step } => {
                write!(f, "no reference timestamp to time step '{step}'")
            }
            SkipReason::NotDue {
                elapsed_days,
                required_days,
            } => write!(f, "{elapsed_days} of {required_days} days elapsed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FireDecision {
    pub step: FollowUpTemplateStep,
    pub next_step: FollowUpTemplateStep,
    /// 1-based position of `step` among the configured steps of its family.
    pub position: usize,
    /// Configured steps in that family.
    pub total_steps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Fire(FireDecision),
    Skip(SkipReason),
}

/// Decide whether `lead` is due a follow-up at `now`.
pub fn next_action(
    lead: &Lead,
    tenant: &Tenant,
    conversation: Option<&Conversation>,
    now: DateTime<Utc>,
) -> Decision {
    let family = lead.family();
    let current = lead
        .follow_up_sent
        .clone()
        .unwrap_or_else(|| family.first_key());

    if lead.status.is_terminal() {
        return Decision::Skip(SkipReason::TerminalStatus(lead.status.clone()));
    }
    if [StepFamily::Wedding, StepFamily::NonWedding]
        .iter()
        .any(|f| f.final_key() == current)
    {
        return Decision::Skip(SkipReason::SequenceComplete);
    }

    let steps = &tenant.steps;
    if steps.is_empty() {
        return Decision::Skip(SkipReason::NoSteps);
    }
    let index = match steps.iter().position(|s| s.key == current) {
        Some(i) => i,
        // Nothing sent yet: start from the first configured step.
        None if lead.follow_up_sent.is_none() => {
            tracing::warn!(
                lead_id = %lead.id,
                tenant_id = %tenant.id,
                key = %current,
                "default first step not configured; starting from first configured step"
            );
            0
        }
        // Something was sent: restarting would re-fire steps already sent.
        None => return Decision::Skip(SkipReason::UnknownStep(current)),
    };

    let step = &steps[index];
    let Some(next_step) = steps.get(index + 1) else {
        return Decision::Skip(SkipReason::NoNextStep(step.key.clone()));
    };
    if !step.enabled {
        return Decision::Skip(SkipReason::StepDisabled(step.key.clone()));
    }

    let is_first = lead.follow_up_sent.is_none() || step_number(&current) == Some(1);
    let reference = conversation.and_then(|c| {
        if is_first {
            c.last_received_at
        } else {
            c.last_sent_at
        }
    });
    let Some(reference) = reference else {
        return Decision::Skip(SkipReason::MissingReference {
            step: step.key.clone(),
        });
    };

    let elapsed_days = (now - reference).num_days();
    if elapsed_days < i64::from(step.delay_days) {
        return Decision::Skip(SkipReason::NotDue {
            elapsed_days,
            required_days: step.delay_days,
        });
    }

    let (position, total_steps) = family_position(steps, index);
    Decision::Fire(FireDecision {
        step: step.clone(),
        next_step: next_step.clone(),
        position,
        total_steps,
    })
}

/// Position and count of `steps[index]` within its own family. Keys outside
/// both families count against the whole list.
fn family_position(steps: &[FollowUpTemplateStep], index: usize) -> (usize, usize) {
    let key = &steps[index].key;
    let family = [StepFamily::NonWedding, StepFamily::Wedding]
        .into_iter()
        .find(|f| key.starts_with(f.prefix()));
    let Some(family) = family else {
        return (index + 1, steps.len());
    };
    let in_family = |s: &FollowUpTemplateStep| s.key.starts_with(family.prefix());
    let position = steps[..=index].iter().filter(|s| in_family(s)).count();
    let total = steps.iter().filter(|s| in_family(s)).count();
    (position, total)
}

/// Human-readable status recorded once `step_key` has been sent.
pub fn status_after(step_key: &str) -> LeadStatus {
    match step_number(step_key) {
        Some(n) => LeadStatus::FollowUp(n),
        None => LeadStatus::Other("Unknown".to_string()),
    }
}

/// Lead state after `fire.step` was delivered at `now`.
pub fn advance(lead: &Lead, fire: &FireDecision, now: DateTime<Utc>) -> Lead {
    let mut next = lead.clone();
    next.follow_up_sent = Some(fire.next_step.key.clone());
    next.status = status_after(&fire.step.key);
    next.scheduled_for = Some(now + Duration::days(i64::from(fire.next_step.delay_days)));
    next
}
