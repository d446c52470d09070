//! Message body selection: a step's static template when it has real text,
//! otherwise a generated draft.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::channel::{ContentGenerator, GenerationRequest};
use crate::error::{FollowupError, Result};
use crate::lead::Lead;
use crate::sequencer::FireDecision;
use crate::store::DocumentStore;
use crate::tenant::Tenant;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"))
}

/// Visible text of an HTML fragment, whitespace-trimmed.
pub fn strip_markup(html: &str) -> String {
    tag_re()
        .replace_all(html, "")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}

/// Tells the generator where in the sequence this message sits.
pub fn step_instruction(position: usize, total: usize) -> String {
    format!("There are {total} follow-ups in total. This is follow-up {position} of {total}.")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Template,
    Generated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContent {
    pub body: String,
    pub source: ContentSource,
}

pub struct ContentResolver {
    store: Arc<dyn DocumentStore>,
    generator: Arc<dyn ContentGenerator>,
}

impl ContentResolver {
    pub fn new(store: Arc<dyn DocumentStore>, generator: Arc<dyn ContentGenerator>) -> Self {
        Self { store, generator }
    }

    /// Body for the step in `fire`.
    ///
    /// Template content counts as present only if it has visible text; a
    /// template of bare `<p></p>` goes to the generator. An empty draft is
    /// `ContentUnavailable`.
    pub async fn resolve(
        &self,
        tenant: &Tenant,
        lead: &Lead,
        fire: &FireDecision,
    ) -> Result<ResolvedContent> {
        if !strip_markup(&fire.step.content).is_empty() {
            return Ok(ResolvedContent {
                body: fire.step.content.clone(),
                source: ContentSource::Template,
            });
        }

        let history = self.store.messages(&tenant.id, &lead.id)?;
        tracing::debug!(
            tenant_id = %tenant.id,
            lead_id = %lead.id,
            step = %fire.step.key,
            history = history.len(),
            "generating follow-up content"
        );
        let request = GenerationRequest {
            lead_name: lead.name.clone(),
            business_name: tenant.name.clone(),
            history,
            instruction: step_instruction(fire.position, fire.total_steps),
            knowledge_base: tenant.knowledge_base.render(&tenant.name, &tenant.id),
        };
        let body = self.generator.generate(request).await?;
        if body.trim().is_empty() {
            return Err(FollowupError::ContentUnavailable {
                lead_id: lead.id.clone(),
            });
        }
        Ok(ResolvedContent {
            body,
            source: ContentSource::Generated,
        })
    }
}
