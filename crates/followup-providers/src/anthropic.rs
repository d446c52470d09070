//! Follow-up drafting through the Anthropic Messages API.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use followup_core::channel::{ContentGenerator, GenerationRequest};
use followup_core::conversation::Direction;

use crate::error::{check, ProviderError, Result};

pub const API_BASE: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You write short, friendly follow-up messages for an events venue \
to a lead who has gone quiet. Do not add a greeting or the client's name; the message is \
wrapped with both. Wrap each line in <p> tags. Never end with a postscript. \
Only answer from the provided knowledge base data, you do not have access to any other \
data or information.";

#[derive(Debug, Clone)]
pub struct AnthropicSettings {
    pub model: String,
    pub max_tokens: u32,
}

pub struct AnthropicGenerator {
    http: reqwest::Client,
    base: String,
    api_key: String,
    settings: AnthropicSettings,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    messages: Vec<Turn>,
}

#[derive(Serialize)]
struct Turn {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl AnthropicGenerator {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, settings: AnthropicSettings) -> Self {
        Self::with_base(http, API_BASE, api_key, settings)
    }

    pub fn with_base(
        http: reqwest::Client,
        base: &str,
        api_key: impl Into<String>,
        settings: AnthropicSettings,
    ) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            settings,
        }
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        let body = MessagesRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            system: format!("{SYSTEM_PROMPT}\n\n{}", request.knowledge_base),
            messages: vec![Turn {
                role: "user",
                content: user_prompt(request),
            }],
        };
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let parsed: MessagesResponse = check("anthropic", response).await?.json().await?;
        if parsed.content.is_empty() {
            return Err(ProviderError::InvalidResponse {
                service: "anthropic",
                reason: "no content blocks".into(),
            });
        }
        let text = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(tidy(&text))
    }
}

#[async_trait]
impl ContentGenerator for AnthropicGenerator {
    async fn generate(&self, request: GenerationRequest) -> followup_core::Result<String> {
        Ok(self.complete(&request).await?)
    }
}

fn user_prompt(request: &GenerationRequest) -> String {
    let mut history = String::new();
    for message in &request.history {
        let who = match message.direction {
            Direction::Outbound => request.business_name.as_str(),
            Direction::Inbound => request.lead_name.as_str(),
        };
        history.push_str(&format!(
            "<message from=\"{who}\" at=\"{}\">{}</message>\n",
            message.at.to_rfc3339(),
            message.body
        ));
    }
    format!(
        "This is a follow-up message for {lead}, who has not replied to {business}. \
         Based on the conversation history, write the next follow-up.\n\
         {instruction}\n\
         The history is newest first.\n\
         <pastMessages>\n{history}</pastMessages>",
        lead = request.lead_name,
        business = request.business_name,
        instruction = request.instruction,
    )
}

fn postscript_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:<p>\s*)?P\.?\s?S\.?\b.*$").expect("static regex")
    })
}

fn scratchpad_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<scheduling_process>.*?</scheduling_process>").expect("static regex")
    })
}

/// Drop postscript lines and scratchpad blocks, and close a dangling
/// paragraph.
pub fn tidy(text: &str) -> String {
    let without_scratch = scratchpad_re().replace_all(text, "");
    let cleaned = postscript_re().replace_all(&without_scratch, "");
    let mut out = cleaned.trim().to_string();
    if !out.is_empty() && out.contains("<p>") && !out.ends_with("</p>") {
        out.push_str("</p>");
    }
    out
}
