//! HTTP clients for the collaborators behind the follow-up engine's traits:
//! Google and Microsoft mailboxes, Twilio SMS, and the Anthropic generator.

pub mod anthropic;
pub mod error;
pub mod google;
pub mod outlook;
pub mod twilio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use followup_core::channel::{
    ContentGenerator, GenerationRequest, MailProviders, SmsTransport, TokenGrant,
};
use followup_core::config::GenerationConfig;
use followup_core::FollowupError;

pub use error::ProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Token endpoint response shared by Google and Microsoft.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    pub(crate) fn into_grant(self) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_in_seconds: self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        }
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Provider credentials. Never read from the config file.
#[derive(Clone, Default)]
pub struct Secrets {
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub outlook_client_id: Option<String>,
    pub outlook_client_secret: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("google", &set(&self.google_client_secret))
            .field("outlook", &set(&self.outlook_client_secret))
            .field("twilio", &set(&self.twilio_auth_token))
            .field("anthropic", &set(&self.anthropic_api_key))
            .finish()
    }
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            google_client_id: get("GOOGLE_CLIENT_ID"),
            google_client_secret: get("GOOGLE_CLIENT_SECRET"),
            outlook_client_id: get("OUTLOOK_CLIENT_ID"),
            outlook_client_secret: get("OUTLOOK_CLIENT_SECRET"),
            twilio_account_sid: get("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: get("TWILIO_AUTH_TOKEN"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
        }
    }
}

fn pair(a: &Option<String>, b: &Option<String>) -> Option<(String, String)> {
    Some((a.clone()?, b.clone()?))
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn http_client() -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?)
}

/// Register every mail provider whose client credentials are present.
pub fn mail_providers(http: &reqwest::Client, secrets: &Secrets) -> MailProviders {
    let mut providers = MailProviders::new();
    match pair(&secrets.google_client_id, &secrets.google_client_secret) {
        Some((id, secret)) => providers.register(Arc::new(google::GoogleProvider::new(
            http.clone(),
            id,
            secret,
            google::GoogleEndpoints::default(),
        ))),
        None => tracing::warn!("GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET not set; gmail tenants will fail"),
    }
    match pair(&secrets.outlook_client_id, &secrets.outlook_client_secret) {
        Some((id, secret)) => providers.register(Arc::new(outlook::OutlookProvider::new(
            http.clone(),
            id,
            secret,
            outlook::OutlookEndpoints::default(),
        ))),
        None => tracing::warn!("OUTLOOK_CLIENT_ID/OUTLOOK_CLIENT_SECRET not set; outlook tenants will fail"),
    }
    providers
}

pub fn sms_transport(http: &reqwest::Client, secrets: &Secrets) -> Option<Arc<dyn SmsTransport>> {
    let (sid, token) = pair(&secrets.twilio_account_sid, &secrets.twilio_auth_token)?;
    Some(Arc::new(twilio::TwilioSms::new(http.clone(), sid, token)))
}

pub fn content_generator(
    http: &reqwest::Client,
    secrets: &Secrets,
    config: &GenerationConfig,
) -> Arc<dyn ContentGenerator> {
    match &secrets.anthropic_api_key {
        Some(key) => Arc::new(anthropic::AnthropicGenerator::new(
            http.clone(),
            key.clone(),
            anthropic::AnthropicSettings {
                model: config.model.clone(),
                max_tokens: config.max_tokens,
            },
        )),
        None => {
            tracing::warn!("ANTHROPIC_API_KEY not set; steps without template content will fail");
            Arc::new(MissingGenerator)
        }
    }
}

/// Stands in when no API key is configured.
struct MissingGenerator;

#[async_trait]
impl ContentGenerator for MissingGenerator {
    async fn generate(&self, _request: GenerationRequest) -> followup_core::Result<String> {
        Err(FollowupError::Configuration(
            "content generation requested but ANTHROPIC_API_KEY is not set".into(),
        ))
    }
}
