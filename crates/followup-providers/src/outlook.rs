//! Microsoft identity platform tokens and the Graph mail API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use followup_core::channel::{
    MailProvider, Mailbox, OutgoingEmail, SendMode, SentEmail, ThreadRef, TokenGrant,
};
use followup_core::tenant::Credential;
use followup_core::types::ProviderKind;

use crate::error::{check, check_grant, Result};
use crate::TokenResponse;

pub const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
pub const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

const NO_SUBJECT: &str = "[No Subject]";

#[derive(Debug, Clone)]
pub struct OutlookEndpoints {
    pub token_url: String,
    pub graph_base: String,
}

impl Default for OutlookEndpoints {
    fn default() -> Self {
        Self {
            token_url: TOKEN_URL.to_string(),
            graph_base: GRAPH_BASE.to_string(),
        }
    }
}

impl OutlookEndpoints {
    pub fn at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            token_url: format!("{base}/token"),
            graph_base: format!("{base}/v1.0"),
        }
    }
}

pub struct OutlookProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    endpoints: OutlookEndpoints,
}

impl OutlookProvider {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        endpoints: OutlookEndpoints,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            endpoints,
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let token: TokenResponse = check_grant("microsoft", response).await?.json().await?;
        Ok(token.into_grant())
    }

    async fn delete_subscription(&self, subscription_id: &str, access_token: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!(
                "{}/subscriptions/{subscription_id}",
                self.endpoints.graph_base
            ))
            .bearer_auth(access_token)
            .send()
            .await?;
        check("graph", response).await?;
        Ok(())
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn refresh(&self, refresh_token: &str) -> followup_core::Result<TokenGrant> {
        Ok(self.request_refresh(refresh_token).await?)
    }

    // Microsoft has no refresh-token revocation endpoint for this grant;
    // dropping the push subscription is all that can be undone remotely.
    async fn revoke(&self, credential: &Credential) {
        let Some(subscription_id) = credential.subscription_id.as_deref() else {
            tracing::debug!("outlook credential has no subscription to delete");
            return;
        };
        match self
            .delete_subscription(subscription_id, &credential.access_token)
            .await
        {
            Ok(()) => tracing::info!(subscription_id, "outlook subscription deleted"),
            Err(e) => tracing::warn!(subscription_id, error = %e, "outlook revoke failed"),
        }
    }

    fn connect(&self, access_token: &str) -> Arc<dyn Mailbox> {
        Arc::new(OutlookMailbox {
            http: self.http.clone(),
            base: self.endpoints.graph_base.clone(),
            access_token: access_token.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Graph mailbox
// ---------------------------------------------------------------------------

pub struct OutlookMailbox {
    http: reqwest::Client,
    base: String,
    access_token: String,
}

#[derive(Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    sent_date_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Category {
    display_name: String,
}

impl OutlookMailbox {
    fn url(&self, path: &str) -> String {
        format!("{}/me/{path}", self.base)
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        check("graph", response).await
    }

    async fn ensure_category(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .get(self.url("outlook/masterCategories"))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let existing: Listing<Category> = check("graph", response).await?.json().await?;
        if existing.value.iter().any(|c| c.display_name == name) {
            return Ok(());
        }
        self.post(
            "outlook/masterCategories",
            &json!({ "displayName": name, "color": "preset0" }),
        )
        .await?;
        Ok(())
    }

    async fn last_sent_id(&self) -> Result<Option<String>> {
        let response = self
            .http
            .get(self.url("mailFolders/sentitems/messages"))
            .bearer_auth(&self.access_token)
            .query(&[
                ("$orderby", "sentDateTime desc"),
                ("$top", "1"),
                ("$select", "id"),
            ])
            .send()
            .await?;
        let listing: Listing<GraphMessage> = check("graph", response).await?.json().await?;
        Ok(listing.value.into_iter().next().map(|m| m.id))
    }

    async fn categorize_last_sent(&self, category: &str) -> Result<Option<String>> {
        self.ensure_category(category).await?;
        let Some(id) = self.last_sent_id().await? else {
            return Ok(None);
        };
        let response = self
            .http
            .patch(self.url(&format!("messages/{id}")))
            .bearer_auth(&self.access_token)
            .json(&json!({ "categories": [category] }))
            .send()
            .await?;
        check("graph", response).await?;
        Ok(Some(id))
    }
}

#[async_trait]
impl Mailbox for OutlookMailbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn find_latest_thread(
        &self,
        lead_address: &str,
    ) -> followup_core::Result<Option<ThreadRef>> {
        let search = format!("\"from:{lead_address}\"");
        let response = self
            .http
            .get(self.url("messages"))
            .bearer_auth(&self.access_token)
            .query(&[
                ("$search", search.as_str()),
                ("$top", "50"),
                ("$select", "id,conversationId,subject,from,sentDateTime"),
            ])
            .send()
            .await
            .map_err(crate::error::ProviderError::from)?;
        let listing: Listing<GraphMessage> = check("graph", response)
            .await?
            .json()
            .await
            .map_err(crate::error::ProviderError::from)?;

        // $search results cannot be combined with $orderby.
        let latest = listing
            .value
            .into_iter()
            .max_by_key(|m| m.sent_date_time.unwrap_or(DateTime::<Utc>::MIN_UTC));
        Ok(latest.map(|m| ThreadRef {
            thread_id: m.conversation_id.unwrap_or_default(),
            message_id: m.id,
            subject: m
                .subject
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| NO_SUBJECT.to_string()),
        }))
    }

    async fn send(&self, email: OutgoingEmail) -> followup_core::Result<SentEmail> {
        match (&email.mode, &email.in_reply_to) {
            (SendMode::Reply, Some(parent)) => {
                self.post(
                    &format!("messages/{parent}/reply"),
                    &json!({ "comment": email.html_body }),
                )
                .await?;
            }
            _ => {
                self.post(
                    "sendMail",
                    &json!({
                        "message": {
                            "subject": email.subject,
                            "body": { "contentType": "HTML", "content": email.html_body },
                            "toRecipients": [{ "emailAddress": { "address": email.to } }],
                        },
                        "saveToSentItems": true,
                    }),
                )
                .await?;
            }
        }

        // Both endpoints answer 202 without a body, so the sent item is
        // looked up afterwards.
        let mut message_id = None;
        if let Some(category) = &email.label {
            match self.categorize_last_sent(category).await {
                Ok(id) => message_id = id,
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "failed to categorize sent message")
                }
            }
        }
        Ok(SentEmail { message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::Server) -> OutlookProvider {
        OutlookProvider::new(
            reqwest::Client::new(),
            "cid",
            "secret",
            OutlookEndpoints::at(&server.url()),
        )
    }

    fn credential(subscription_id: Option<&str>) -> Credential {
        Credential {
            provider: ProviderKind::Outlook,
            access_token: "tok".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now(),
            subscription_id: subscription_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn refresh_returns_rotated_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"a","refresh_token":"r-2","expires_in":4000}"#)
            .create_async()
            .await;
        let grant = provider(&server).refresh("r-1").await.unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("r-2"));
        assert_eq!(grant.expires_in_seconds, 4000);
    }

    #[tokio::test]
    async fn unauthorized_refresh_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(401)
            .create_async()
            .await;
        let err = provider(&server).refresh("r-1").await.unwrap_err();
        assert_eq!(err.kind(), followup_core::error::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn revoke_deletes_subscription() {
        let mut server = mockito::Server::new_async().await;
        let delete = server
            .mock("DELETE", "/v1.0/subscriptions/sub-9")
            .match_header("authorization", "Bearer tok")
            .with_status(204)
            .create_async()
            .await;
        provider(&server).revoke(&credential(Some("sub-9"))).await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn revoke_without_subscription_makes_no_call() {
        let mut server = mockito::Server::new_async().await;
        let any = server
            .mock("DELETE", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        provider(&server).revoke(&credential(None)).await;
        any.assert_async().await;
    }

    #[tokio::test]
    async fn latest_thread_is_newest_by_sent_time() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1.0/me/messages")
            .match_query(Matcher::UrlEncoded(
                "$search".into(),
                "\"from:jane@example.com\"".into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"value":[
                    {"id":"old","conversationId":"c-1","subject":"First","sentDateTime":"2024-05-01T10:00:00Z"},
                    {"id":"new","conversationId":"c-1","subject":"","sentDateTime":"2024-05-03T10:00:00Z"}
                ]}"#,
            )
            .create_async()
            .await;
        let thread = provider(&server)
            .connect("tok")
            .find_latest_thread("jane@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.message_id, "new");
        assert_eq!(thread.thread_id, "c-1");
        assert_eq!(thread.subject, NO_SUBJECT);
    }

    #[tokio::test]
    async fn reply_posts_comment_and_categorizes() {
        let mut server = mockito::Server::new_async().await;
        let reply = server
            .mock("POST", "/v1.0/me/messages/msg-1/reply")
            .match_body(Matcher::PartialJson(json!({ "comment": "<p>Hi</p>" })))
            .with_status(202)
            .create_async()
            .await;
        server
            .mock("GET", "/v1.0/me/outlook/masterCategories")
            .with_status(200)
            .with_body(r#"{"value":[{"displayName":"Follow Up"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1.0/me/mailFolders/sentitems/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"value":[{"id":"sent-7"}]}"#)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/v1.0/me/messages/sent-7")
            .match_body(Matcher::Json(json!({ "categories": ["Follow Up"] })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let sent = provider(&server)
            .connect("tok")
            .send(OutgoingEmail {
                mode: SendMode::Reply,
                to: "jane@example.com".into(),
                subject: "Re: hi".into(),
                html_body: "<p>Hi</p>".into(),
                thread_id: Some("c-1".into()),
                in_reply_to: Some("msg-1".into()),
                label: Some("Follow Up".into()),
            })
            .await
            .unwrap();
        reply.assert_async().await;
        patch.assert_async().await;
        assert_eq!(sent.message_id.as_deref(), Some("sent-7"));
    }

    #[tokio::test]
    async fn new_message_uses_send_mail() {
        let mut server = mockito::Server::new_async().await;
        let send = server
            .mock("POST", "/v1.0/me/sendMail")
            .match_body(Matcher::PartialJson(json!({
                "message": { "subject": "Event Follow Up" },
                "saveToSentItems": true
            })))
            .with_status(202)
            .create_async()
            .await;
        let sent = provider(&server)
            .connect("tok")
            .send(OutgoingEmail {
                mode: SendMode::Send,
                to: "jane@example.com".into(),
                subject: "Event Follow Up".into(),
                html_body: "<p>Hi</p>".into(),
                thread_id: None,
                in_reply_to: None,
                label: None,
            })
            .await
            .unwrap();
        send.assert_async().await;
        assert_eq!(sent.message_id, None);
    }
}
