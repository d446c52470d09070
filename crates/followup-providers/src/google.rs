//! Google OAuth token endpoint and the Gmail REST API.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use followup_core::channel::{
    MailProvider, Mailbox, OutgoingEmail, SendMode, SentEmail, ThreadRef, TokenGrant,
};
use followup_core::tenant::Credential;
use followup_core::types::ProviderKind;

use crate::error::{check, check_grant, Result};
use crate::TokenResponse;

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
pub const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub token_url: String,
    pub revoke_url: String,
    pub gmail_base: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
            gmail_base: GMAIL_BASE.to_string(),
        }
    }
}

impl GoogleEndpoints {
    /// Every endpoint under one base URL, for mock servers.
    pub fn at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            token_url: format!("{base}/token"),
            revoke_url: format!("{base}/revoke"),
            gmail_base: format!("{base}/gmail/v1"),
        }
    }
}

pub struct GoogleProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    endpoints: GoogleEndpoints,
}

impl GoogleProvider {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        endpoints: GoogleEndpoints,
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
        let token: TokenResponse = check_grant("google", response).await?.json().await?;
        Ok(token.into_grant())
    }

    async fn stop_watch_and_revoke(&self, access_token: &str) -> Result<()> {
        let stop = self
            .http
            .post(format!("{}/users/me/stop", self.endpoints.gmail_base))
            .bearer_auth(access_token)
            .send()
            .await?;
        check("gmail", stop).await?;
        let revoke = self
            .http
            .post(&self.endpoints.revoke_url)
            .query(&[("token", access_token)])
            .send()
            .await?;
        check("google", revoke).await?;
        Ok(())
    }
}

#[async_trait]
impl MailProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn refresh(&self, refresh_token: &str) -> followup_core::Result<TokenGrant> {
        Ok(self.request_refresh(refresh_token).await?)
    }

    async fn revoke(&self, credential: &Credential) {
        match self.stop_watch_and_revoke(&credential.access_token).await {
            Ok(()) => tracing::info!("google watch stopped and token revoked"),
            Err(e) => tracing::warn!(error = %e, "google revoke failed"),
        }
    }

    fn connect(&self, access_token: &str) -> Arc<dyn Mailbox> {
        Arc::new(GmailMailbox {
            http: self.http.clone(),
            base: self.endpoints.gmail_base.clone(),
            access_token: access_token.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Gmail mailbox
// ---------------------------------------------------------------------------

pub struct GmailMailbox {
    http: reqwest::Client,
    base: String,
    access_token: String,
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
    thread_id: String,
}

#[derive(Deserialize)]
struct MessageMetadata {
    payload: Option<Payload>,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

impl GmailMailbox {
    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;
        Ok(check("gmail", response).await?.json().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        Ok(check("gmail", response).await?.json().await?)
    }

    async fn label_id(&self, name: &str) -> Result<String> {
        let list: LabelList = self.get_json("labels", &[]).await?;
        if let Some(label) = list.labels.into_iter().find(|l| l.name == name) {
            return Ok(label.id);
        }
        let created: Label = self
            .post_json(
                "labels",
                &json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                }),
            )
            .await?;
        Ok(created.id)
    }

    async fn apply_label(&self, message_id: &str, name: &str) -> Result<()> {
        let label_id = self.label_id(name).await?;
        let _: serde_json::Value = self
            .post_json(
                &format!("messages/{message_id}/modify"),
                &json!({ "addLabelIds": [label_id] }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn find_latest_thread(&self, lead_address: &str) -> followup_core::Result<Option<ThreadRef>> {
        let query = format!("from:{lead_address}");
        let list: MessageList = self
            .get_json("messages", &[("q", query.as_str()), ("maxResults", "1")])
            .await?;
        let Some(latest) = list.messages.into_iter().next() else {
            return Ok(None);
        };

        let details: MessageMetadata = self
            .get_json(
                &format!("messages/{}", latest.id),
                &[
                    ("format", "metadata"),
                    ("metadataHeaders", "Message-ID"),
                    ("metadataHeaders", "Subject"),
                ],
            )
            .await?;
        let headers = details.payload.map(|p| p.headers).unwrap_or_default();
        let header = |name: &str| {
            headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
        };
        // Without an RFC 822 id the reply cannot be threaded.
        let Some(message_id) = header("Message-ID").filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(ThreadRef {
            thread_id: latest.thread_id,
            message_id,
            subject: header("Subject").unwrap_or_default(),
        }))
    }

    async fn send(&self, email: OutgoingEmail) -> followup_core::Result<SentEmail> {
        let raw = URL_SAFE_NO_PAD.encode(build_mime(&email));
        let mut body = json!({ "raw": raw });
        if email.mode == SendMode::Reply {
            if let Some(thread_id) = &email.thread_id {
                body["threadId"] = json!(thread_id);
            }
        }
        let sent: SendResponse = self.post_json("messages/send", &body).await?;

        if let Some(label) = &email.label {
            if let Err(e) = self.apply_label(&sent.id, label).await {
                tracing::warn!(message_id = %sent.id, label = %label, error = %e, "failed to label sent message");
            }
        }
        Ok(SentEmail {
            message_id: Some(sent.id),
        })
    }
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

/// Single-part HTML message in RFC 822 form.
pub fn build_mime(email: &OutgoingEmail) -> String {
    let mut lines = vec![
        format!("To: {}", email.to),
        format!("Subject: {}", encode_header(&email.subject)),
        "MIME-Version: 1.0".to_string(),
        "Content-Type: text/html; charset=utf-8".to_string(),
        "Content-Transfer-Encoding: base64".to_string(),
    ];
    if email.mode == SendMode::Reply {
        if let Some(parent) = &email.in_reply_to {
            lines.push(format!("In-Reply-To: {parent}"));
            lines.push(format!("References: {parent}"));
        }
    }
    lines.push(String::new());
    lines.push(STANDARD.encode(email.html_body.as_bytes()));
    lines.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::Server) -> GoogleProvider {
        GoogleProvider::new(
            reqwest::Client::new(),
            "cid",
            "secret",
            GoogleEndpoints::at(&server.url()),
        )
    }

    fn email(mode: SendMode) -> OutgoingEmail {
        OutgoingEmail {
            mode,
            to: "jane@example.com".into(),
            subject: "Re: June wedding".into(),
            html_body: "<p>Hi</p>".into(),
            thread_id: Some("th-1".into()),
            in_reply_to: Some("<abc@mail>".into()),
            label: Some("Follow Up".into()),
        }
    }

    #[tokio::test]
    async fn refresh_posts_form_and_parses_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r-1".into()),
                Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a-2","expires_in":3599,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let grant = provider(&server).refresh("r-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(grant.access_token, "a-2");
        assert_eq!(grant.refresh_token, None);
        assert_eq!(grant.expires_in_seconds, 3599);
    }

    #[tokio::test]
    async fn invalid_grant_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let err = provider(&server).refresh("bad").await.unwrap_err();
        assert_eq!(err.kind(), followup_core::error::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn find_latest_thread_reads_headers() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::UrlEncoded("q".into(), "from:jane@example.com".into()))
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(r#"{"messages":[{"id":"m-1","threadId":"th-1"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/gmail/v1/users/me/messages/m-1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"payload":{"headers":[
                    {"name":"Subject","value":"June wedding"},
                    {"name":"Message-Id","value":"<abc@mail>"}]}}"#,
            )
            .create_async()
            .await;

        let mailbox = provider(&server).connect("tok");
        let thread = mailbox
            .find_latest_thread("jane@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.thread_id, "th-1");
        assert_eq!(thread.message_id, "<abc@mail>");
        assert_eq!(thread.subject, "June wedding");
    }

    #[tokio::test]
    async fn no_messages_means_no_thread() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"resultSizeEstimate":0}"#)
            .create_async()
            .await;
        let mailbox = provider(&server).connect("tok");
        assert!(mailbox
            .find_latest_thread("jane@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn send_reply_threads_and_labels() {
        let mut server = mockito::Server::new_async().await;
        let send = server
            .mock("POST", "/gmail/v1/users/me/messages/send")
            .match_body(Matcher::PartialJson(serde_json::json!({ "threadId": "th-1" })))
            .with_status(200)
            .with_body(r#"{"id":"sent-1","threadId":"th-1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/gmail/v1/users/me/labels")
            .with_status(200)
            .with_body(r#"{"labels":[{"id":"Label_7","name":"Follow Up"}]}"#)
            .create_async()
            .await;
        let modify = server
            .mock("POST", "/gmail/v1/users/me/messages/sent-1/modify")
            .match_body(Matcher::Json(serde_json::json!({ "addLabelIds": ["Label_7"] })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let mailbox = provider(&server).connect("tok");
        let sent = mailbox.send(email(SendMode::Reply)).await.unwrap();
        assert_eq!(sent.message_id.as_deref(), Some("sent-1"));
        send.assert_async().await;
        modify.assert_async().await;
    }

    #[tokio::test]
    async fn label_failure_does_not_fail_send() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/gmail/v1/users/me/messages/send")
            .with_status(200)
            .with_body(r#"{"id":"sent-2"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/gmail/v1/users/me/labels")
            .with_status(500)
            .create_async()
            .await;

        let mailbox = provider(&server).connect("tok");
        let sent = mailbox.send(email(SendMode::Send)).await.unwrap();
        assert_eq!(sent.message_id.as_deref(), Some("sent-2"));
    }

    #[test]
    fn mime_reply_carries_threading_headers() {
        let mime = build_mime(&email(SendMode::Reply));
        assert!(mime.contains("In-Reply-To: <abc@mail>\r\n"));
        assert!(mime.contains("References: <abc@mail>\r\n"));
        assert!(mime.contains("Subject: Re: June wedding\r\n"));

        let fresh = build_mime(&email(SendMode::Send));
        assert!(!fresh.contains("In-Reply-To"));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let mut e = email(SendMode::Send);
        e.subject = "Café tour".into();
        let mime = build_mime(&e);
        assert!(mime.contains("Subject: =?UTF-8?B?"));
    }
}
