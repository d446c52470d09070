//! Twilio Programmable Messaging.

use async_trait::async_trait;
use serde::Deserialize;

use followup_core::channel::{SmsMessage, SmsReceipt, SmsTransport};

use crate::error::{check, Result};

pub const API_BASE: &str = "https://api.twilio.com";

pub struct TwilioSms {
    http: reqwest::Client,
    base: String,
    account_sid: String,
    auth_token: String,
}

#[derive(Deserialize)]
struct MessageResource {
    sid: String,
}

impl TwilioSms {
    pub fn new(
        http: reqwest::Client,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self::with_base(http, API_BASE, account_sid, auth_token)
    }

    pub fn with_base(
        http: reqwest::Client,
        base: &str,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
        }
    }

    async fn create_message(&self, message: &SmsMessage) -> Result<String> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base, self.account_sid
        );
        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", message.to.as_str()),
                ("From", message.from.as_str()),
                ("Body", message.body.as_str()),
            ])
            .send()
            .await?;
        let created: MessageResource = check("twilio", response).await?.json().await?;
        Ok(created.sid)
    }
}

#[async_trait]
impl SmsTransport for TwilioSms {
    async fn send(&self, message: SmsMessage) -> followup_core::Result<SmsReceipt> {
        let message_sid = self.create_message(&message).await?;
        tracing::debug!(sid = %message_sid, to = %message.to, "sms queued with twilio");
        Ok(SmsReceipt { message_sid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn message() -> SmsMessage {
        SmsMessage {
            to: "+15551234567".into(),
            from: "+15550000000".into(),
            body: "Hi Jane".into(),
        }
    }

    #[tokio::test]
    async fn send_posts_form_with_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2010-04-01/Accounts/AC1/Messages.json")
            // "AC1:secret"
            .match_header("authorization", "Basic QUMxOnNlY3JldA==")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("To".into(), "+15551234567".into()),
                Matcher::UrlEncoded("Body".into(), "Hi Jane".into()),
            ]))
            .with_status(201)
            .with_body(r#"{"sid":"SM42","status":"queued"}"#)
            .create_async()
            .await;

        let sms = TwilioSms::with_base(reqwest::Client::new(), &server.url(), "AC1", "secret");
        let receipt = sms.send(message()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(receipt.message_sid, "SM42");
    }

    #[tokio::test]
    async fn rejected_number_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":21211,"message":"Invalid 'To' Phone Number"}"#)
            .create_async()
            .await;

        let sms = TwilioSms::with_base(reqwest::Client::new(), &server.url(), "AC1", "secret");
        let err = sms.send(message()).await.unwrap_err();
        assert_eq!(err.kind(), followup_core::error::ErrorKind::Transient);
        assert!(err.to_string().contains("21211"));
    }
}
