//! Delivery of a resolved follow-up body over the step's channel.
//!
//! Email goes through the tenant's connected [`Mailbox`], threaded onto the
//! latest conversation with the lead when one exists. SMS goes through the
//! [`SmsTransport`] from the tenant's sender number and is mirrored into the
//! per-phone transcript.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::channel::{Mailbox, OutgoingEmail, SendMode, SmsMessage, SmsTransport};
use crate::conversation::TranscriptEntry;
use crate::error::{FollowupError, Result};
use crate::lead::Lead;
use crate::store::DocumentStore;
use crate::tenant::Tenant;
use crate::types::DeliveryMethod;

pub const DEFAULT_FALLBACK_SUBJECT: &str = "Event Follow Up";
pub const DEFAULT_LABEL: &str = "Follow Up";

/// Fixed parts of every outgoing email.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    /// Subject for a new thread, or a reply to a thread with no subject.
    pub fallback_subject: String,
    /// Gmail label / Outlook category on sent mail.
    pub label: String,
    /// Booking page for the postscript. `{tenant_id}` is substituted.
    pub booking_url: Option<String>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            fallback_subject: DEFAULT_FALLBACK_SUBJECT.to_string(),
            label: DEFAULT_LABEL.to_string(),
            booking_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub method: DeliveryMethod,
    pub message_id: Option<String>,
    /// Email only: sent as a reply on an existing thread.
    pub threaded: bool,
}

pub struct Dispatcher {
    store: Arc<dyn DocumentStore>,
    sms: Option<Arc<dyn SmsTransport>>,
    settings: DeliverySettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sms: Option<Arc<dyn SmsTransport>>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            sms,
            settings,
        }
    }

    pub async fn deliver(
        &self,
        tenant: &Tenant,
        lead: &Lead,
        method: DeliveryMethod,
        body: &str,
        mailbox: &dyn Mailbox,
        now: DateTime<Utc>,
    ) -> Result<DeliveryResult> {
        match method {
            DeliveryMethod::Email => self.send_email(tenant, lead, body, mailbox).await,
            DeliveryMethod::Sms => self.send_sms(tenant, lead, body, now).await,
        }
    }

    async fn send_email(
        &self,
        tenant: &Tenant,
        lead: &Lead,
        body: &str,
        mailbox: &dyn Mailbox,
    ) -> Result<DeliveryResult> {
        let to = lead
            .email
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                FollowupError::Configuration(format!("lead {} has no email address", lead.id))
            })?;

        let thread = mailbox.find_latest_thread(to).await?;
        let html_body = self.envelope(tenant, lead, body);
        let label = Some(self.settings.label.clone());
        let email = match thread {
            Some(thread) => OutgoingEmail {
                mode: SendMode::Reply,
                to: to.to_string(),
                subject: if thread.subject.trim().is_empty() {
                    self.settings.fallback_subject.clone()
                } else {
                    thread.subject
                },
                html_body,
                thread_id: Some(thread.thread_id),
                in_reply_to: Some(thread.message_id),
                label,
            },
            None => OutgoingEmail {
                mode: SendMode::Send,
                to: to.to_string(),
                subject: self.settings.fallback_subject.clone(),
                html_body,
                thread_id: None,
                in_reply_to: None,
                label,
            },
        };
        let threaded = email.mode == SendMode::Reply;

        let sent = mailbox.send(email).await?;
        tracing::info!(
            tenant_id = %tenant.id,
            lead_id = %lead.id,
            provider = %mailbox.provider(),
            threaded,
            "follow-up email sent"
        );
        Ok(DeliveryResult {
            method: DeliveryMethod::Email,
            message_id: sent.message_id,
            threaded,
        })
    }

    async fn send_sms(
        &self,
        tenant: &Tenant,
        lead: &Lead,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryResult> {
        let transport = self
            .sms
            .as_ref()
            .ok_or_else(|| FollowupError::Configuration("no SMS transport configured".into()))?;
        let to = lead
            .phone
            .as_deref()
            .and_then(normalize_phone)
            .ok_or_else(|| {
                FollowupError::Configuration(format!("lead {} has no usable phone number", lead.id))
            })?;
        let from = tenant.sms_number.clone().ok_or_else(|| {
            FollowupError::Configuration(format!("tenant {} has no SMS number", tenant.id))
        })?;

        let text = html_to_text(body);
        let receipt = transport
            .send(SmsMessage {
                to: to.clone(),
                from,
                body: text.clone(),
            })
            .await?;
        tracing::info!(
            tenant_id = %tenant.id,
            lead_id = %lead.id,
            sid = %receipt.message_sid,
            "follow-up sms sent"
        );

        let entry = TranscriptEntry {
            id: Uuid::new_v4().simple().to_string(),
            body: text,
            sender: "system".to_string(),
            at: now,
        };
        // The text is already out: a transcript failure must not fail delivery.
        if let Err(e) = self
            .store
            .append_transcript(&tenant.id, &to, &lead.name, entry)
        {
            tracing::warn!(
                tenant_id = %tenant.id,
                lead_id = %lead.id,
                error = %e,
                "failed to record sms transcript"
            );
        }

        Ok(DeliveryResult {
            method: DeliveryMethod::Sms,
            message_id: Some(receipt.message_sid),
            threaded: false,
        })
    }

    fn envelope(&self, tenant: &Tenant, lead: &Lead, body: &str) -> String {
        let mut html = String::from(
            "<div style=\"font-family: Arial, sans-serif; color: #000000; font-size: 13px; \
             line-height: 1.6; font-weight: 400;\">\n",
        );
        html.push_str(&format!("<p>Hi {},</p>\n", lead.first_name()));
        html.push_str(&format!("<p>{body}</p>\n"));
        html.push_str(&format!(
            "<p>{}</p>\n",
            tenant.signature.as_deref().unwrap_or_default()
        ));
        if let Some(url) = &self.settings.booking_url {
            let url = url.replace("{tenant_id}", &tenant.id);
            html.push_str(&format!(
                "<p>PS - If you'd like to see our venue in person, you can schedule a tour by \
                 <a href=\"{url}\">clicking here</a> at your convenience.</p>\n"
            ));
        }
        html.push_str("</div>\n");
        html
    }
}

// ---------------------------------------------------------------------------
// SMS formatting
// ---------------------------------------------------------------------------

struct SmsPatterns {
    open_p: Regex,
    breaks: Regex,
    tags: Regex,
}

fn sms_patterns() -> &'static SmsPatterns {
    static RE: OnceLock<SmsPatterns> = OnceLock::new();
    RE.get_or_init(|| SmsPatterns {
        open_p: Regex::new(r"(?i)<p(\s[^>]*)?>").expect("static regex"),
        breaks: Regex::new(r"(?i)</p>|<br\s*/?>").expect("static regex"),
        tags: Regex::new(r"<[^>]+>").expect("static regex"),
    })
}

/// Plain-text rendering for SMS: paragraph ends and `<br>` become newlines,
/// every other tag is dropped.
pub fn html_to_text(html: &str) -> String {
    let p = sms_patterns();
    let text = p.open_p.replace_all(html, "");
    let text = p.breaks.replace_all(&text, "\n");
    let text = p.tags.replace_all(&text, "");
    text.trim().to_string()
}

/// E.164 form of a phone number. Ten digits get the `1` country code.
/// Returns `None` when no digits are present.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.len() == 10 {
        return Some(format!("+1{digits}"));
    }
    Some(format!("+{digits}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ThreadRef;
    use crate::store::RedbStore;
    use crate::testing::{BrokenTranscripts, FakeMailbox, FakeSms};
    use tempfile::TempDir;

    fn dispatcher_on(store: Arc<dyn DocumentStore>, sms: Option<Arc<FakeSms>>) -> Dispatcher {
        Dispatcher::new(
            store,
            sms.map(|s| s as Arc<dyn SmsTransport>),
            DeliverySettings {
                booking_url: Some("https://book.example.com/{tenant_id}".into()),
                ..DeliverySettings::default()
            },
        )
    }

    fn fixture(sms: Option<Arc<FakeSms>>) -> (TempDir, Arc<RedbStore>, Dispatcher) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("state.redb")).unwrap());
        let dispatcher = dispatcher_on(store.clone(), sms);
        (dir, store, dispatcher)
    }

    fn tenant() -> Tenant {
        let mut t = Tenant::new("t1", "Rose Hall", "events@rosehall.test");
        t.signature = Some("Ana, Rose Hall".into());
        t.sms_number = Some("+15550009999".into());
        t
    }

    fn lead() -> Lead {
        let mut l = Lead::new("l1", "t1");
        l.name = "jane doe".into();
        l.email = Some("jane@example.com".into());
        l.phone = Some("(555) 123-4567".into());
        l
    }

    #[tokio::test]
    async fn email_without_thread_starts_new_message() {
        let (_dir, _store, dispatcher) = fixture(None);
        let mailbox = FakeMailbox::default();

        let result = dispatcher
            .deliver(&tenant(), &lead(), DeliveryMethod::Email, "Checking in.", &mailbox, Utc::now())
            .await
            .unwrap();
        assert!(!result.threaded);

        let sent = mailbox.sent();
        assert_eq!(sent.len(), 1);
        let email = &sent[0];
        assert_eq!(email.mode, SendMode::Send);
        assert_eq!(email.subject, "Event Follow Up");
        assert_eq!(email.label.as_deref(), Some("Follow Up"));
        assert!(email.thread_id.is_none());
        assert!(email.html_body.contains("<p>Hi Jane,</p>"));
        assert!(email.html_body.contains("<p>Checking in.</p>"));
        assert!(email.html_body.contains("Ana, Rose Hall"));
        assert!(email.html_body.contains("https://book.example.com/t1"));
    }

    #[tokio::test]
    async fn email_with_thread_replies_and_keeps_subject() {
        let (_dir, _store, dispatcher) = fixture(None);
        let mailbox = FakeMailbox::default();
        *mailbox.thread.lock().unwrap() = Some(ThreadRef {
            thread_id: "th-1".into(),
            message_id: "<abc@mail>".into(),
            subject: "Re: June wedding".into(),
        });

        let result = dispatcher
            .deliver(&tenant(), &lead(), DeliveryMethod::Email, "Hi again", &mailbox, Utc::now())
            .await
            .unwrap();
        assert!(result.threaded);
        let email = &mailbox.sent()[0];
        assert_eq!(email.mode, SendMode::Reply);
        assert_eq!(email.subject, "Re: June wedding");
        assert_eq!(email.thread_id.as_deref(), Some("th-1"));
        assert_eq!(email.in_reply_to.as_deref(), Some("<abc@mail>"));
    }

    #[tokio::test]
    async fn reply_to_thread_without_subject_uses_fallback() {
        let (_dir, _store, dispatcher) = fixture(None);
        let mailbox = FakeMailbox::default();
        *mailbox.thread.lock().unwrap() = Some(ThreadRef {
            thread_id: "th-1".into(),
            message_id: "m-1".into(),
            subject: "  ".into(),
        });
        dispatcher
            .deliver(&tenant(), &lead(), DeliveryMethod::Email, "x", &mailbox, Utc::now())
            .await
            .unwrap();
        assert_eq!(mailbox.sent()[0].subject, "Event Follow Up");
    }

    #[tokio::test]
    async fn email_to_lead_without_address_is_configuration_error() {
        let (_dir, _store, dispatcher) = fixture(None);
        let mailbox = FakeMailbox::default();
        let mut l = lead();
        l.email = None;
        let err = dispatcher
            .deliver(&tenant(), &l, DeliveryMethod::Email, "x", &mailbox, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FollowupError::Configuration(_)));
        assert!(mailbox.sent().is_empty());
    }

    #[tokio::test]
    async fn sms_is_plain_text_and_recorded_in_transcript() {
        let sms = Arc::new(FakeSms::default());
        let (_dir, store, dispatcher) = fixture(Some(sms.clone()));
        let mailbox = FakeMailbox::default();

        let result = dispatcher
            .deliver(
                &tenant(),
                &lead(),
                DeliveryMethod::Sms,
                "<p>Hello there</p><p>Tours on <b>Friday</b><br>Reply YES</p>",
                &mailbox,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(result.message_id.as_deref(), Some("SM123"));
        assert!(mailbox.sent().is_empty());

        let sent = sms.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+15551234567");
        assert_eq!(sent[0].from, "+15550009999");
        assert_eq!(sent[0].body, "Hello there\nTours on Friday\nReply YES");

        let transcript = store.transcript("t1", "+15551234567").unwrap().unwrap();
        assert_eq!(transcript.client_name, "jane doe");
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(transcript.messages[0].sender, "system");
    }

    #[tokio::test]
    async fn sms_sent_despite_transcript_failure_is_delivered() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("state.redb")).unwrap());
        let sms = Arc::new(FakeSms::default());
        let dispatcher = dispatcher_on(Arc::new(BrokenTranscripts(store.clone())), Some(sms.clone()));

        let result = dispatcher
            .deliver(&tenant(), &lead(), DeliveryMethod::Sms, "<p>Hi</p>", &FakeMailbox::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.method, DeliveryMethod::Sms);
        assert_eq!(result.message_id.as_deref(), Some("SM123"));
        assert_eq!(sms.sent.lock().unwrap().len(), 1);
        assert!(store.transcript("t1", "+15551234567").unwrap().is_none());
    }

    #[tokio::test]
    async fn sms_without_transport_is_configuration_error() {
        let (_dir, _store, dispatcher) = fixture(None);
        let err = dispatcher
            .deliver(&tenant(), &lead(), DeliveryMethod::Sms, "x", &FakeMailbox::default(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FollowupError::Configuration(_)));
    }

    #[test]
    fn normalize_phone_handles_common_shapes() {
        assert_eq!(normalize_phone("8482194885").as_deref(), Some("+18482194885"));
        assert_eq!(normalize_phone("+1 (848) 219-4885").as_deref(), Some("+18482194885"));
        assert_eq!(normalize_phone("18482194885").as_deref(), Some("+18482194885"));
        assert_eq!(normalize_phone("+44 20 7946 0958").as_deref(), Some("+442079460958"));
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn html_to_text_handles_attributes_and_self_closing_breaks() {
        assert_eq!(
            html_to_text("<p class=\"x\">One<br/>Two</p>"),
            "One\nTwo"
        );
    }
}
