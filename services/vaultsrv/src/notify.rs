//! Notification gateway - outbound email/SMS fan-out
//!
//! Channels are external HTTP providers with unbounded latency and
//! independent failure. Every send happens after the state transition that
//! triggered it has committed; a failed channel is captured as a
//! `NotificationFailure` and logged, never propagated into the caller's
//! error path and never retried inline.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NotifierConfig;
use crate::domain::ProtectedMessage;
use crate::error::{Result, VaultError};

/// Delivery channel identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Sms => write!(f, "sms"),
        }
    }
}

/// One outbound channel: fire a templated message at a recipient address
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn send(&self, recipient: &str, template: &str, params: &Value) -> anyhow::Result<()>;
}

/// A send that failed on one channel; attached to operation results for
/// operational visibility
#[derive(Debug, Clone, Serialize)]
pub struct NotificationFailure {
    pub channel: ChannelKind,
    pub recipient: String,
    pub template: String,
    pub error: String,
}

/// HTTP provider channel: POSTs `{to, template, params}` to a configured
/// endpoint with a bounded timeout
pub struct HttpChannel {
    kind: ChannelKind,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpChannel {
    pub fn new(kind: ChannelKind, endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("notifier http client: {}", e)))?;

        Ok(Self {
            kind,
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl NotificationChannel for HttpChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, recipient: &str, template: &str, params: &Value) -> anyhow::Result<()> {
        let body = json!({
            "to": recipient,
            "template": template,
            "params": params,
        });

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("provider returned {}", response.status());
        }

        debug!("{} notification sent to {} ({})", self.kind, recipient, template);
        Ok(())
    }
}

/// Fans one logical notification out to the available channels. Channels
/// fail independently: an email error never suppresses the SMS attempt.
#[derive(Clone, Default)]
pub struct NotificationGateway {
    email: Option<Arc<dyn NotificationChannel>>,
    sms: Option<Arc<dyn NotificationChannel>>,
}

impl NotificationGateway {
    pub fn new(
        email: Option<Arc<dyn NotificationChannel>>,
        sms: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self { email, sms }
    }

    /// Build provider channels from service configuration
    pub fn from_config(config: &NotifierConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let email = config
            .email_endpoint
            .as_deref()
            .map(|endpoint| HttpChannel::new(ChannelKind::Email, endpoint, timeout))
            .transpose()?
            .map(|c| Arc::new(c) as Arc<dyn NotificationChannel>);

        let sms = config
            .sms_endpoint
            .as_deref()
            .map(|endpoint| HttpChannel::new(ChannelKind::Sms, endpoint, timeout))
            .transpose()?
            .map(|c| Arc::new(c) as Arc<dyn NotificationChannel>);

        Ok(Self::new(email, sms))
    }

    /// Reminder to the author, on whichever owner contacts exist
    pub async fn notify_owner(
        &self,
        msg: &ProtectedMessage,
        template: &str,
        params: &Value,
    ) -> Vec<NotificationFailure> {
        let mut failures = Vec::new();
        self.dispatch(&self.email, msg.owner_email.as_deref(), template, params, &mut failures)
            .await;
        self.dispatch(&self.sms, msg.owner_phone.as_deref(), template, params, &mut failures)
            .await;
        failures
    }

    /// Notice to the intended reader, on every available channel
    /// independently
    pub async fn notify_recipient(
        &self,
        msg: &ProtectedMessage,
        template: &str,
        params: &Value,
    ) -> Vec<NotificationFailure> {
        let mut failures = Vec::new();
        self.dispatch(
            &self.email,
            msg.recipient_email.as_deref(),
            template,
            params,
            &mut failures,
        )
        .await;
        self.dispatch(
            &self.sms,
            msg.recipient_phone.as_deref(),
            template,
            params,
            &mut failures,
        )
        .await;
        failures
    }

    /// Direct SMS to one phone (fast-lane code delivery)
    pub async fn send_sms(
        &self,
        phone: &str,
        template: &str,
        params: &Value,
    ) -> Vec<NotificationFailure> {
        let mut failures = Vec::new();
        self.dispatch(&self.sms, Some(phone), template, params, &mut failures)
            .await;
        failures
    }

    async fn dispatch(
        &self,
        channel: &Option<Arc<dyn NotificationChannel>>,
        recipient: Option<&str>,
        template: &str,
        params: &Value,
        failures: &mut Vec<NotificationFailure>,
    ) {
        // Absent channel or absent address is simply skipped
        let (Some(channel), Some(recipient)) = (channel, recipient) else {
            return;
        };

        if let Err(e) = channel.send(recipient, template, params).await {
            warn!(
                "{} notification to {} failed ({}): {}",
                channel.kind(),
                recipient,
                template,
                e
            );
            failures.push(NotificationFailure {
                channel: channel.kind(),
                recipient: recipient.to_string(),
                template: template.to_string(),
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingChannel;

    fn message_with_contacts() -> ProtectedMessage {
        let mut msg = ProtectedMessage::new("owner-1", "sealed");
        msg.owner_email = Some("owner@example.com".to_string());
        msg.recipient_email = Some("reader@example.com".to_string());
        msg.recipient_phone = Some("+15550001".to_string());
        msg
    }

    #[tokio::test]
    async fn test_recipient_fanout_hits_both_channels() {
        let email = Arc::new(RecordingChannel::new(ChannelKind::Email));
        let sms = Arc::new(RecordingChannel::new(ChannelKind::Sms));
        let gateway = NotificationGateway::new(Some(email.clone()), Some(sms.clone()));

        let failures = gateway
            .notify_recipient(&message_with_contacts(), "disclosure", &json!({}))
            .await;

        assert!(failures.is_empty());
        assert_eq!(email.sent().len(), 1);
        assert_eq!(sms.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_email_failure_does_not_suppress_sms() {
        let email = Arc::new(RecordingChannel::new(ChannelKind::Email));
        email.fail_next_sends();
        let sms = Arc::new(RecordingChannel::new(ChannelKind::Sms));
        let gateway = NotificationGateway::new(Some(email.clone()), Some(sms.clone()));

        let failures = gateway
            .notify_recipient(&message_with_contacts(), "disclosure", &json!({}))
            .await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].channel, ChannelKind::Email);
        assert_eq!(sms.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_absent_contact_is_skipped() {
        let email = Arc::new(RecordingChannel::new(ChannelKind::Email));
        let gateway = NotificationGateway::new(Some(email.clone()), None);

        let mut msg = message_with_contacts();
        msg.recipient_email = None;

        let failures = gateway.notify_recipient(&msg, "disclosure", &json!({})).await;
        assert!(failures.is_empty());
        assert!(email.sent().is_empty());
    }
}
