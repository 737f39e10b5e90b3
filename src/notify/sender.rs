//! Channel sender trait and the kind → sender registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::NotifyError;
use crate::mail::reference_now;
use crate::notify::model::{Channel, ChannelKind};

/// Default HTTP timeout for provider APIs.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one send attempt, as recorded on the notification log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
        }
    }
}

impl From<Result<String, NotifyError>> for SendOutcome {
    fn from(result: Result<String, NotifyError>) -> Self {
        match result {
            Ok(response) => Self::ok(response),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// A delivery mechanism for one channel kind.
///
/// `config` is the channel's raw JSON configuration. `send` returns the
/// provider response on success.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Check a configuration without contacting the provider.
    fn validate(&self, config: &str) -> Result<(), NotifyError>;

    async fn send(&self, config: &str, subject: &str, content: &str)
    -> Result<String, NotifyError>;

    /// Validate, then deliver a fixed connectivity message through `send`.
    async fn test(&self, config: &str) -> Result<String, NotifyError> {
        self.validate(config)?;
        let (subject, content) = test_message(self.kind());
        self.send(config, &subject, &content).await
    }
}

/// Subject and body of the connectivity test message.
pub fn test_message(kind: ChannelKind) -> (String, String) {
    let subject = format!("{} connectivity test", kind.as_str());
    let content = format!(
        "This is a connectivity test message from the mail alert service.\nSent at: {}\nIf you received it, the channel is configured correctly.",
        reference_now().format("%Y-%m-%d %H:%M:%S")
    );
    (subject, content)
}

/// Parse a channel's JSON configuration into its typed form.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    kind: ChannelKind,
    config: &str,
) -> Result<T, NotifyError> {
    serde_json::from_str(config).map_err(|e| NotifyError::InvalidConfig {
        kind: kind.as_str().to_string(),
        reason: format!("malformed config: {e}"),
    })
}

pub(crate) fn invalid(kind: ChannelKind, reason: impl Into<String>) -> NotifyError {
    NotifyError::InvalidConfig {
        kind: kind.as_str().to_string(),
        reason: reason.into(),
    }
}

/// Shared reqwest client for provider APIs.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client, using defaults: {e}");
            reqwest::Client::new()
        })
}

/// The `errcode`/`errmsg` envelope shared by the WeChat and DingTalk APIs.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ApiReply {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub access_token: String,
}

/// Send a request and require `errcode == 0` in the reply.
///
/// Returns the raw body together with the decoded envelope.
pub(crate) async fn call_api(
    request: reqwest::RequestBuilder,
    provider: &str,
) -> Result<(String, ApiReply), NotifyError> {
    let resp = request
        .send()
        .await
        .map_err(|e| NotifyError::Http(format!("{provider} request failed: {e}")))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| NotifyError::Http(format!("{provider} response unreadable: {e}")))?;

    let reply: ApiReply = serde_json::from_str(&body).map_err(|e| {
        NotifyError::Http(format!("{provider} returned HTTP {status} with invalid body: {e}"))
    })?;
    if reply.errcode != 0 {
        return Err(NotifyError::Api {
            provider: provider.to_string(),
            code: reply.errcode,
            message: reply.errmsg,
        });
    }
    Ok((body, reply))
}

/// Registry of senders keyed by channel kind.
#[derive(Default)]
pub struct SenderRegistry {
    senders: HashMap<ChannelKind, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sender for every kind.
    pub fn with_defaults() -> Self {
        use crate::notify::{dingtalk, email, webhook, wechat};

        let client = http_client();
        let mut registry = Self::new();
        registry.register(Arc::new(email::EmailSender::new()));
        registry.register(Arc::new(webhook::WebhookSender::new(client.clone())));
        registry.register(Arc::new(wechat::WechatRobotSender::new(client.clone())));
        registry.register(Arc::new(wechat::WechatAppSender::new(client.clone())));
        registry.register(Arc::new(dingtalk::DingtalkRobotSender::new(client.clone())));
        registry.register(Arc::new(dingtalk::DingtalkWorkSender::new(client)));
        registry
    }

    /// Register a sender, replacing any previous one for the same kind.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        let kind = sender.kind();
        if self.senders.insert(kind, sender).is_some() {
            tracing::debug!(kind = kind.as_str(), "Replaced channel sender");
        }
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&kind).cloned()
    }

    fn sender_for(&self, kind: ChannelKind) -> Result<Arc<dyn ChannelSender>, NotifyError> {
        self.get(kind)
            .ok_or_else(|| invalid(kind, "no sender registered for this kind"))
    }

    pub fn validate(&self, channel: &Channel) -> Result<(), NotifyError> {
        self.sender_for(channel.kind)?.validate(&channel.config)
    }

    /// Send through the channel's sender. Inactive channels are refused.
    pub async fn send(
        &self,
        channel: &Channel,
        subject: &str,
        content: &str,
    ) -> Result<String, NotifyError> {
        if !channel.is_active() {
            return Err(NotifyError::Inactive(channel.name.clone()));
        }
        self.sender_for(channel.kind)?
            .send(&channel.config, subject, content)
            .await
    }

    pub async fn test(&self, channel: &Channel) -> Result<String, NotifyError> {
        self.sender_for(channel.kind)?.test(&channel.config).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::notify::model::ChannelStatus;

    struct Recording {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelSender for Recording {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Webhook
        }

        fn validate(&self, config: &str) -> Result<(), NotifyError> {
            if config.is_empty() {
                return Err(invalid(self.kind(), "empty"));
            }
            Ok(())
        }

        async fn send(
            &self,
            _config: &str,
            subject: &str,
            content: &str,
        ) -> Result<String, NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), content.to_string()));
            Ok("ok".into())
        }
    }

    fn channel(status: ChannelStatus, config: &str) -> Channel {
        Channel {
            id: 1,
            name: "hook".into(),
            kind: ChannelKind::Webhook,
            config: config.into(),
            status,
            template_id: None,
        }
    }

    #[tokio::test]
    async fn inactive_channel_is_refused() {
        let sender = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
        });
        let mut registry = SenderRegistry::new();
        registry.register(sender.clone());

        let err = registry
            .send(&channel(ChannelStatus::Inactive, "{}"), "s", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Inactive(_)));
        assert!(sender.sent.lock().unwrap().is_empty());

        registry
            .send(&channel(ChannelStatus::Active, "{}"), "s", "c")
            .await
            .unwrap();
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validates_before_sending() {
        let sender = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
        });
        let mut registry = SenderRegistry::new();
        registry.register(sender.clone());

        assert!(registry.test(&channel(ChannelStatus::Active, "")).await.is_err());
        assert!(sender.sent.lock().unwrap().is_empty());

        registry.test(&channel(ChannelStatus::Active, "{}")).await.unwrap();
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].0, "webhook connectivity test");
        assert!(sent[0].1.contains("connectivity test message"));
    }

    #[test]
    fn missing_sender_is_config_error() {
        let registry = SenderRegistry::new();
        let err = registry
            .validate(&channel(ChannelStatus::Active, "{}"))
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidConfig { .. }));
    }

    #[test]
    fn defaults_cover_every_kind() {
        let registry = SenderRegistry::with_defaults();
        for kind in ChannelKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn outcome_from_result() {
        let ok: SendOutcome = Ok::<_, NotifyError>("sent".to_string()).into();
        assert!(ok.success);
        let failed: SendOutcome = Err::<String, _>(NotifyError::Http("timeout".into())).into();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("HTTP error: timeout"));
    }
}
