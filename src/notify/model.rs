//! Notification channels, templates and delivery logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NotifyError;

/// Closed set of supported channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Email,
    Webhook,
    WechatRobot,
    WechatApp,
    DingtalkRobot,
    DingtalkWork,
}

/// Channel kinds grouped by provider; templates and size limits are per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFamily {
    Email,
    Webhook,
    Wechat,
    Dingtalk,
}

impl ChannelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Wechat => "wechat",
            Self::Dingtalk => "dingtalk",
        }
    }

    /// Byte limit on rendered content; `None` means unlimited.
    pub fn max_content_len(&self) -> Option<usize> {
        match self {
            Self::Dingtalk => Some(20_000),
            Self::Wechat => Some(2_048),
            Self::Webhook => Some(50_000),
            Self::Email => None,
        }
    }
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        Self::Email,
        Self::Webhook,
        Self::WechatRobot,
        Self::WechatApp,
        Self::DingtalkRobot,
        Self::DingtalkWork,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::WechatRobot => "wechat-robot",
            Self::WechatApp => "wechat-app",
            Self::DingtalkRobot => "dingtalk-robot",
            Self::DingtalkWork => "dingtalk-work",
        }
    }

    pub fn family(&self) -> ChannelFamily {
        match self {
            Self::Email => ChannelFamily::Email,
            Self::Webhook => ChannelFamily::Webhook,
            Self::WechatRobot | Self::WechatApp => ChannelFamily::Wechat,
            Self::DingtalkRobot | Self::DingtalkWork => ChannelFamily::Dingtalk,
        }
    }

    /// Resolve a stored kind.
    ///
    /// Accepts the explicit kinds plus the older family names `wechat` and
    /// `dingtalk`, whose variant comes from the config's `type` field
    /// (`robot`, `app` or `work`; robot when absent).
    pub fn resolve(kind: &str, config: &str) -> Result<Self, NotifyError> {
        let kind = kind.trim().to_ascii_lowercase();
        if let Some(k) = Self::ALL.iter().find(|k| k.as_str() == kind) {
            return Ok(*k);
        }

        let variant = || {
            serde_json::from_str::<serde_json::Value>(config)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                .unwrap_or_default()
        };
        match kind.as_str() {
            "wechat" => match variant().as_str() {
                "app" => Ok(Self::WechatApp),
                "" | "robot" => Ok(Self::WechatRobot),
                other => Err(unsupported(&kind, other)),
            },
            "dingtalk" => match variant().as_str() {
                "work" => Ok(Self::DingtalkWork),
                "" | "robot" => Ok(Self::DingtalkRobot),
                other => Err(unsupported(&kind, other)),
            },
            _ => Err(NotifyError::InvalidConfig {
                kind,
                reason: "unsupported channel kind".into(),
            }),
        }
    }
}

fn unsupported(kind: &str, variant: &str) -> NotifyError {
    NotifyError::InvalidConfig {
        kind: kind.to_string(),
        reason: format!("unsupported type {variant:?}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Inactive,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// A configured delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    /// Kind-specific JSON configuration.
    pub config: String,
    pub status: ChannelStatus,
    pub template_id: Option<i64>,
}

impl Channel {
    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }
}

/// A message template. `kind` names the channel family it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub subject: String,
    pub content: String,
    pub is_default: bool,
    pub status: ChannelStatus,
}

/// Per-channel delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One delivery attempt of one alert on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: Uuid,
    pub channel_id: i64,
    pub alert_id: Uuid,
    pub content: String,
    pub status: LogStatus,
    pub error: Option<String>,
    pub response: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl NotificationLog {
    pub fn pending(channel_id: i64, alert_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            alert_id,
            content: String::new(),
            status: LogStatus::Pending,
            error: None,
            response: None,
            sent_at: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Notification log counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub pending: u64,
}
