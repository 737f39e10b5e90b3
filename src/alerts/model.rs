//! Alert records.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mail::EmailMessage;
use crate::mail::types::to_reference;

/// Alert lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Created, not yet dispatched (or awaiting redispatch).
    Pending,
    /// At least one channel delivered.
    Sent,
    /// Every channel failed.
    Failed,
    Canceled,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Pending,
        }
    }
}

/// A persisted alert derived from one matched message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub mailbox_id: i64,
    pub rule_group_id: Option<i64>,
    /// Pre-rule-group association, kept for channel resolution.
    pub rule_id: Option<i64>,
    pub uid: u32,
    pub subject: String,
    pub sender: String,
    pub content: String,
    /// Empty when the message carried no Message-ID.
    pub message_id: String,
    pub received_at: DateTime<FixedOffset>,
    pub status: AlertStatus,
    pub retry_count: u32,
    pub sent_channels: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// New pending alert for `email` matched by `rule_group_id`.
    pub fn from_email(
        email: &EmailMessage,
        mailbox_id: i64,
        rule_group_id: i64,
        received_at: DateTime<FixedOffset>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            rule_group_id: Some(rule_group_id),
            rule_id: None,
            uid: email.uid,
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            content: email.content.clone(),
            message_id: email.message_id.clone(),
            received_at,
            status: AlertStatus::Pending,
            retry_count: 0,
            sent_channels: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Composite deduplication key used when the message has no Message-ID.
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            mailbox_id: self.mailbox_id,
            uid: self.uid,
            subject: self.subject.clone(),
            sender: self.sender.clone(),
            hour_bucket: hour_bucket(&self.received_at),
        }
    }
}

/// Fallback identity of a message without a Message-ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeKey {
    pub mailbox_id: i64,
    pub uid: u32,
    pub subject: String,
    pub sender: String,
    pub hour_bucket: String,
}

impl CompositeKey {
    pub fn for_email(mailbox_id: i64, email: &EmailMessage, received_at: &DateTime<FixedOffset>) -> Self {
        Self {
            mailbox_id,
            uid: email.uid,
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            hour_bucket: hour_bucket(received_at),
        }
    }
}

/// Receive time truncated to the hour in the reference timezone, e.g. `2024-01-02T18`.
pub fn hour_bucket(at: &DateTime<FixedOffset>) -> String {
    to_reference(at).format("%Y-%m-%dT%H").to_string()
}

/// Alert counters for the operator surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounts {
    pub today: u64,
    pub pending: u64,
    pub failed: u64,
}
