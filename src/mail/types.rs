//! Mail types: monitored mailbox configuration, fetched messages, time normalization.

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Offset of the reference timezone (Asia/Shanghai, no DST since 1991).
const REFERENCE_OFFSET_SECS: i32 = 8 * 3600;

/// The fixed timezone all receive times are normalized to.
pub fn reference_offset() -> FixedOffset {
    FixedOffset::east_opt(REFERENCE_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Convert any timestamp into the reference timezone.
pub fn to_reference<Tz: TimeZone>(dt: &DateTime<Tz>) -> DateTime<FixedOffset> {
    dt.with_timezone(&reference_offset())
}

/// Current instant in the reference timezone.
pub fn reference_now() -> DateTime<FixedOffset> {
    to_reference(&Utc::now())
}

/// Midnight of the current reference-timezone day, as UTC.
pub fn start_of_reference_day() -> DateTime<Utc> {
    let now = reference_now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| reference_offset().from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Whether a mailbox is monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxStatus {
    Active,
    Inactive,
}

impl MailboxStatus {
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

/// A monitored mailbox. Owned by the store; read-only to the monitor.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Only IMAP is polled; kept for display.
    pub protocol: String,
    pub ssl: bool,
    pub status: MailboxStatus,
}

impl MailboxConfig {
    pub fn is_active(&self) -> bool {
        self.status == MailboxStatus::Active
    }

    /// Hosts that reject clients which do not identify themselves.
    pub fn requires_id_handshake(&self) -> bool {
        let host = self.host.to_ascii_lowercase();
        host.contains("126.com") || host.contains("163.com") || host.contains("qiye.aliyun.com")
    }

    /// Hosts whose server-side `SEARCH` cannot be trusted.
    pub fn requires_fetch_fallback(&self) -> bool {
        self.host.to_ascii_lowercase().contains("qiye.aliyun.com")
    }
}

/// One fetched and decoded message, discarded after rule evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailMessage {
    pub uid: u32,
    pub subject: String,
    /// Sender address (From).
    pub sender: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Plain-text body, derived from html when no text part exists.
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub html_content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_names: Vec<String>,
    /// Message-ID header without angle brackets; empty when absent.
    pub message_id: String,
    /// Receive time in the reference timezone.
    pub received_at: Option<DateTime<FixedOffset>>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl EmailMessage {
    /// Strictly after `start`. Messages without a receive time are never eligible.
    pub fn received_after(&self, start: &DateTime<FixedOffset>) -> bool {
        self.received_at.is_some_and(|t| t > *start)
    }
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}
