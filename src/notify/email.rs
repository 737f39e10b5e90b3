//! SMTP email sender via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::Deserialize;

use crate::error::NotifyError;
use crate::mail::{html_to_text, reference_now};
use crate::notify::model::ChannelKind;
use crate::notify::sender::{ChannelSender, invalid, parse_config};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Port that speaks TLS from the first byte; every other port uses STARTTLS when `ssl` is set.
const IMPLICIT_TLS_PORT: i64 = 465;

const HTML_MARKERS: &[&str] = &[
    "<html>", "<body>", "<div>", "<p>", "<br>", "<h1>", "<h2>", "<h3>", "<strong>", "<em>",
    "<ul>", "<ol>", "<li>", "<a>", "<img>", "<pre>",
];

/// Stored SMTP channel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub from: String,
    pub from_name: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: String,
    /// Subject template; the notification subject when empty.
    pub subject: String,
    /// Body template; the notification content when empty.
    pub template: String,
    /// `text`, `html` or `mixed` (default).
    pub format: String,
    /// Seconds.
    pub timeout: i64,
    /// 1 (high) to 3 (low); 0 means unset.
    pub priority: i64,
}

/// Lenient address check: non-empty local part, dotted domain without empty labels.
pub fn is_valid_address(address: &str) -> bool {
    let address = address.trim();
    if address.len() < 3 || address.len() > 320 {
        return false;
    }
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

fn contains_html(content: &str) -> bool {
    let lower = content.to_ascii_lowercase();
    HTML_MARKERS.iter().any(|tag| lower.contains(tag))
}

/// Substitute `{{title}}`, `{{content}}`, `{{timestamp}}`, `{{date}}`, `{{time}}`.
fn render(template: &str, title: &str, content: &str) -> String {
    let now = reference_now();
    template
        .replace("{{title}}", title)
        .replace("{{content}}", content)
        .replace("{{timestamp}}", &now.format("%Y-%m-%d %H:%M:%S").to_string())
        .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{time}}", &now.format("%H:%M:%S").to_string())
}

fn mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, NotifyError> {
    let parsed = address
        .trim()
        .parse()
        .map_err(|e| invalid(ChannelKind::Email, format!("invalid address {address}: {e}")))?;
    Ok(Mailbox::new(
        name.filter(|n| !n.is_empty()).map(str::to_string),
        parsed,
    ))
}

/// Build the outgoing message for `cfg`.
pub fn build_message(cfg: &EmailConfig, title: &str, content: &str) -> Result<Message, NotifyError> {
    let subject = if cfg.subject.is_empty() {
        title.to_string()
    } else {
        render(&cfg.subject, title, content)
    };

    let mut builder = Message::builder()
        .from(mailbox(&cfg.from, Some(&cfg.from_name))?)
        .subject(subject);
    for to in &cfg.to {
        builder = builder.to(mailbox(to, None)?);
    }
    for cc in &cfg.cc {
        builder = builder.cc(mailbox(cc, None)?);
    }
    for bcc in &cfg.bcc {
        builder = builder.bcc(mailbox(bcc, None)?);
    }
    if !cfg.reply_to.is_empty() {
        builder = builder.reply_to(mailbox(&cfg.reply_to, None)?);
    }

    let body = if cfg.template.is_empty() {
        content.to_string()
    } else {
        render(&cfg.template, title, content)
    };

    let built = match cfg.format.to_ascii_lowercase().as_str() {
        "html" => builder.singlepart(SinglePart::html(body)),
        "text" => builder.singlepart(SinglePart::plain(body)),
        _ if contains_html(&body) => {
            builder.multipart(MultiPart::alternative_plain_html(html_to_text(&body), body))
        }
        _ => builder.header(ContentType::TEXT_PLAIN).body(body),
    };
    built.map_err(|e| NotifyError::SendFailed {
        name: "email".into(),
        reason: format!("Failed to build email: {e}"),
    })
}

fn transport(cfg: &EmailConfig) -> Result<SmtpTransport, NotifyError> {
    let port = u16::try_from(cfg.port)
        .map_err(|_| invalid(ChannelKind::Email, "port must be within 1-65535"))?;
    let relay_err = |e: lettre::transport::smtp::Error| NotifyError::SendFailed {
        name: "email".into(),
        reason: format!("SMTP relay error: {e}"),
    };

    let builder = if cfg.port == IMPLICIT_TLS_PORT {
        SmtpTransport::relay(&cfg.host).map_err(relay_err)?
    } else if cfg.ssl {
        SmtpTransport::starttls_relay(&cfg.host).map_err(relay_err)?
    } else {
        SmtpTransport::builder_dangerous(&cfg.host)
    };

    let timeout = if cfg.timeout > 0 {
        Duration::from_secs(cfg.timeout.unsigned_abs())
    } else {
        DEFAULT_TIMEOUT
    };
    let mut builder = builder.port(port).timeout(Some(timeout));
    if !cfg.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            cfg.username.clone(),
            cfg.password.clone(),
        ));
    }
    Ok(builder.build())
}

pub struct EmailSender;

impl EmailSender {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EmailSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn validate(&self, config: &str) -> Result<(), NotifyError> {
        let cfg: EmailConfig = parse_config(self.kind(), config)?;
        if cfg.host.trim().is_empty() {
            return Err(invalid(self.kind(), "SMTP host is required"));
        }
        if !(1..=65535).contains(&cfg.port) {
            return Err(invalid(self.kind(), "port must be within 1-65535"));
        }
        if cfg.from.trim().is_empty() {
            return Err(invalid(self.kind(), "from address is required"));
        }
        if cfg.to.is_empty() {
            return Err(invalid(self.kind(), "at least one recipient is required"));
        }
        let reply_to = (!cfg.reply_to.is_empty()).then_some(&cfg.reply_to);
        for address in std::iter::once(&cfg.from)
            .chain(&cfg.to)
            .chain(&cfg.cc)
            .chain(&cfg.bcc)
            .chain(reply_to)
        {
            if !is_valid_address(address) {
                return Err(invalid(self.kind(), format!("invalid address {address}")));
            }
        }
        if cfg.priority != 0 && !(1..=3).contains(&cfg.priority) {
            return Err(invalid(self.kind(), "priority must be within 1-3"));
        }
        if !cfg.format.is_empty()
            && !["text", "html", "mixed"].contains(&cfg.format.to_ascii_lowercase().as_str())
        {
            return Err(invalid(self.kind(), format!("unsupported format {}", cfg.format)));
        }
        Ok(())
    }

    async fn send(
        &self,
        config: &str,
        subject: &str,
        content: &str,
    ) -> Result<String, NotifyError> {
        self.validate(config)?;
        let cfg: EmailConfig = parse_config(self.kind(), config)?;
        let message = build_message(&cfg, subject, content)?;
        let recipients = cfg.to.len() + cfg.cc.len() + cfg.bcc.len();
        let transport = transport(&cfg)?;

        let response = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| NotifyError::SendFailed {
                name: "email".into(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| NotifyError::SendFailed {
                name: "email".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(recipients, host = %cfg.host, "Alert email sent");
        Ok(format!(
            "SMTP {}: sent to {recipients} recipient(s)",
            response.code()
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config() -> serde_json::Value {
        json!({
            "host": "smtp.example.com",
            "port": 587,
            "ssl": true,
            "from": "alerts@example.com",
            "from_name": "Mail Alert",
            "to": ["ops@example.com"],
        })
    }

    #[test]
    fn address_check() {
        assert!(is_valid_address("ops@example.com"));
        assert!(is_valid_address("a@b@example.com"));
        assert!(!is_valid_address("ops@localhost"));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("ops@.example.com"));
        assert!(!is_valid_address("ops@example..com"));
        assert!(!is_valid_address("ops.example.com"));
    }

    #[test]
    fn validation() {
        let sender = EmailSender::new();
        assert!(sender.validate(&config().to_string()).is_ok());

        let mut no_to = config();
        no_to["to"] = json!([]);
        assert!(sender.validate(&no_to.to_string()).is_err());

        let mut bad_port = config();
        bad_port["port"] = json!(70000);
        assert!(sender.validate(&bad_port.to_string()).is_err());

        let mut bad_cc = config();
        bad_cc["cc"] = json!(["nobody"]);
        assert!(sender.validate(&bad_cc.to_string()).is_err());

        let mut bad_priority = config();
        bad_priority["priority"] = json!(5);
        assert!(sender.validate(&bad_priority.to_string()).is_err());

        let mut bad_format = config();
        bad_format["format"] = json!("rtf");
        assert!(sender.validate(&bad_format.to_string()).is_err());
    }

    #[test]
    fn html_content_becomes_alternative() {
        let cfg: EmailConfig = serde_json::from_value(config()).unwrap();
        let message = build_message(&cfg, "Disk full", "<p>web-1</p><br>at 99%").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Disk full"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
        assert!(raw.contains("Mail Alert"));
    }

    #[test]
    fn templates_and_text_format() {
        let mut value = config();
        value["subject"] = json!("[ALERT] {{title}}");
        value["template"] = json!("Body: {{content}}");
        value["format"] = json!("text");
        let cfg: EmailConfig = serde_json::from_value(value).unwrap();

        let message = build_message(&cfg, "Disk full", "web-1").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: [ALERT] Disk full"));
        assert!(raw.contains("Body: web-1"));
        assert!(raw.contains("text/plain"));
        assert!(!raw.contains("multipart"));
    }

    #[tokio::test]
    async fn unreachable_server_is_send_failure() {
        let mut value = config();
        value["host"] = json!("127.0.0.1");
        value["port"] = json!(1);
        value["ssl"] = json!(false);
        value["timeout"] = json!(2);

        let err = EmailSender::new()
            .send(&value.to_string(), "t", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::SendFailed { .. }));
    }
}
