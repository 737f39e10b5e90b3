//! Notification content: template rendering, per-family fallback formats, size limits.

use chrono::Duration;
use minijinja::{Environment, context};

use crate::alerts::model::Alert;
use crate::config::SystemInfo;
use crate::error::{DatabaseError, NotifyError};
use crate::mail::reference_now;
use crate::notify::model::{ChannelFamily, ChannelStatus, Template};
use crate::store::Database;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bytes kept clear of the limit for the truncation marker.
const TRUNCATION_HEADROOM: usize = 100;

const TRUNCATION_MARKER: &str = "\n\n...(content truncated)...";

/// Subject and body ready to hand to a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub content: String,
}

/// Renders stored templates against an alert.
pub struct TemplateRenderer {
    system: SystemInfo,
}

impl TemplateRenderer {
    pub fn new(system: SystemInfo) -> Self {
        Self { system }
    }

    /// Render `template`. An empty rendered subject becomes `[Alert] {subject}`.
    pub fn render(&self, template: &Template, alert: &Alert) -> Result<Rendered, NotifyError> {
        let mut env = Environment::new();
        env.add_template("subject", &template.subject)
            .map_err(|e| NotifyError::Template(format!("subject template error: {e}")))?;
        env.add_template("content", &template.content)
            .map_err(|e| NotifyError::Template(format!("content template error: {e}")))?;

        let ctx = self.context(alert);
        let render = |name: &str| {
            env.get_template(name)
                .and_then(|t| t.render(&ctx))
                .map_err(|e| NotifyError::Template(format!("{name} render error: {e}")))
        };

        let subject = render("subject")?;
        let content = render("content")?;
        let subject = if subject.trim().is_empty() {
            fallback_subject(alert)
        } else {
            subject.trim().to_string()
        };
        Ok(Rendered { subject, content })
    }

    fn context(&self, alert: &Alert) -> minijinja::Value {
        let now = reference_now();
        let received_at = alert.received_at.format(TIME_FORMAT).to_string();
        context! {
            email => context! {
                subject => &alert.subject,
                sender => &alert.sender,
                content => &alert.content,
                received_at => &received_at,
                message_id => &alert.message_id,
            },
            alert => context! {
                id => alert.id.to_string(),
                subject => &alert.subject,
                sender => &alert.sender,
                content => &alert.content,
                status => alert.status.as_str(),
                received_at => &received_at,
                retry_count => alert.retry_count,
            },
            system => context! {
                app_name => &self.system.app_name,
                app_version => &self.system.app_version,
                server_name => &self.system.server_name,
                environment => &self.system.environment,
            },
            time => context! {
                now => now.to_rfc3339(),
                now_format => now.format(TIME_FORMAT).to_string(),
                now_unix => now.timestamp(),
                today => now.format("%Y-%m-%d").to_string(),
                yesterday => (now - Duration::days(1)).format("%Y-%m-%d").to_string(),
            },
        }
    }
}

const EMAIL_DEFAULT: &str = r#"<div style="font-family: Arial, sans-serif; max-width: 600px;">
<h2 style="color: #d73502;">Mail Alert</h2>
<p><strong>Subject:</strong> {{ email.subject }}</p>
<p><strong>From:</strong> {{ email.sender }}</p>
<p><strong>Received:</strong> {{ email.received_at }}</p>
<h3>Content</h3>
<pre style="white-space: pre-wrap;">{{ email.content }}</pre>
<p style="color: #6c757d;">{{ system.app_name }} v{{ system.app_version }} on {{ system.server_name }} ({{ system.environment }}), {{ time.now_format }}</p>
</div>"#;

const DINGTALK_DEFAULT: &str = "## Mail Alert

- **Subject:** {{ email.subject }}
- **From:** {{ email.sender }}
- **Received:** {{ email.received_at }}

**Content**
> {{ email.content }}

---
*{{ system.app_name }} on {{ system.server_name }}, {{ time.now_format }}*";

const WECHAT_DEFAULT: &str = "[Mail Alert]
Subject: {{ email.subject }}
From: {{ email.sender }}
Received: {{ email.received_at }}

Content:
{{ email.content }}

{{ system.app_name }} on {{ system.server_name }}, {{ time.now_format }}";

const WEBHOOK_DEFAULT: &str = "Mail Alert
Subject: {{ email.subject }}
From: {{ email.sender }}
Received: {{ email.received_at }}
Content: {{ email.content }}";

/// One default template per channel family.
pub fn builtin_defaults() -> Vec<Template> {
    [
        (
            ChannelFamily::Email,
            "[{{ alert.status }}] {{ system.app_name }} - {{ email.subject }}",
            EMAIL_DEFAULT,
        ),
        (ChannelFamily::Dingtalk, "", DINGTALK_DEFAULT),
        (ChannelFamily::Wechat, "", WECHAT_DEFAULT),
        (ChannelFamily::Webhook, "", WEBHOOK_DEFAULT),
    ]
    .into_iter()
    .map(|(family, subject, content)| Template {
        id: 0,
        name: format!("{} default", family.as_str()),
        kind: family.as_str().to_string(),
        subject: subject.to_string(),
        content: content.to_string(),
        is_default: true,
        status: ChannelStatus::Active,
    })
    .collect()
}

/// Store the built-in defaults for every family that has none yet.
/// Returns how many were written.
pub async fn seed_defaults(db: &dyn Database) -> Result<usize, DatabaseError> {
    let mut written = 0;
    for template in builtin_defaults() {
        if db.insert_default_template(&template).await? {
            tracing::info!(kind = %template.kind, "Default template created");
            written += 1;
        }
    }
    Ok(written)
}

pub fn fallback_subject(alert: &Alert) -> String {
    format!("[Alert] {}", alert.subject)
}

/// Built-in content used when no template applies.
pub fn simple_content(alert: &Alert, family: ChannelFamily) -> String {
    let time = alert.received_at.format(TIME_FORMAT);
    match family {
        ChannelFamily::Dingtalk => format!(
            "## Mail Alert\n\n**Subject:** {}\n**From:** {}\n**Time:** {}\n\n**Content:**\n{}",
            alert.subject, alert.sender, time, alert.content
        ),
        ChannelFamily::Wechat => format!(
            "Mail Alert\nSubject: {}\nFrom: {}\nTime: {}\n\nContent:\n{}",
            alert.subject, alert.sender, time, alert.content
        ),
        ChannelFamily::Email => format!(
            "<h2>Mail Alert</h2><p><strong>Subject:</strong> {}</p><p><strong>From:</strong> {}</p><p><strong>Time:</strong> {}</p><p><strong>Content:</strong></p><pre>{}</pre>",
            alert.subject, alert.sender, time, alert.content
        ),
        ChannelFamily::Webhook => format!(
            "Mail Alert\nSubject: {}\nFrom: {}\nTime: {}\nContent: {}",
            alert.subject, alert.sender, time, alert.content
        ),
    }
}

/// Enforce the family byte limit: cut at `limit - 100` on a char boundary and append a marker.
pub fn truncate(content: &str, family: ChannelFamily) -> String {
    let Some(limit) = family.max_content_len() else {
        return content.to_string();
    };
    if content.len() <= limit {
        return content.to_string();
    }

    let mut cut = limit.saturating_sub(TRUNCATION_HEADROOM);
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &content[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::EmailMessage;
    use crate::store::LibSqlBackend;

    fn alert() -> Alert {
        let email = EmailMessage {
            uid: 7,
            subject: "Disk full".into(),
            sender: "cron@example.com".into(),
            content: "sda1 at 99%".into(),
            message_id: "m1@example.com".into(),
            ..Default::default()
        };
        Alert::from_email(&email, 1, 2, reference_now())
    }

    fn template(subject: &str, content: &str) -> Template {
        Template {
            id: 1,
            name: "t".into(),
            kind: "dingtalk".into(),
            subject: subject.into(),
            content: content.into(),
            is_default: true,
            status: ChannelStatus::Active,
        }
    }

    #[test]
    fn renders_email_alert_and_system_context() {
        let renderer = TemplateRenderer::new(SystemInfo::default());
        let rendered = renderer
            .render(
                &template(
                    "{{ email.subject }} on {{ system.server_name }}",
                    "{{ alert.status }}|{{ email.sender }}|{{ email.message_id }}|{{ alert.retry_count }}",
                ),
                &alert(),
            )
            .unwrap();
        assert_eq!(rendered.subject, "Disk full on localhost");
        assert_eq!(rendered.content, "pending|cron@example.com|m1@example.com|0");
    }

    #[test]
    fn time_context_is_populated() {
        let renderer = TemplateRenderer::new(SystemInfo::default());
        let rendered = renderer
            .render(
                &template("s", "{{ time.today }}/{% if time.now_unix > 0 %}ok{% endif %}"),
                &alert(),
            )
            .unwrap();
        let today = reference_now().format("%Y-%m-%d").to_string();
        assert_eq!(rendered.content, format!("{today}/ok"));
    }

    #[test]
    fn empty_subject_falls_back() {
        let renderer = TemplateRenderer::new(SystemInfo::default());
        let rendered = renderer.render(&template("  ", "body"), &alert()).unwrap();
        assert_eq!(rendered.subject, "[Alert] Disk full");
    }

    #[test]
    fn syntax_error_is_template_error() {
        let renderer = TemplateRenderer::new(SystemInfo::default());
        let err = renderer
            .render(&template("{{ email.subject", "body"), &alert())
            .unwrap_err();
        assert!(matches!(err, NotifyError::Template(_)));
    }

    #[test]
    fn builtin_defaults_render() {
        let renderer = TemplateRenderer::new(SystemInfo::default());
        let defaults = builtin_defaults();
        assert_eq!(defaults.len(), 4);
        for template in &defaults {
            let rendered = renderer.render(template, &alert()).unwrap();
            assert!(rendered.content.contains("Disk full"), "{}", template.kind);
            assert!(rendered.content.contains("cron@example.com"), "{}", template.kind);
        }
        let email = renderer.render(&defaults[0], &alert()).unwrap();
        assert_eq!(email.subject, "[pending] Mail Alert - Disk full");
    }

    #[tokio::test]
    async fn seeding_fills_missing_families_once() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.save_template(&Template {
            kind: "email".into(),
            ..template("custom", "custom body")
        })
        .await
        .unwrap();

        assert_eq!(seed_defaults(&db).await.unwrap(), 3);
        assert_eq!(seed_defaults(&db).await.unwrap(), 0);

        let email = db.default_template("email").await.unwrap().unwrap();
        assert_eq!(email.content, "custom body");
        for kind in ["dingtalk", "wechat", "webhook"] {
            let seeded = db.default_template(kind).await.unwrap().unwrap();
            assert_eq!(seeded.name, format!("{kind} default"));
        }
    }

    #[test]
    fn simple_formats_per_family() {
        let a = alert();
        assert!(simple_content(&a, ChannelFamily::Dingtalk).starts_with("## Mail Alert"));
        assert!(simple_content(&a, ChannelFamily::Email).contains("<pre>sda1 at 99%</pre>"));
        assert!(simple_content(&a, ChannelFamily::Wechat).contains("Subject: Disk full"));
        assert!(simple_content(&a, ChannelFamily::Webhook).ends_with("Content: sda1 at 99%"));
    }

    #[test]
    fn truncation_limits() {
        let long = "x".repeat(3000);
        let cut = truncate(&long, ChannelFamily::Wechat);
        assert!(cut.starts_with(&"x".repeat(1948)));
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert_eq!(cut.len(), 1948 + TRUNCATION_MARKER.len());

        assert_eq!(truncate(&long, ChannelFamily::Dingtalk), long);
        assert_eq!(truncate(&"y".repeat(60_000), ChannelFamily::Email).len(), 60_000);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 3-byte chars: 1948 is not a boundary.
        let long = "告".repeat(1000);
        let cut = truncate(&long, ChannelFamily::Wechat);
        let kept = cut.trim_end_matches(TRUNCATION_MARKER);
        assert_eq!(kept.len(), 1947);
        assert!(kept.chars().all(|c| c == '告'));
    }
}
