//! MIME decoding of fetched messages.
//!
//! `mail_parser` does the heavy lifting (multipart trees, transfer encodings,
//! charsets, RFC 2047 headers). When it yields no text at all, a raw scan of
//! the body is attempted before falling back to an envelope summary.

use std::sync::LazyLock;

use base64::Engine as _;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::Regex;

use super::types::{EmailMessage, extract_addresses, to_reference};

/// Decoded view of one RFC 822 message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMail {
    pub subject: String,
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    /// Without angle brackets; empty when the header is absent.
    pub message_id: String,
    pub date: Option<DateTime<FixedOffset>>,
    /// First text/plain leaf, or text derived from `html`.
    pub text: String,
    /// First text/html leaf.
    pub html: String,
    pub attachment_names: Vec<String>,
}

/// Decode a raw message. Returns `None` only when the bytes have no parsable headers.
pub fn parse_message(raw: &[u8]) -> Option<ParsedMail> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let date = parsed
        .date()
        .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single())
        .map(|t| to_reference(&t));

    let mut text = String::new();
    let mut html = String::new();
    for part in &parsed.parts {
        let is_attachment = MimeHeaders::content_disposition(part)
            .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"));
        if is_attachment {
            continue;
        }
        match &part.body {
            PartType::Text(body) if text.is_empty() => text = body.to_string(),
            PartType::Html(body) if html.is_empty() => html = body.to_string(),
            _ => {}
        }
    }

    if text.trim().is_empty() && html.trim().is_empty() {
        text = fallback_body(&String::from_utf8_lossy(raw));
    } else if text.trim().is_empty() {
        text = html_to_text(&html);
    }

    let attachment_names = parsed
        .attachments()
        .filter_map(|part| MimeHeaders::attachment_name(part).map(|s| s.to_string()))
        .collect();

    Some(ParsedMail {
        subject: parsed.subject().unwrap_or_default().to_string(),
        sender,
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        message_id: parsed.message_id().unwrap_or_default().to_string(),
        date,
        text: text.trim().to_string(),
        html,
        attachment_names,
    })
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</?p>|</?div>").unwrap());

/// Reduce HTML to readable text.
///
/// Turns `<br>`, `<p>` and `<div>` into line breaks, strips remaining tags,
/// decodes the common entities, then trims each line and drops blank ones.
pub fn html_to_text(html: &str) -> String {
    let broken = BREAK_RE.replace_all(html, "\n");
    let stripped = TAG_RE.replace_all(&broken, "");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&");

    decoded
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content used when the body cannot be decoded: a summary of envelope fields.
pub fn envelope_summary(msg: &EmailMessage) -> String {
    let mut lines = Vec::new();
    if !msg.subject.is_empty() {
        lines.push(format!("Subject: {}", msg.subject));
    }
    if !msg.sender.is_empty() {
        lines.push(format!("From: {}", msg.sender));
    }
    if let Some(at) = msg.received_at {
        lines.push(format!("Time: {}", at.format("%Y-%m-%d %H:%M:%S")));
    }
    lines.push("[message body unavailable]".to_string());
    lines.join("\n")
}

// ── Raw fallback ────────────────────────────────────────────────────

/// Split off the body after the first blank line and decode it by hand.
fn fallback_body(raw: &str) -> String {
    let Some((headers, body)) = split_headers(raw) else {
        return String::new();
    };

    if raw.to_ascii_lowercase().contains("content-type: multipart/") {
        let parts: Vec<&str> = body.split("--").collect();
        let find = |ctype: &str| {
            parts
                .iter()
                .find(|p| p.to_ascii_lowercase().contains(ctype))
                .map(|p| extract_part(p))
        };
        if let Some(text) = find("content-type: text/plain") {
            return text;
        }
        if let Some(html) = find("content-type: text/html") {
            return html_to_text(&html);
        }
        return body.to_string();
    }

    if let Some(encoding) = header_value(headers, "content-transfer-encoding") {
        return decode_transfer(body, &encoding);
    }
    body.to_string()
}

/// Body of one multipart section, decoded per its own transfer encoding.
fn extract_part(part: &str) -> String {
    let Some((headers, body)) = split_headers(part) else {
        return String::new();
    };
    match header_value(headers, "content-transfer-encoding") {
        Some(encoding) => decode_transfer(body.trim(), &encoding),
        None => body.trim().to_string(),
    }
}

fn split_headers(s: &str) -> Option<(&str, &str)> {
    s.split_once("\r\n\r\n").or_else(|| s.split_once("\n\n"))
}

fn header_value(headers: &str, name: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_ascii_lowercase())
    })
}

fn decode_transfer(body: &str, encoding: &str) -> String {
    match encoding {
        "base64" => {
            let compact: String = body.split_whitespace().collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_else(|_| body.to_string())
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_string(),
    }
}

fn decode_quoted_printable(body: &str) -> String {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        // Soft line break.
        if bytes.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match hex {
            Some(b) => {
                out.push(b);
                i += 3;
            }
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALTERNATIVE: &str = "From: Alerts <alerts@example.com>\r\n\
To: ops@example.com, oncall@example.com\r\n\
Cc: lead@example.com\r\n\
Subject: CPU high on db-1\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Tue, 02 Jan 2024 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
CPU at 97% for 5 minutes\r\n\
--XYZ\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>CPU at <b>97%</b> for 5 minutes</p>\r\n\
--XYZ--\r\n";

    #[test]
    fn multipart_alternative_yields_both_bodies() {
        let mail = parse_message(ALTERNATIVE.as_bytes()).unwrap();
        assert_eq!(mail.subject, "CPU high on db-1");
        assert_eq!(mail.sender, "alerts@example.com");
        assert_eq!(mail.to, vec!["ops@example.com", "oncall@example.com"]);
        assert_eq!(mail.cc, vec!["lead@example.com"]);
        assert_eq!(mail.message_id, "abc123@example.com");
        assert_eq!(mail.text, "CPU at 97% for 5 minutes");
        assert!(mail.html.contains("<b>97%</b>"));

        let date = mail.date.unwrap();
        assert_eq!(date.offset().local_minus_utc(), 8 * 3600);
        assert_eq!(date.format("%Y-%m-%d %H:%M").to_string(), "2024-01-02 18:00");
    }

    #[test]
    fn html_only_message_derives_text() {
        let raw = "From: a@example.com\r\n\
Subject: html\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<div>Disk&nbsp;full</div><div>on <i>web-2</i></div>\r\n";
        let mail = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(mail.text, "Disk full\non web-2");
        assert!(mail.message_id.is_empty());
        assert!(mail.date.is_none());
    }

    #[test]
    fn nested_multipart_decodes_transfer_encodings() {
        let raw = "From: a@example.com\r\n\
Subject: nested\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"OUTER\"\r\n\
\r\n\
--OUTER\r\n\
Content-Type: multipart/alternative; boundary=\"INNER\"\r\n\
\r\n\
--INNER\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8gcGxhaW4=\r\n\
--INNER\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
<p>caf=C3=A9</p>\r\n\
--INNER--\r\n\
--OUTER\r\n\
Content-Type: text/plain; name=\"log.txt\"\r\n\
Content-Disposition: attachment; filename=\"log.txt\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
bG9nIGxpbmU=\r\n\
--OUTER--\r\n";
        let mail = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(mail.text.trim(), "hello plain");
        assert_eq!(mail.html.trim(), "<p>café</p>");
        assert_eq!(mail.attachment_names, vec!["log.txt"]);
    }

    #[test]
    fn attachment_names_collected() {
        let raw = "From: a@example.com\r\n\
Subject: report\r\n\
Content-Type: multipart/mixed; boundary=\"B\"\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--B\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--B--\r\n";
        let mail = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(mail.text, "see attached");
        assert_eq!(mail.attachment_names, vec!["report.pdf"]);
    }

    #[test]
    fn html_to_text_handles_breaks_and_entities() {
        let html = "<p>Hello&nbsp;&amp; welcome</p><BR/>  <span>line &lt;2&gt;</span>  ";
        assert_eq!(html_to_text(html), "Hello & welcome\nline <2>");
    }

    #[test]
    fn quoted_printable_decodes_soft_breaks() {
        assert_eq!(decode_quoted_printable("caf=C3=A9 is=\r\n open"), "café is open");
        assert_eq!(decode_quoted_printable("a=ZZb"), "a=ZZb");
    }

    #[test]
    fn fallback_decodes_base64_body() {
        let raw = "Subject: x\nContent-Transfer-Encoding: base64\n\naGVsbG8gd29ybGQ=\n";
        assert_eq!(fallback_body(raw), "hello world");
    }

    #[test]
    fn envelope_summary_lists_known_fields() {
        let msg = EmailMessage {
            subject: "Backup failed".into(),
            sender: "cron@example.com".into(),
            ..Default::default()
        };
        assert_eq!(
            envelope_summary(&msg),
            "Subject: Backup failed\nFrom: cron@example.com\n[message body unavailable]"
        );
        assert_eq!(
            envelope_summary(&EmailMessage::default()),
            "[message body unavailable]"
        );
    }
}
