//! IMAP access: a small blocking IMAP4rev1 client over rustls and the async
//! [`MailFetcher`] seam the monitor polls through.
//!
//! All socket I/O is blocking; [`ImapFetcher`] runs every session inside
//! `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use super::diagnosis::{DiagnosisStep, STEP_FOLDER, diagnose_session};
use super::parser::{envelope_summary, parse_message};
use super::types::{EmailMessage, MailboxConfig, to_reference};
use crate::error::MailError;

/// Items requested for every candidate message. `BODY.PEEK` leaves `\Seen` untouched.
const FETCH_ITEMS: &str = "(UID FLAGS RFC822.SIZE INTERNALDATE BODY.PEEK[])";
/// Items requested by the date-only scan used on hosts with unreliable `SEARCH`.
const DATE_SCAN_ITEMS: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER.FIELDS (DATE)])";

static LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\d+)\}\r?\n$").unwrap());
static EXISTS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\* (\d+) EXISTS").unwrap());
static UIDNEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[UIDNEXT (\d+)\]").unwrap());
static UID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bUID (\d+)").unwrap());
static FLAGS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bFLAGS \(([^)]*)\)").unwrap());
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bRFC822\.SIZE (\d+)").unwrap());
static INTERNALDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bINTERNALDATE "([^"]+)""#).unwrap());

// ── Session ─────────────────────────────────────────────────────────

trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// One untagged server response, with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Counts reported by `EXAMINE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub exists: u32,
    pub uid_next: Option<u32>,
}

/// One `FETCH` response.
#[derive(Debug, Clone, Default)]
pub struct FetchItem {
    pub uid: u32,
    pub flags: Vec<String>,
    pub size: u64,
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// First literal of the response: the full message or the requested header fields.
    pub body: Vec<u8>,
}

impl FetchItem {
    pub fn is_seen(&self) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"))
    }
}

/// A blocking, tagged-command IMAP session.
pub struct ImapSession {
    stream: BufReader<Box<dyn Transport>>,
    next_tag: u32,
}

impl ImapSession {
    /// Open a TCP connection (TLS when `ssl`) and consume the server greeting.
    pub fn connect(host: &str, port: u16, ssl: bool, timeout: Duration) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((host, port)).map_err(|e| MailError::Connect {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let transport: Box<dyn Transport> = if ssl {
            Box::new(tls_stream(host, tcp)?)
        } else {
            Box::new(tcp)
        };
        Self::handshake(transport)
    }

    fn handshake(transport: Box<dyn Transport>) -> Result<Self, MailError> {
        let mut session = Self {
            stream: BufReader::new(transport),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(MailError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), MailError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        self.command(&cmd).map(|_| ()).map_err(|e| match e {
            MailError::Command { reason, .. } => MailError::AuthFailed {
                username: username.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// RFC 2971 client identification.
    pub fn id(&mut self, name: &str, version: &str, vendor: &str) -> Result<(), MailError> {
        let cmd = format!(
            "ID (\"name\" {} \"version\" {} \"vendor\" {})",
            quote(name),
            quote(version),
            quote(vendor)
        );
        self.command(&cmd).map(|_| ())
    }

    /// Select `folder` read-only.
    pub fn examine(&mut self, folder: &str) -> Result<FolderStatus, MailError> {
        let responses = self
            .command(&format!("EXAMINE {}", quote(folder)))
            .map_err(|e| match e {
                MailError::Command { reason, .. } => MailError::FolderAccess {
                    folder: folder.to_string(),
                    reason,
                },
                other => other,
            })?;

        let mut status = FolderStatus::default();
        for r in &responses {
            if let Some(c) = EXISTS_RE.captures(&r.text) {
                status.exists = c[1].parse().unwrap_or(0);
            }
            if let Some(c) = UIDNEXT_RE.captures(&r.text) {
                status.uid_next = c[1].parse().ok();
            }
        }
        Ok(status)
    }

    /// `UID SEARCH`; returns matching UIDs in ascending order.
    pub fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, MailError> {
        let responses = self.command(&format!("UID SEARCH {criteria}"))?;
        let mut uids: Vec<u32> = responses
            .iter()
            .filter_map(|r| r.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    /// `UID FETCH`; responses without a UID are dropped.
    pub fn uid_fetch(&mut self, set: &str, items: &str) -> Result<Vec<FetchItem>, MailError> {
        let responses = self.command(&format!("UID FETCH {set} {items}"))?;
        let mut fetched: Vec<FetchItem> = responses
            .into_iter()
            .filter(|r| r.text.contains(" FETCH ("))
            .filter_map(parse_fetch)
            .collect();
        fetched.sort_by_key(|item| item.uid);
        Ok(fetched)
    }

    /// Best-effort `LOGOUT`.
    pub fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    // ── Wire helpers ────────────────────────────────────────────────

    fn command(&mut self, cmd: &str) -> Result<Vec<Untagged>, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        writer.flush()?;

        let (untagged, status) = self.read_response(&tag)?;
        let rest = status[tag.len()..].trim();
        if rest.get(..2).is_some_and(|s| s.eq_ignore_ascii_case("OK")) {
            Ok(untagged)
        } else {
            Err(MailError::Command {
                command: command_name(cmd),
                reason: rest.to_string(),
            })
        }
    }

    fn read_response(&mut self, tag: &str) -> Result<(Vec<Untagged>, String), MailError> {
        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            if line.starts_with(&prefix) {
                return Ok((untagged, line));
            }
            if line.starts_with('+') {
                return Err(MailError::Protocol(
                    "unexpected continuation request".to_string(),
                ));
            }

            let mut response = Untagged {
                text: line,
                literals: Vec::new(),
            };
            while let Some(len) = literal_len(&response.text) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
                let tail = self.read_line()?;
                response.text.truncate(response.text.trim_end().len());
                response.text.push_str(&tail);
            }
            untagged.push(response);
        }
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailError::Closed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn tls_stream(
    host: &str,
    tcp: TcpStream,
) -> Result<rustls::StreamOwned<rustls::ClientConnection, TcpStream>, MailError> {
    let tls_err = |reason: String| MailError::Tls {
        host: host.to_string(),
        reason,
    };

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| tls_err(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| tls_err(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Command verb for error messages; never includes arguments (credentials).
fn command_name(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match (words.next(), words.next()) {
        (Some("UID"), Some(verb)) => format!("UID {verb}"),
        (Some(verb), _) => verb.to_string(),
        _ => String::new(),
    }
}

fn literal_len(line: &str) -> Option<usize> {
    LITERAL_RE.captures(line).and_then(|c| c[1].parse().ok())
}

fn parse_fetch(response: Untagged) -> Option<FetchItem> {
    let text = &response.text;
    let uid = UID_RE.captures(text)?[1].parse().ok()?;
    let flags = FLAGS_RE
        .captures(text)
        .map(|c| c[1].split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let size = SIZE_RE
        .captures(text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let internal_date = INTERNALDATE_RE
        .captures(text)
        .and_then(|c| parse_internal_date(&c[1]));

    Some(FetchItem {
        uid,
        flags,
        size,
        internal_date,
        body: response.literals.into_iter().next().unwrap_or_default(),
    })
}

/// `INTERNALDATE` format: ` 2-Jan-2024 10:00:00 +0000` (day may be space-padded).
fn parse_internal_date(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|t| to_reference(&t))
}

/// Date from a `HEADER.FIELDS (DATE)` literal.
fn header_date(header: &[u8]) -> Option<DateTime<FixedOffset>> {
    let text = String::from_utf8_lossy(header);
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("date") {
            return None;
        }
        let value = value.trim();
        // Drop a trailing "(CST)" style comment.
        let value = value.split(" (").next().unwrap_or(value);
        DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|t| to_reference(&t))
    })
}

/// Turn one full-message fetch into an [`EmailMessage`].
///
/// Receive time is the `Date` header, falling back to `INTERNALDATE`. An
/// undecodable body is replaced by an envelope summary.
pub fn build_message(item: FetchItem) -> EmailMessage {
    let mut msg = EmailMessage {
        uid: item.uid,
        size: item.size,
        flags: item.flags,
        received_at: item.internal_date,
        ..Default::default()
    };

    if let Some(parsed) = parse_message(&item.body) {
        msg.subject = parsed.subject;
        msg.sender = parsed.sender;
        msg.to = parsed.to;
        msg.cc = parsed.cc;
        msg.message_id = parsed.message_id;
        msg.content = parsed.text;
        msg.html_content = parsed.html;
        msg.attachment_names = parsed.attachment_names;
        if parsed.date.is_some() {
            msg.received_at = parsed.date;
        }
    }
    if msg.content.trim().is_empty() {
        msg.content = envelope_summary(&msg);
    }
    msg
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// Parameters of one mailbox check.
#[derive(Debug, Clone)]
pub struct FetchQuery {
    pub folder: String,
    /// Only messages received strictly after this instant are returned.
    pub since: DateTime<FixedOffset>,
    /// Highest UID already handled; 0 before the first check.
    pub last_uid: u32,
    pub only_unread: bool,
}

/// Result of one mailbox check.
#[derive(Debug, Default)]
pub struct FetchBatch {
    /// Eligible messages in ascending UID order.
    pub messages: Vec<EmailMessage>,
    /// Highest UID seen this check, including ineligible messages; never below `last_uid`.
    pub max_uid: u32,
}

/// Source of new mail for the monitor.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    /// Connect, authenticate, identify and open `folder` read-only.
    async fn validate(&self, mailbox: &MailboxConfig, folder: &str) -> Result<(), MailError>;

    /// Fetch messages newer than `query.last_uid` received after `query.since`.
    async fn fetch_new(
        &self,
        mailbox: &MailboxConfig,
        query: &FetchQuery,
    ) -> Result<FetchBatch, MailError>;

    /// Step-by-step access report. The default only runs [`validate`](Self::validate).
    async fn diagnose(&self, mailbox: &MailboxConfig, folder: &str) -> Vec<DiagnosisStep> {
        vec![match self.validate(mailbox, folder).await {
            Ok(()) => DiagnosisStep::ok(STEP_FOLDER, format!("Opened {folder}")),
            Err(e) => DiagnosisStep::failed(
                STEP_FOLDER,
                e.to_string(),
                "Check the mailbox settings.",
            ),
        }]
    }
}

/// [`MailFetcher`] over real IMAP sessions.
#[derive(Debug, Clone)]
pub struct ImapFetcher {
    io_timeout: Duration,
}

impl ImapFetcher {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn validate(&self, mailbox: &MailboxConfig, folder: &str) -> Result<(), MailError> {
        let mailbox = mailbox.clone();
        let folder = folder.to_string();
        let timeout = self.io_timeout;
        run_blocking(move || {
            let (mut session, _) = open_folder(&mailbox, &folder, timeout)?;
            session.logout();
            Ok(())
        })
        .await
    }

    async fn fetch_new(
        &self,
        mailbox: &MailboxConfig,
        query: &FetchQuery,
    ) -> Result<FetchBatch, MailError> {
        let mailbox = mailbox.clone();
        let query = query.clone();
        let timeout = self.io_timeout;
        run_blocking(move || {
            let (mut session, status) = open_folder(&mailbox, &query.folder, timeout)?;
            let result = fetch_in_session(&mut session, &mailbox, &query, status);
            session.logout();
            result
        })
        .await
    }

    async fn diagnose(&self, mailbox: &MailboxConfig, folder: &str) -> Vec<DiagnosisStep> {
        let mailbox = mailbox.clone();
        let folder = folder.to_string();
        let timeout = self.io_timeout;
        let report = run_blocking(move || {
            let session = ImapSession::connect(&mailbox.host, mailbox.port, mailbox.ssl, timeout);
            Ok(diagnose_session(session, &mailbox, &folder))
        })
        .await;
        report.unwrap_or_else(|e| {
            vec![DiagnosisStep::failed(
                STEP_FOLDER,
                e.to_string(),
                "Diagnosis could not run; try again.",
            )]
        })
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, MailError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MailError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MailError::Protocol(format!("IMAP task failed: {e}")))?
}

fn open_folder(
    mailbox: &MailboxConfig,
    folder: &str,
    timeout: Duration,
) -> Result<(ImapSession, FolderStatus), MailError> {
    let mut session = ImapSession::connect(&mailbox.host, mailbox.port, mailbox.ssl, timeout)?;
    session.login(&mailbox.username, mailbox.password.expose_secret())?;

    if mailbox.requires_id_handshake()
        && let Err(e) = session.id("mail-alert", env!("CARGO_PKG_VERSION"), "mail-alert")
    {
        warn!(mailbox_id = mailbox.id, error = %e, "IMAP ID command rejected");
    }

    let status = session.examine(folder)?;
    Ok((session, status))
}

fn fetch_in_session(
    session: &mut ImapSession,
    mailbox: &MailboxConfig,
    query: &FetchQuery,
    status: FolderStatus,
) -> Result<FetchBatch, MailError> {
    let mut batch = FetchBatch {
        messages: Vec::new(),
        max_uid: query.last_uid,
    };
    if status.exists == 0 {
        return Ok(batch);
    }

    let uids = if mailbox.requires_fetch_fallback() {
        scan_by_date(session, query, status)?
    } else {
        search_candidates(session, query, status)?
    };
    if uids.is_empty() {
        return Ok(batch);
    }
    debug!(mailbox_id = mailbox.id, candidates = uids.len(), "Fetching candidate messages");

    let set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    for item in session.uid_fetch(&set, FETCH_ITEMS)? {
        if item.uid <= query.last_uid {
            continue;
        }
        batch.max_uid = batch.max_uid.max(item.uid);
        let msg = build_message(item);
        if msg.received_after(&query.since) {
            batch.messages.push(msg);
        }
    }
    Ok(batch)
}

/// UID range above `last_uid`, or `None` when the folder has nothing newer.
fn uid_range(last_uid: u32, status: FolderStatus) -> Option<String> {
    let first = last_uid.saturating_add(1);
    match status.uid_next {
        Some(next) if next <= first => None,
        Some(next) => Some(format!("{first}:{}", next - 1)),
        None => Some(format!("{first}:*")),
    }
}

fn search_candidates(
    session: &mut ImapSession,
    query: &FetchQuery,
    status: FolderStatus,
) -> Result<Vec<u32>, MailError> {
    let mut criteria = Vec::new();
    if query.last_uid > 0 {
        let Some(range) = uid_range(query.last_uid, status) else {
            return Ok(Vec::new());
        };
        criteria.push(format!("UID {range}"));
    }
    criteria.push(format!("SINCE {}", query.since.format("%d-%b-%Y")));
    if query.only_unread {
        criteria.push("UNSEEN".to_string());
    }

    let mut uids = session.uid_search(&criteria.join(" "))?;
    uids.retain(|uid| *uid > query.last_uid);
    Ok(uids)
}

/// Client-side date filter for servers whose `SEARCH` misses new mail.
fn scan_by_date(
    session: &mut ImapSession,
    query: &FetchQuery,
    status: FolderStatus,
) -> Result<Vec<u32>, MailError> {
    let Some(range) = uid_range(query.last_uid, status) else {
        return Ok(Vec::new());
    };
    let items = session.uid_fetch(&range, DATE_SCAN_ITEMS)?;
    Ok(items
        .into_iter()
        .filter(|item| item.uid > query.last_uid)
        .filter(|item| !query.only_unread || !item.is_seen())
        .filter(|item| {
            header_date(&item.body)
                .or(item.internal_date)
                .is_some_and(|d| d > query.since)
        })
        .map(|item| item.uid)
        .collect())
}

/// In-memory transport replaying a canned server conversation.
#[cfg(test)]
pub(crate) mod script {
    use std::io::Cursor;
    use std::sync::Mutex;

    use super::*;

    pub(crate) struct Scripted {
        pub(crate) input: Cursor<Vec<u8>>,
        pub(crate) written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn scripted(server: &str) -> (ImapSession, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let transport = Scripted {
            input: Cursor::new(server.as_bytes().to_vec()),
            written: written.clone(),
        };
        let session = ImapSession::handshake(Box::new(transport)).unwrap();
        (session, written)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;

    use super::script::{Scripted, scripted};
    use super::*;

    #[test]
    fn full_check_conversation() {
        let server = "* OK IMAP ready\r\n\
A1 OK LOGIN completed\r\n\
* 3 EXISTS\r\n\
* OK [UIDNEXT 42] predicted\r\n\
A2 OK [READ-ONLY] EXAMINE completed\r\n\
* SEARCH 40 38 41\r\n\
A3 OK SEARCH completed\r\n\
* 1 FETCH (UID 41 FLAGS (\\Seen \\Answered) RFC822.SIZE 20 INTERNALDATE \" 2-Jan-2024 10:00:00 +0000\" BODY[] {20}\r\n\
Subject: hi\r\n\r\nbody!)\r\n\
A4 OK FETCH completed\r\n";
        let (mut session, written) = scripted(server);

        session.login("ops", "pa\"ss").unwrap();
        let status = session.examine("INBOX").unwrap();
        assert_eq!(
            status,
            FolderStatus {
                exists: 3,
                uid_next: Some(42)
            }
        );
        assert_eq!(session.uid_search("SINCE 01-Jan-2024").unwrap(), vec![38, 40, 41]);

        let items = session.uid_fetch("41", FETCH_ITEMS).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.uid, 41);
        assert!(item.is_seen());
        assert_eq!(item.flags, vec!["\\Seen", "\\Answered"]);
        assert_eq!(item.size, 20);
        assert_eq!(item.body, b"Subject: hi\r\n\r\nbody!");
        let date = item.internal_date.unwrap();
        assert_eq!(date.format("%Y-%m-%d %H:%M").to_string(), "2024-01-02 18:00");

        let sent = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert!(sent.contains("A1 LOGIN \"ops\" \"pa\\\"ss\"\r\n"));
        assert!(sent.contains("A2 EXAMINE \"INBOX\"\r\n"));
        assert!(sent.contains("A4 UID FETCH 41 (UID FLAGS"));
    }

    #[test]
    fn rejected_login_is_auth_failure() {
        let (mut session, _) = scripted("* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] bad\r\n");
        let err = session.login("ops", "wrong").unwrap_err();
        assert!(matches!(err, MailError::AuthFailed { ref username, .. } if username == "ops"));
    }

    #[test]
    fn closed_connection_is_reported() {
        let (mut session, _) = scripted("* OK ready\r\n");
        assert!(matches!(session.examine("INBOX"), Err(MailError::Closed)));
    }

    #[test]
    fn bad_greeting_is_protocol_error() {
        let transport = Scripted {
            input: Cursor::new(b"* BYE go away\r\n".to_vec()),
            written: Arc::new(Mutex::new(Vec::new())),
        };
        assert!(matches!(
            ImapSession::handshake(Box::new(transport)),
            Err(MailError::Protocol(_))
        ));
    }

    #[test]
    fn uid_range_respects_uidnext() {
        let status = |uid_next| FolderStatus {
            exists: 5,
            uid_next,
        };
        assert_eq!(uid_range(0, status(Some(10))).as_deref(), Some("1:9"));
        assert_eq!(uid_range(7, status(Some(10))).as_deref(), Some("8:9"));
        assert_eq!(uid_range(9, status(Some(10))), None);
        assert_eq!(uid_range(3, status(None)).as_deref(), Some("4:*"));
    }

    #[test]
    fn header_date_strips_comment() {
        let date = header_date(b"Date: Tue, 02 Jan 2024 10:00:00 +0000 (UTC)\r\n\r\n").unwrap();
        assert_eq!(date.format("%H:%M").to_string(), "18:00");
        assert!(header_date(b"\r\n").is_none());
    }

    #[test]
    fn command_name_hides_arguments() {
        assert_eq!(command_name("LOGIN \"u\" \"secret\""), "LOGIN");
        assert_eq!(command_name("UID FETCH 1:* (UID)"), "UID FETCH");
    }

    #[test]
    fn build_message_falls_back_to_internal_date_and_envelope() {
        let internal = parse_internal_date("02-Jan-2024 10:00:00 +0000");
        let msg = build_message(FetchItem {
            uid: 7,
            internal_date: internal,
            body: b"Subject: empty\r\n\r\n".to_vec(),
            ..Default::default()
        });
        assert_eq!(msg.uid, 7);
        assert_eq!(msg.subject, "empty");
        assert_eq!(msg.received_at, internal);
        assert!(msg.content.contains("Subject: empty"));
        assert!(msg.content.contains("[message body unavailable]"));
    }
}
