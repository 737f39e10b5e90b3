//! Mailbox diagnosis: connect, authenticate and open the watched folder on one
//! session, reporting each step with a hint for the operator.

use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, warn};

use super::imap::ImapSession;
use super::types::MailboxConfig;
use crate::error::MailError;

pub const STEP_CONNECT: &str = "connect";
pub const STEP_AUTH: &str = "authenticate";
pub const STEP_FOLDER: &str = "folder access";
pub const STEP_PROVIDER: &str = "provider settings";

/// Outcome of one diagnosis step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosisStep {
    pub step: &'static str,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl DiagnosisStep {
    pub fn ok(step: &'static str, message: String) -> Self {
        Self {
            step,
            success: true,
            message,
            suggestion: None,
        }
    }

    pub fn failed(step: &'static str, message: String, suggestion: &str) -> Self {
        Self {
            step,
            success: false,
            message,
            suggestion: Some(suggestion.to_string()),
        }
    }
}

/// Walk the checks on `session`, stopping at the first failure.
/// Provider settings are appended whenever the host is a known provider.
pub fn diagnose_session(
    session: Result<ImapSession, MailError>,
    mailbox: &MailboxConfig,
    folder: &str,
) -> Vec<DiagnosisStep> {
    let mut steps = Vec::new();
    let addr = format!("{}:{}", mailbox.host, mailbox.port);

    match session {
        Ok(mut session) => {
            steps.push(DiagnosisStep::ok(STEP_CONNECT, format!("Connected to {addr}")));
            run_session_checks(&mut session, mailbox, folder, &mut steps);
            session.logout();
        }
        Err(e) => steps.push(DiagnosisStep::failed(
            STEP_CONNECT,
            format!("Cannot connect to {addr}: {e}"),
            "Check the server address, port, SSL setting and network access.",
        )),
    }

    if let Some(hint) = provider_suggestion(&mailbox.host) {
        steps.push(DiagnosisStep {
            step: STEP_PROVIDER,
            success: true,
            message: "Recommended settings for this provider".to_string(),
            suggestion: Some(hint),
        });
    }
    steps
}

fn run_session_checks(
    session: &mut ImapSession,
    mailbox: &MailboxConfig,
    folder: &str,
    steps: &mut Vec<DiagnosisStep>,
) {
    if let Err(e) = session.login(&mailbox.username, mailbox.password.expose_secret()) {
        steps.push(DiagnosisStep::failed(
            STEP_AUTH,
            format!("Authentication failed: {e}"),
            auth_suggestion(&e),
        ));
        return;
    }
    steps.push(DiagnosisStep::ok(STEP_AUTH, "Authenticated".to_string()));

    if mailbox.requires_id_handshake()
        && let Err(e) = session.id("mail-alert", env!("CARGO_PKG_VERSION"), "mail-alert")
    {
        warn!(mailbox_id = mailbox.id, error = %e, "IMAP ID command rejected");
    }

    match session.examine(folder) {
        Ok(status) => {
            debug!(mailbox_id = mailbox.id, exists = status.exists, "Diagnosis folder opened");
            steps.push(DiagnosisStep::ok(
                STEP_FOLDER,
                format!("Opened {folder} ({} messages); monitoring should work", status.exists),
            ));
        }
        Err(e) => steps.push(DiagnosisStep::failed(
            STEP_FOLDER,
            format!("Cannot open {folder}: {e}"),
            folder_suggestion(&e),
        )),
    }
}

fn auth_suggestion(err: &MailError) -> &'static str {
    if err.to_string().to_ascii_lowercase().contains("auth") {
        "Authentication rejected. 126/163/QQ/Gmail accounts usually need an authorization code or app password instead of the login password."
    } else {
        "Check the username and password."
    }
}

fn folder_suggestion(err: &MailError) -> &'static str {
    let reason = err.to_string().to_ascii_lowercase();
    if reason.contains("unsafe login") {
        "Server reported 'Unsafe Login': enable IMAP in the mailbox settings, use an authorization code as the password, and review the account security settings."
    } else if reason.contains("auth") {
        "Insufficient permission. Check the mailbox IMAP access settings."
    } else {
        "Cannot open the folder. Check the folder name and the mailbox settings."
    }
}

/// Setup steps for the common providers, keyed on the IMAP host.
pub fn provider_suggestion(host: &str) -> Option<String> {
    let host = host.to_ascii_lowercase();
    let (name, steps): (&str, &[&str]) = if host.contains("126.com") {
        (
            "126 Mail",
            &[
                "Sign in to the web mailbox",
                "Open Settings > POP3/SMTP/IMAP",
                "Enable the IMAP/SMTP service",
                "Use the authorization code as the password",
                "Server imap.126.com, port 993, SSL on",
            ],
        )
    } else if host.contains("163.com") {
        (
            "163 Mail",
            &[
                "Sign in to the web mailbox",
                "Open Settings > POP3/SMTP/IMAP",
                "Enable the IMAP/SMTP service",
                "Use the authorization code as the password",
                "Server imap.163.com, port 993, SSL on",
            ],
        )
    } else if host.contains("qq.com") {
        (
            "QQ Mail",
            &[
                "Sign in to the web mailbox",
                "Open Settings > Account",
                "Enable the IMAP/SMTP service",
                "Generate an authorization code and use it as the password",
                "Server imap.qq.com, port 993, SSL on",
            ],
        )
    } else if host.contains("gmail.com") {
        (
            "Gmail",
            &[
                "Turn on 2-step verification",
                "Create an app password",
                "Use the app password instead of the account password",
                "Server imap.gmail.com, port 993, SSL on",
            ],
        )
    } else {
        return None;
    };

    let mut out = format!("{name} setup:");
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("\n{}. {step}", i + 1));
    }
    Some(out)
}
