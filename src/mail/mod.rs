//! Mailbox access and message decoding.

pub mod diagnosis;
pub mod imap;
pub mod parser;
pub mod types;

pub use diagnosis::DiagnosisStep;
pub use imap::{FetchBatch, FetchQuery, ImapFetcher, MailFetcher};
pub use parser::{ParsedMail, html_to_text, parse_message};
pub use types::{EmailMessage, MailboxConfig, MailboxStatus, reference_now};
