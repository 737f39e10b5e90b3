//! Mail Alert: watches IMAP mailboxes, matches incoming mail against rule
//! groups and fans alerts out to notification channels.

pub mod alerts;
pub mod config;
pub mod error;
pub mod logs;
pub mod mail;
pub mod monitor;
pub mod notify;
pub mod rules;
pub mod service;
pub mod store;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use service::MonitorService;
