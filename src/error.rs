//! Error types for mail-alert.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// IMAP transport and mailbox access errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error for {host}: {reason}")]
    Tls { host: String, reason: String },

    #[error("Login failed for {username}: {reason}")]
    AuthFailed { username: String, reason: String },

    #[error("Cannot access folder {folder}: {reason}")]
    FolderAccess { folder: String, reason: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IMAP connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rule evaluation errors. These are configuration faults, never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid regex {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("Unsupported {what}: {value}")]
    Unsupported { what: String, value: String },
}

/// Notification channel errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid {kind} channel configuration: {reason}")]
    InvalidConfig { kind: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("{provider} API error {code}: {message}")]
    Api {
        provider: String,
        code: i64,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Channel {0} is inactive")]
    Inactive(String),
}

/// Notification dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Alert {0} not found")]
    AlertNotFound(Uuid),

    #[error("Alert {id} delivery failed: {reason}")]
    DeliveryFailed { id: Uuid, reason: String },

    #[error("Failed to resolve channels for alert {id}: {reason}")]
    ChannelLookup { id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Mailbox monitor lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Monitor did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("Mailbox {id} check failed: {reason}")]
    CheckFailed { id: i64, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
