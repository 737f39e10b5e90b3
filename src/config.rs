//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Mailbox monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between checks of one mailbox.
    pub check_interval: Duration,
    /// Retries per failed check before waiting for the next tick.
    pub max_retries: u32,
    /// Folder selected on every check.
    pub folder: String,
    /// Add `UNSEEN` to the server-side search.
    pub only_unread: bool,
    /// Upper bound on how long `stop` waits for mailbox loops.
    pub stop_timeout: Duration,
    /// Socket read timeout for IMAP sessions.
    pub io_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_retries: 3,
            folder: "INBOX".to_string(),
            only_unread: false,
            stop_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// Notification dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Notification logs at or above this retry count are left alone.
    pub max_retry_count: u32,
    /// Interval of the failed-notification sweep.
    pub retry_interval: Duration,
    /// Interval of the pending-alert sweep.
    pub pending_interval: Duration,
    /// Number of queue workers, also the pending sweep concurrency.
    pub max_workers: usize,
    /// Pending alerts reprocessed per sweep.
    pub batch_size: usize,
    /// Capacity of the alert intake queue.
    pub alert_queue_capacity: usize,
    /// Capacity of the retry queue.
    pub retry_queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            retry_interval: Duration::from_secs(300), // 5 minutes
            pending_interval: Duration::from_secs(60), // 1 minute
            max_workers: 10,
            batch_size: 50,
            alert_queue_capacity: 100,
            retry_queue_capacity: 100,
        }
    }
}

/// Values exposed to notification templates under `system`.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub app_name: String,
    pub app_version: String,
    pub server_name: String,
    pub environment: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            app_name: "Mail Alert".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            server_name: "localhost".to_string(),
            environment: "production".to_string(),
        }
    }
}

/// Application configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub monitor: MonitorConfig,
    pub dispatcher: DispatcherConfig,
    pub system: SystemInfo,
}

impl AppConfig {
    /// Build config from `MAIL_ALERT_*` environment variables.
    ///
    /// Unset variables fall back to defaults; set but unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let monitor_defaults = MonitorConfig::default();
        let dispatcher_defaults = DispatcherConfig::default();
        let system_defaults = SystemInfo::default();

        let db_path = std::env::var("MAIL_ALERT_DB_PATH")
            .unwrap_or_else(|_| "./data/mail-alert.db".to_string());

        let monitor = MonitorConfig {
            check_interval: Duration::from_secs(env_parse(
                "MAIL_ALERT_CHECK_INTERVAL_SECS",
                monitor_defaults.check_interval.as_secs(),
            )?),
            max_retries: env_parse("MAIL_ALERT_MAX_RETRIES", monitor_defaults.max_retries)?,
            folder: std::env::var("MAIL_ALERT_FOLDER").unwrap_or(monitor_defaults.folder),
            only_unread: env_parse("MAIL_ALERT_ONLY_UNREAD", monitor_defaults.only_unread)?,
            ..monitor_defaults
        };

        let queue_capacity = env_parse(
            "MAIL_ALERT_QUEUE_CAPACITY",
            dispatcher_defaults.alert_queue_capacity,
        )?;
        let dispatcher = DispatcherConfig {
            max_retry_count: env_parse(
                "MAIL_ALERT_MAX_RETRY_COUNT",
                dispatcher_defaults.max_retry_count,
            )?,
            retry_interval: Duration::from_secs(env_parse(
                "MAIL_ALERT_RETRY_INTERVAL_SECS",
                dispatcher_defaults.retry_interval.as_secs(),
            )?),
            pending_interval: Duration::from_secs(env_parse(
                "MAIL_ALERT_PENDING_INTERVAL_SECS",
                dispatcher_defaults.pending_interval.as_secs(),
            )?),
            max_workers: env_parse("MAIL_ALERT_MAX_WORKERS", dispatcher_defaults.max_workers)?,
            batch_size: env_parse("MAIL_ALERT_BATCH_SIZE", dispatcher_defaults.batch_size)?,
            alert_queue_capacity: queue_capacity,
            retry_queue_capacity: queue_capacity,
        };

        if monitor.check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_ALERT_CHECK_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if dispatcher.max_workers == 0 || dispatcher.alert_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_ALERT_MAX_WORKERS / MAIL_ALERT_QUEUE_CAPACITY".into(),
                message: "must be greater than zero".into(),
            });
        }

        let system = SystemInfo {
            app_name: std::env::var("MAIL_ALERT_APP_NAME").unwrap_or(system_defaults.app_name),
            server_name: std::env::var("MAIL_ALERT_SERVER_NAME")
                .unwrap_or(system_defaults.server_name),
            environment: std::env::var("MAIL_ALERT_ENVIRONMENT")
                .unwrap_or(system_defaults.environment),
            ..system_defaults
        };

        Ok(Self {
            db_path: PathBuf::from(db_path),
            monitor,
            dispatcher,
            system,
        })
    }
}

/// Read and parse one environment variable, falling back to `default` when unset.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{raw:?}: {e}"),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let m = MonitorConfig::default();
        assert_eq!(m.check_interval, Duration::from_secs(30));
        assert_eq!(m.max_retries, 3);
        assert_eq!(m.folder, "INBOX");
        assert_eq!(m.stop_timeout, Duration::from_secs(10));

        let d = DispatcherConfig::default();
        assert_eq!(d.max_retry_count, 3);
        assert_eq!(d.retry_interval, Duration::from_secs(300));
        assert_eq!(d.max_workers, 10);
        assert_eq!(d.batch_size, 50);
        assert_eq!(d.alert_queue_capacity, 100);
        assert_eq!(d.retry_queue_capacity, 100);
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let v: u64 = env_parse("MAIL_ALERT_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(v, 42);
    }
}
