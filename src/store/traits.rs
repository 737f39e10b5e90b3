//! Unified `Database` trait: single async interface for all persistence.
//!
//! Mailboxes, rule groups, channels and templates are owned by the operator
//! surface; the pipeline reads them and writes only alerts and notification logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alerts::model::{Alert, AlertCounts, AlertStatus, CompositeKey};
use crate::error::DatabaseError;
use crate::mail::MailboxConfig;
use crate::notify::model::{Channel, LogStats, LogStatus, NotificationLog, Template};
use crate::rules::RuleGroup;

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    /// Insert or replace a mailbox by id.
    async fn save_mailbox(&self, mailbox: &MailboxConfig) -> Result<(), DatabaseError>;

    async fn get_mailbox(&self, id: i64) -> Result<Option<MailboxConfig>, DatabaseError>;

    async fn list_active_mailboxes(&self) -> Result<Vec<MailboxConfig>, DatabaseError>;

    // ── Rule groups ─────────────────────────────────────────────────

    /// Insert or replace a rule group and all of its conditions.
    async fn save_rule_group(&self, group: &RuleGroup) -> Result<(), DatabaseError>;

    /// Active rule groups of a mailbox with their conditions, in no particular order.
    async fn list_rule_groups_for_mailbox(
        &self,
        mailbox_id: i64,
    ) -> Result<Vec<RuleGroup>, DatabaseError>;

    // ── Channels & templates ────────────────────────────────────────

    /// Insert or replace a channel by id.
    async fn save_channel(&self, channel: &Channel) -> Result<(), DatabaseError>;

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>, DatabaseError>;

    /// Associate a channel with a rule group.
    async fn link_rule_group_channel(
        &self,
        rule_group_id: i64,
        channel_id: i64,
        priority: i32,
    ) -> Result<(), DatabaseError>;

    /// Associate a channel with a pre-rule-group rule.
    async fn link_rule_channel(
        &self,
        rule_id: i64,
        channel_id: i64,
        priority: i32,
    ) -> Result<(), DatabaseError>;

    /// Channels bound to a rule group, in association priority order.
    async fn channels_for_rule_group(&self, rule_group_id: i64)
    -> Result<Vec<Channel>, DatabaseError>;

    /// Channels bound to a pre-rule-group rule, in association priority order.
    async fn channels_for_rule(&self, rule_id: i64) -> Result<Vec<Channel>, DatabaseError>;

    /// Insert or replace a template by id.
    async fn save_template(&self, template: &Template) -> Result<(), DatabaseError>;

    async fn get_template(&self, id: i64) -> Result<Option<Template>, DatabaseError>;

    /// The active default template for a channel family, if any.
    async fn default_template(&self, kind: &str) -> Result<Option<Template>, DatabaseError>;

    /// Insert `template` as its family default unless that family already has one.
    /// The id is assigned by the store. Returns whether a row was written.
    async fn insert_default_template(&self, template: &Template) -> Result<bool, DatabaseError>;

    // ── Alerts ──────────────────────────────────────────────────────

    /// Insert a new alert. A duplicate message-id or composite key is a `Constraint` error.
    async fn insert_alert(&self, alert: &Alert) -> Result<(), DatabaseError>;

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, DatabaseError>;

    async fn alert_exists_by_message_id(&self, message_id: &str) -> Result<bool, DatabaseError>;

    async fn alert_exists_by_composite_key(&self, key: &CompositeKey)
    -> Result<bool, DatabaseError>;

    /// Record a dispatch outcome.
    async fn update_alert_status(
        &self,
        id: Uuid,
        status: AlertStatus,
        sent_channels: &[String],
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Back to pending for a manual retry: bumps `retry_count` and clears the error.
    async fn reset_alert_for_retry(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Oldest pending alerts first.
    async fn list_pending_alerts(&self, limit: usize) -> Result<Vec<Alert>, DatabaseError>;

    /// Alerts created since `since`, plus overall pending and failed counts.
    async fn alert_counts(&self, since: DateTime<Utc>) -> Result<AlertCounts, DatabaseError>;

    // ── Notification logs ───────────────────────────────────────────

    async fn insert_notification_log(&self, log: &NotificationLog) -> Result<(), DatabaseError>;

    /// Record a send result; `sent_at` is set to now.
    async fn update_log_result(
        &self,
        id: Uuid,
        status: LogStatus,
        error: Option<&str>,
        response: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn increment_log_retry(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Failed logs with `retry_count < max_retry_count`, oldest first.
    async fn list_failed_logs(
        &self,
        max_retry_count: u32,
        limit: usize,
    ) -> Result<Vec<NotificationLog>, DatabaseError>;

    async fn list_logs_for_alert(&self, alert_id: Uuid)
    -> Result<Vec<NotificationLog>, DatabaseError>;

    /// Log counts by status for logs created since `since`.
    async fn log_stats_since(&self, since: DateTime<Utc>) -> Result<LogStats, DatabaseError>;
}
