//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::model::{Alert, AlertCounts, AlertStatus, CompositeKey, hour_bucket};
use crate::error::DatabaseError;
use crate::mail::types::to_reference;
use crate::mail::{MailboxConfig, MailboxStatus};
use crate::notify::model::{
    Channel, ChannelKind, ChannelStatus, LogStats, LogStatus, NotificationLog, Template,
};
use crate::rules::{MatchCondition, RuleGroup, RuleStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_channels(
        &self,
        sql: &str,
        owner_id: i64,
        op: &str,
    ) -> Result<Vec<Channel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![owner_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut channels = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_channel(&row) {
                Ok(channel) => channels.push(channel),
                Err(e) => warn!("Skipping channel row: {e}"),
            }
        }
        Ok(channels)
    }

    async fn conditions_for_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<MatchCondition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONDITION_COLUMNS} FROM match_conditions WHERE rule_group_id = ?1 ORDER BY priority DESC, id ASC"
                ),
                params![group_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conditions_for_group: {e}")))?;

        let mut conditions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            conditions.push(row_to_condition(&row)?);
        }
        Ok(conditions)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Receive times keep the reference offset.
fn parse_received(s: &str) -> DateTime<FixedOffset> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => to_reference(&dt),
        Err(_) => to_reference(&parse_datetime(s)),
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

/// Distinguish uniqueness violations from other write failures.
fn write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const MAILBOX_COLUMNS: &str = "id, name, email, host, port, username, password, protocol, ssl, status";

const GROUP_COLUMNS: &str = "id, name, mailbox_id, logic, priority, status";

const CONDITION_COLUMNS: &str =
    "id, rule_group_id, field, operator, keywords, keyword_logic, priority, status";

const CHANNEL_COLUMNS: &str = "c.id, c.name, c.kind, c.config, c.status, c.template_id";

const TEMPLATE_COLUMNS: &str = "id, name, kind, subject, content, is_default, status";

const ALERT_COLUMNS: &str = "id, mailbox_id, rule_group_id, rule_id, uid, subject, sender, content, message_id, received_at, status, retry_count, sent_channels, error, created_at, updated_at";

const LOG_COLUMNS: &str =
    "id, channel_id, alert_id, content, status, error, response, sent_at, retry_count, created_at";

fn row_to_mailbox(row: &libsql::Row) -> Result<MailboxConfig, libsql::Error> {
    let port: i64 = row.get(4)?;
    let password: String = row.get(6)?;
    let ssl: i64 = row.get(8)?;
    let status: String = row.get(9)?;
    Ok(MailboxConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        host: row.get(3)?,
        port: u16::try_from(port).unwrap_or(993),
        username: row.get(5)?,
        password: SecretString::from(password),
        protocol: row.get(7)?,
        ssl: ssl != 0,
        status: MailboxStatus::parse(&status),
    })
}

fn row_to_group(row: &libsql::Row) -> Result<RuleGroup, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("rule group row parse: {e}"));
    let logic: String = row.get(3).map_err(parse)?;
    let status: String = row.get(5).map_err(parse)?;
    Ok(RuleGroup {
        id: row.get(0).map_err(parse)?,
        name: row.get(1).map_err(parse)?,
        mailbox_id: row.get(2).map_err(parse)?,
        logic: logic
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("rule group logic: {e}")))?,
        priority: row.get::<i64>(4).map_err(parse)? as i32,
        status: RuleStatus::parse(&status),
        conditions: Vec::new(),
    })
}

fn row_to_condition(row: &libsql::Row) -> Result<MatchCondition, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("condition row parse: {e}"));
    let invalid = |e: crate::error::RuleError| DatabaseError::Serialization(e.to_string());
    let field: String = row.get(2).map_err(parse)?;
    let operator: String = row.get(3).map_err(parse)?;
    let keyword_logic: String = row.get(5).map_err(parse)?;
    let status: String = row.get(7).map_err(parse)?;
    Ok(MatchCondition {
        id: row.get(0).map_err(parse)?,
        rule_group_id: row.get(1).map_err(parse)?,
        field: field.parse().map_err(invalid)?,
        operator: operator.parse().map_err(invalid)?,
        keywords: row.get(4).map_err(parse)?,
        keyword_logic: keyword_logic.parse().map_err(invalid)?,
        priority: row.get::<i64>(6).map_err(parse)? as i32,
        status: RuleStatus::parse(&status),
    })
}

fn row_to_channel(row: &libsql::Row) -> Result<Channel, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("channel row parse: {e}"));
    let kind: String = row.get(2).map_err(parse)?;
    let config: String = row.get(3).map_err(parse)?;
    let status: String = row.get(4).map_err(parse)?;
    Ok(Channel {
        id: row.get(0).map_err(parse)?,
        name: row.get(1).map_err(parse)?,
        kind: ChannelKind::resolve(&kind, &config)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        config,
        status: ChannelStatus::parse(&status),
        template_id: row.get(5).ok(),
    })
}

fn row_to_template(row: &libsql::Row) -> Result<Template, libsql::Error> {
    let is_default: i64 = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        subject: row.get(3)?,
        content: row.get(4)?,
        is_default: is_default != 0,
        status: ChannelStatus::parse(&status),
    })
}

/// Column order matches ALERT_COLUMNS.
fn row_to_alert(row: &libsql::Row) -> Result<Alert, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("alert row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let uid: i64 = row.get(4).map_err(parse)?;
    let received: String = row.get(9).map_err(parse)?;
    let status: String = row.get(10).map_err(parse)?;
    let retry_count: i64 = row.get(11).map_err(parse)?;
    let sent_channels: String = row.get(12).map_err(parse)?;
    let created: String = row.get(14).map_err(parse)?;
    let updated: String = row.get(15).map_err(parse)?;

    Ok(Alert {
        id: parse_uuid(&id)?,
        mailbox_id: row.get(1).map_err(parse)?,
        rule_group_id: row.get(2).ok(),
        rule_id: row.get(3).ok(),
        uid: u32::try_from(uid).unwrap_or_default(),
        subject: row.get(5).map_err(parse)?,
        sender: row.get(6).map_err(parse)?,
        content: row.get(7).map_err(parse)?,
        message_id: row.get(8).map_err(parse)?,
        received_at: parse_received(&received),
        status: AlertStatus::parse(&status),
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        sent_channels: sent_channels
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        error: row.get(13).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Column order matches LOG_COLUMNS.
fn row_to_log(row: &libsql::Row) -> Result<NotificationLog, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("log row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let alert_id: String = row.get(2).map_err(parse)?;
    let status: String = row.get(4).map_err(parse)?;
    let sent_at: Option<String> = row.get(7).ok();
    let retry_count: i64 = row.get(8).map_err(parse)?;
    let created: String = row.get(9).map_err(parse)?;

    Ok(NotificationLog {
        id: parse_uuid(&id)?,
        channel_id: row.get(1).map_err(parse)?,
        alert_id: parse_uuid(&alert_id)?,
        content: row.get(3).map_err(parse)?,
        status: LogStatus::parse(&status),
        error: row.get(5).ok(),
        response: row.get(6).ok(),
        sent_at: sent_at.as_deref().map(parse_datetime),
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        created_at: parse_datetime(&created),
    })
}

async fn count_row(rows: &mut libsql::Rows, op: &str) -> Result<Vec<u64>, DatabaseError> {
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
    let Some(row) = row else {
        return Ok(Vec::new());
    };
    let mut counts = Vec::new();
    for i in 0..row.column_count() {
        let n: i64 = row.get(i).unwrap_or(0);
        counts.push(u64::try_from(n).unwrap_or(0));
    }
    Ok(counts)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn save_mailbox(&self, mailbox: &MailboxConfig) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT OR REPLACE INTO mailboxes ({MAILBOX_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    mailbox.id,
                    mailbox.name.clone(),
                    mailbox.email.clone(),
                    mailbox.host.clone(),
                    i64::from(mailbox.port),
                    mailbox.username.clone(),
                    mailbox.password.expose_secret().to_string(),
                    mailbox.protocol.clone(),
                    i64::from(mailbox.ssl),
                    mailbox.status.as_str(),
                ],
            )
            .await
            .map_err(|e| write_err("save_mailbox", e))?;
        Ok(())
    }

    async fn get_mailbox(&self, id: i64) -> Result<Option<MailboxConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_mailbox: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_mailbox(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_mailbox row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_mailbox: {e}"))),
        }
    }

    async fn list_active_mailboxes(&self) -> Result<Vec<MailboxConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE status = 'active' ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_mailboxes: {e}")))?;

        let mut mailboxes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_mailbox(&row) {
                Ok(mailbox) => mailboxes.push(mailbox),
                Err(e) => warn!("Skipping mailbox row: {e}"),
            }
        }
        Ok(mailboxes)
    }

    // ── Rule groups ─────────────────────────────────────────────────

    async fn save_rule_group(&self, group: &RuleGroup) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!("INSERT OR REPLACE INTO rule_groups ({GROUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                group.id,
                group.name.clone(),
                group.mailbox_id,
                group.logic.as_str(),
                i64::from(group.priority),
                group.status.as_str(),
            ],
        )
        .await
        .map_err(|e| write_err("save_rule_group", e))?;

        conn.execute(
            "DELETE FROM match_conditions WHERE rule_group_id = ?1",
            params![group.id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_rule_group conditions: {e}")))?;

        for c in &group.conditions {
            conn.execute(
                &format!("INSERT OR REPLACE INTO match_conditions ({CONDITION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    c.id,
                    group.id,
                    c.field.as_str(),
                    c.operator.as_str(),
                    c.keywords.clone(),
                    c.keyword_logic.as_str(),
                    i64::from(c.priority),
                    c.status.as_str(),
                ],
            )
            .await
            .map_err(|e| write_err("save_rule_group condition", e))?;
        }
        Ok(())
    }

    async fn list_rule_groups_for_mailbox(
        &self,
        mailbox_id: i64,
    ) -> Result<Vec<RuleGroup>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM rule_groups WHERE mailbox_id = ?1 AND status = 'active'"),
                params![mailbox_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rule_groups_for_mailbox: {e}")))?;

        let mut groups = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_group(&row) {
                Ok(group) => groups.push(group),
                Err(e) => warn!(mailbox_id, "Skipping rule group row: {e}"),
            }
        }

        let mut loaded = Vec::with_capacity(groups.len());
        for mut group in groups {
            match self.conditions_for_group(group.id).await {
                Ok(conditions) => {
                    group.conditions = conditions;
                    loaded.push(group);
                }
                // A group with an unreadable condition would evaluate differently; drop it.
                Err(e) => warn!(group_id = group.id, "Skipping rule group: {e}"),
            }
        }
        Ok(loaded)
    }

    // ── Channels & templates ────────────────────────────────────────

    async fn save_channel(&self, channel: &Channel) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO channels (id, name, kind, config, status, template_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    channel.id,
                    channel.name.clone(),
                    channel.kind.as_str(),
                    channel.config.clone(),
                    channel.status.as_str(),
                    opt_int(channel.template_id),
                ],
            )
            .await
            .map_err(|e| write_err("save_channel", e))?;
        Ok(())
    }

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_channel: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_channel(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_channel: {e}"))),
        }
    }

    async fn link_rule_group_channel(
        &self,
        rule_group_id: i64,
        channel_id: i64,
        priority: i32,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO rule_group_channels (rule_group_id, channel_id, priority) VALUES (?1, ?2, ?3)",
                params![rule_group_id, channel_id, i64::from(priority)],
            )
            .await
            .map_err(|e| write_err("link_rule_group_channel", e))?;
        Ok(())
    }

    async fn link_rule_channel(
        &self,
        rule_id: i64,
        channel_id: i64,
        priority: i32,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO rule_channels (rule_id, channel_id, priority) VALUES (?1, ?2, ?3)",
                params![rule_id, channel_id, i64::from(priority)],
            )
            .await
            .map_err(|e| write_err("link_rule_channel", e))?;
        Ok(())
    }

    async fn channels_for_rule_group(
        &self,
        rule_group_id: i64,
    ) -> Result<Vec<Channel>, DatabaseError> {
        self.query_channels(
            &format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c JOIN rule_group_channels l ON l.channel_id = c.id WHERE l.rule_group_id = ?1 ORDER BY l.priority ASC, c.id ASC"
            ),
            rule_group_id,
            "channels_for_rule_group",
        )
        .await
    }

    async fn channels_for_rule(&self, rule_id: i64) -> Result<Vec<Channel>, DatabaseError> {
        self.query_channels(
            &format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c JOIN rule_channels l ON l.channel_id = c.id WHERE l.rule_id = ?1 ORDER BY l.priority ASC, c.id ASC"
            ),
            rule_id,
            "channels_for_rule",
        )
        .await
    }

    async fn save_template(&self, template: &Template) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT OR REPLACE INTO templates ({TEMPLATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    template.id,
                    template.name.clone(),
                    template.kind.clone(),
                    template.subject.clone(),
                    template.content.clone(),
                    i64::from(template.is_default),
                    template.status.as_str(),
                ],
            )
            .await
            .map_err(|e| write_err("save_template", e))?;
        Ok(())
    }

    async fn get_template(&self, id: i64) -> Result<Option<Template>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_template(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_template row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_template: {e}"))),
        }
    }

    async fn default_template(&self, kind: &str) -> Result<Option<Template>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE kind = ?1 AND is_default = 1 AND status = 'active' ORDER BY id ASC LIMIT 1"
                ),
                params![kind],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("default_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_template(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("default_template row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("default_template: {e}"))),
        }
    }

    async fn insert_default_template(&self, template: &Template) -> Result<bool, DatabaseError> {
        let written = self
            .conn()
            .execute(
                "INSERT INTO templates (name, kind, subject, content, is_default, status) \
                 SELECT ?1, ?2, ?3, ?4, 1, ?5 \
                 WHERE NOT EXISTS (SELECT 1 FROM templates WHERE kind = ?2 AND is_default = 1)",
                params![
                    template.name.clone(),
                    template.kind.clone(),
                    template.subject.clone(),
                    template.content.clone(),
                    template.status.as_str(),
                ],
            )
            .await
            .map_err(|e| write_err("insert_default_template", e))?;
        Ok(written > 0)
    }

    // ── Alerts ──────────────────────────────────────────────────────

    async fn insert_alert(&self, alert: &Alert) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO alerts (id, mailbox_id, rule_group_id, rule_id, uid, subject, sender, content, message_id, received_at, received_hour, status, retry_count, sent_channels, error, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    alert.id.to_string(),
                    alert.mailbox_id,
                    opt_int(alert.rule_group_id),
                    opt_int(alert.rule_id),
                    i64::from(alert.uid),
                    alert.subject.clone(),
                    alert.sender.clone(),
                    alert.content.clone(),
                    alert.message_id.clone(),
                    alert.received_at.to_rfc3339(),
                    hour_bucket(&alert.received_at),
                    alert.status.as_str(),
                    i64::from(alert.retry_count),
                    alert.sent_channels.join(","),
                    opt_text(alert.error.as_deref()),
                    alert.created_at.to_rfc3339(),
                    alert.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_err("insert_alert", e))?;
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_alert: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_alert(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_alert: {e}"))),
        }
    }

    async fn alert_exists_by_message_id(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM alerts WHERE message_id = ?1 AND message_id != ''",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("alert_exists_by_message_id: {e}")))?;
        let counts = count_row(&mut rows, "alert_exists_by_message_id").await?;
        Ok(counts.first().copied().unwrap_or(0) > 0)
    }

    async fn alert_exists_by_composite_key(
        &self,
        key: &CompositeKey,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM alerts WHERE mailbox_id = ?1 AND uid = ?2 AND subject = ?3 AND sender = ?4 AND received_hour = ?5",
                params![
                    key.mailbox_id,
                    i64::from(key.uid),
                    key.subject.clone(),
                    key.sender.clone(),
                    key.hour_bucket.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("alert_exists_by_composite_key: {e}")))?;
        let counts = count_row(&mut rows, "alert_exists_by_composite_key").await?;
        Ok(counts.first().copied().unwrap_or(0) > 0)
    }

    async fn update_alert_status(
        &self,
        id: Uuid,
        status: AlertStatus,
        sent_channels: &[String],
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE alerts SET status = ?1, sent_channels = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    status.as_str(),
                    sent_channels.join(","),
                    opt_text(error),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_alert_status: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "alert".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn reset_alert_for_retry(&self, id: Uuid) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE alerts SET status = 'pending', retry_count = retry_count + 1, error = NULL, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_alert_for_retry: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "alert".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_pending_alerts(&self, limit: usize) -> Result<Vec<Alert>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_alerts: {e}")))?;

        let mut alerts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_alert(&row) {
                Ok(alert) => alerts.push(alert),
                Err(e) => warn!("Skipping alert row: {e}"),
            }
        }
        Ok(alerts)
    }

    async fn alert_counts(&self, since: DateTime<Utc>) -> Result<AlertCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN created_at >= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM alerts",
                params![since.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("alert_counts: {e}")))?;

        let counts = count_row(&mut rows, "alert_counts").await?;
        let at = |i: usize| counts.get(i).copied().unwrap_or(0);
        Ok(AlertCounts {
            today: at(0),
            pending: at(1),
            failed: at(2),
        })
    }

    // ── Notification logs ───────────────────────────────────────────

    async fn insert_notification_log(&self, log: &NotificationLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO notification_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    log.id.to_string(),
                    log.channel_id,
                    log.alert_id.to_string(),
                    log.content.clone(),
                    log.status.as_str(),
                    opt_text(log.error.as_deref()),
                    opt_text(log.response.as_deref()),
                    opt_text(log.sent_at.map(|t| t.to_rfc3339()).as_deref()),
                    i64::from(log.retry_count),
                    log.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_err("insert_notification_log", e))?;
        Ok(())
    }

    async fn update_log_result(
        &self,
        id: Uuid,
        status: LogStatus,
        error: Option<&str>,
        response: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE notification_logs SET status = ?1, error = ?2, response = ?3, sent_at = ?4 WHERE id = ?5",
                params![
                    status.as_str(),
                    opt_text(error),
                    opt_text(response),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_log_result: {e}")))?;
        Ok(())
    }

    async fn increment_log_retry(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE notification_logs SET retry_count = retry_count + 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_log_retry: {e}")))?;
        Ok(())
    }

    async fn list_failed_logs(
        &self,
        max_retry_count: u32,
        limit: usize,
    ) -> Result<Vec<NotificationLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM notification_logs WHERE status = 'failed' AND retry_count < ?1 ORDER BY created_at ASC LIMIT ?2"
                ),
                params![i64::from(max_retry_count), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_failed_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_log(&row) {
                Ok(log) => logs.push(log),
                Err(e) => warn!("Skipping notification log row: {e}"),
            }
        }
        Ok(logs)
    }

    async fn list_logs_for_alert(
        &self,
        alert_id: Uuid,
    ) -> Result<Vec<NotificationLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM notification_logs WHERE alert_id = ?1 ORDER BY created_at ASC"
                ),
                params![alert_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_logs_for_alert: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    async fn log_stats_since(&self, since: DateTime<Utc>) -> Result<LogStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0)
                 FROM notification_logs WHERE created_at >= ?1",
                params![since.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_stats_since: {e}")))?;

        let counts = count_row(&mut rows, "log_stats_since").await?;
        let at = |i: usize| counts.get(i).copied().unwrap_or(0);
        Ok(LogStats {
            total: at(0),
            success: at(1),
            failed: at(2),
            pending: at(3),
        })
    }
}
