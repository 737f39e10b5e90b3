//! Monitor service: wires mailbox polling, rule matching, alert creation and
//! notification dispatch, and exposes the operator control surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertFactory, AlertStatus};
use crate::config::AppConfig;
use crate::error::{DatabaseError, DispatchError, Error, MonitorError};
use crate::logs::LogBroadcaster;
use crate::mail::types::start_of_reference_day;
use crate::mail::{DiagnosisStep, EmailMessage, MailFetcher};
use crate::monitor::{MailHandler, Monitor, MonitorStatus};
use crate::notify::{DispatchStats, Dispatcher, SenderRegistry, template};
use crate::rules::match_groups;
use crate::store::Database;

/// Mailbox and alert counters for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct EmailStats {
    pub active_mailboxes: usize,
    pub today_alerts: u64,
    pub failed_alerts: u64,
    pub pending_alerts: u64,
    pub running: bool,
    pub mailbox_count: usize,
    pub check_interval_secs: u64,
    pub last_uids: HashMap<i64, u32>,
}

/// Handles each eligible message: match, create alerts, dispatch.
struct AlertPipeline {
    db: Arc<dyn Database>,
    factory: AlertFactory,
    logs: Arc<LogBroadcaster>,
}

impl AlertPipeline {
    async fn handle_email(
        &self,
        mailbox_id: i64,
        started_at: DateTime<FixedOffset>,
        email: EmailMessage,
    ) {
        if !email.received_after(&started_at) {
            debug!(mailbox_id, uid = email.uid, "Message predates monitor start, skipped");
            return;
        }

        let groups = match self.db.list_rule_groups_for_mailbox(mailbox_id).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(mailbox_id, error = %e, "Failed to load rule groups");
                self.logs
                    .error(format!("Failed to load rules: {e}"), Some(mailbox_id));
                return;
            }
        };
        if groups.is_empty() {
            debug!(mailbox_id, "No active rule groups");
            return;
        }

        let matches = match_groups(&email, &groups);
        for failed in matches.iter().filter(|m| m.error.is_some()) {
            self.logs.warning(
                format!("Rule group {} failed: {}", failed.group_name, failed.reason),
                Some(mailbox_id),
            );
        }
        if !matches.iter().any(|m| m.matched) {
            debug!(mailbox_id, uid = email.uid, subject = %email.subject, "No rule group matched");
            return;
        }

        let results = self.factory.process(mailbox_id, &email, &matches).await;
        let created = results.iter().filter(|r| r.created).count();
        let duplicates = results.iter().filter(|r| r.duplicate).count();
        let failed = results.iter().filter(|r| r.error.is_some()).count();
        info!(
            mailbox_id,
            uid = email.uid,
            created,
            duplicates,
            failed,
            "Message processed"
        );

        if created > 0 {
            self.logs.success(
                format!("Alert created for \"{}\" from {}", email.subject, email.sender),
                Some(mailbox_id),
            );
        }
        for result in results.iter().filter(|r| r.error.is_some()) {
            self.logs.error(
                format!(
                    "Alert for rule group {} failed: {}",
                    result.rule_group_name,
                    result.error.as_deref().unwrap_or_default()
                ),
                Some(mailbox_id),
            );
        }
    }
}

#[async_trait]
impl MailHandler for AlertPipeline {
    async fn handle(&self, mailbox_id: i64, started_at: DateTime<FixedOffset>, email: EmailMessage) {
        self.handle_email(mailbox_id, started_at, email).await;
    }
}

pub struct MonitorService {
    db: Arc<dyn Database>,
    fetcher: Arc<dyn MailFetcher>,
    folder: String,
    monitor: Monitor,
    dispatcher: Arc<Dispatcher>,
    logs: Arc<LogBroadcaster>,
}

impl MonitorService {
    /// Build the pipeline. Must be called inside a runtime.
    pub fn new(
        config: &AppConfig,
        db: Arc<dyn Database>,
        fetcher: Arc<dyn MailFetcher>,
        senders: Arc<SenderRegistry>,
    ) -> Self {
        let logs = LogBroadcaster::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&db),
            senders,
            config.dispatcher.clone(),
            config.system.clone(),
        ));
        let pipeline = Arc::new(AlertPipeline {
            db: Arc::clone(&db),
            factory: AlertFactory::new(Arc::clone(&db), Arc::clone(&dispatcher)),
            logs: Arc::clone(&logs),
        });
        let monitor = Monitor::new(
            config.monitor.clone(),
            Arc::clone(&fetcher),
            pipeline,
            Arc::clone(&logs),
        );
        Self {
            db,
            fetcher,
            folder: config.monitor.folder.clone(),
            monitor,
            dispatcher,
            logs,
        }
    }

    pub fn logs(&self) -> Arc<LogBroadcaster> {
        Arc::clone(&self.logs)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Seed missing default templates, start the dispatcher and monitor every active mailbox.
    pub async fn start(&self) -> Result<(), Error> {
        if self.monitor.is_running().await {
            return Err(MonitorError::AlreadyRunning.into());
        }
        let seeded = template::seed_defaults(self.db.as_ref()).await?;
        if seeded > 0 {
            info!(seeded, "Default notification templates created");
        }
        let mailboxes = self.db.list_active_mailboxes().await?;
        self.dispatcher.start().await;
        self.monitor.start(mailboxes).await?;
        Ok(())
    }

    /// Stop polling, then the dispatcher. Returns once both are down or timed out.
    pub async fn stop(&self) {
        if let Err(e) = self.monitor.stop().await {
            warn!(error = %e, "Monitor stop incomplete");
        }
        self.dispatcher.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.monitor.is_running().await
    }

    pub async fn status(&self) -> MonitorStatus {
        self.monitor.status().await
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    /// Reload the active mailbox list from the store.
    pub async fn refresh_mailboxes(&self) -> Result<usize, Error> {
        let mailboxes = self.db.list_active_mailboxes().await?;
        let count = mailboxes.len();
        self.monitor.update_mailboxes(mailboxes).await;
        info!(count, "Mailbox list refreshed");
        Ok(count)
    }

    pub async fn add_mailbox(&self, id: i64) -> Result<(), Error> {
        let mailbox = self
            .db
            .get_mailbox(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: id.to_string(),
            })?;
        self.monitor.add_mailbox(mailbox).await;
        Ok(())
    }

    pub async fn remove_mailbox(&self, id: i64) {
        self.monitor.remove_mailbox(id).await;
    }

    /// Connectivity report for a stored mailbox, monitored or not.
    pub async fn diagnose_mailbox(&self, id: i64) -> Result<Vec<DiagnosisStep>, Error> {
        let mailbox = self
            .db
            .get_mailbox(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: id.to_string(),
            })?;
        let steps = self.fetcher.diagnose(&mailbox, &self.folder).await;
        let failed = steps.iter().filter(|s| !s.success).count();
        if failed == 0 {
            self.logs.success(format!("Mailbox {} diagnosis passed", mailbox.name), Some(id));
        } else {
            self.logs.warning(
                format!("Mailbox {} diagnosis: {failed} step(s) failed", mailbox.name),
                Some(id),
            );
        }
        Ok(steps)
    }

    // ── Alerts ──────────────────────────────────────────────────────

    pub async fn retry_alert(&self, id: Uuid) -> Result<AlertStatus, DispatchError> {
        let result = self.dispatcher.retry_alert(id).await;
        match &result {
            Ok(_) => self.logs.success(format!("Alert {id} re-sent"), None),
            Err(e) => self.logs.error(format!("Retry of alert {id} failed: {e}"), None),
        }
        result
    }

    pub async fn email_stats(&self) -> Result<EmailStats, Error> {
        let active_mailboxes = self.db.list_active_mailboxes().await?.len();
        let counts = self.db.alert_counts(start_of_reference_day()).await?;
        let status = self.monitor.status().await;
        Ok(EmailStats {
            active_mailboxes,
            today_alerts: counts.today,
            failed_alerts: counts.failed,
            pending_alerts: counts.pending,
            running: status.running,
            mailbox_count: status.mailbox_count,
            check_interval_secs: status.check_interval_secs,
            last_uids: status.last_uids,
        })
    }

    pub async fn dispatch_stats(&self) -> Result<DispatchStats, DispatchError> {
        self.dispatcher.stats().await
    }
}

