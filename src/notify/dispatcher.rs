//! Notification dispatcher: per-alert channel fan-out, worker pool, retry and pending sweeps.
//!
//! Alerts enter through `dispatch()`, which enqueues on a bounded queue and
//! falls back to inline processing when the queue is full or the workers are
//! not running. Background tasks:
//! - `max_workers` workers draining the alert and retry queues
//! - a retry sweep re-sending failed notification logs below the retry cap
//! - a pending sweep re-processing alerts still marked pending

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::model::{Alert, AlertStatus};
use crate::config::{DispatcherConfig, SystemInfo};
use crate::error::DispatchError;
use crate::mail::types::start_of_reference_day;
use crate::notify::model::{
    Channel, ChannelFamily, ChannelStatus, LogStats, LogStatus, NotificationLog,
};
use crate::notify::sender::{SendOutcome, SenderRegistry};
use crate::notify::template::{self, Rendered, TemplateRenderer};
use crate::store::Database;

/// Subject used when re-sending a stored notification.
pub const RETRY_SUBJECT: &str = "Retry notification";

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Dispatcher counters for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    /// Notification logs created today (reference timezone).
    pub today: LogStats,
    pub queue_size: usize,
    pub retry_queue_size: usize,
    pub max_workers: usize,
    pub max_retry_count: u32,
}

enum Job {
    Alert(Alert),
    Retry(NotificationLog),
}

struct Queues {
    alerts: mpsc::Receiver<Alert>,
    retries: mpsc::Receiver<NotificationLog>,
}

/// Shared state used by both callers and background tasks.
struct Core {
    db: Arc<dyn Database>,
    senders: Arc<SenderRegistry>,
    renderer: TemplateRenderer,
    config: DispatcherConfig,
}

pub struct Dispatcher {
    core: Arc<Core>,
    alert_tx: mpsc::Sender<Alert>,
    retry_tx: mpsc::Sender<NotificationLog>,
    queues: Arc<Mutex<Queues>>,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        senders: Arc<SenderRegistry>,
        config: DispatcherConfig,
        system: SystemInfo,
    ) -> Self {
        let (alert_tx, alerts) = mpsc::channel(config.alert_queue_capacity.max(1));
        let (retry_tx, retries) = mpsc::channel(config.retry_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                db,
                senders,
                renderer: TemplateRenderer::new(system),
                config,
            }),
            alert_tx,
            retry_tx,
            queues: Arc::new(Mutex::new(Queues { alerts, retries })),
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Intake ──────────────────────────────────────────────────────

    /// Hand an alert to the worker pool; process inline if the queue is full
    /// or the pool is not running.
    pub async fn dispatch(&self, alert: Alert) -> Result<(), DispatchError> {
        if !self.is_running() {
            return self.core.process_alert(&alert).await.map(|_| ());
        }
        match self.alert_tx.try_send(alert) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(alert))
            | Err(mpsc::error::TrySendError::Closed(alert)) => {
                warn!(alert_id = %alert.id, "Alert queue full, dispatching inline");
                self.core.process_alert(&alert).await.map(|_| ())
            }
        }
    }

    /// Process an alert now and return its resulting status.
    ///
    /// `None` means no channel was resolved and the alert stays pending.
    pub async fn dispatch_now(&self, alert: &Alert) -> Result<Option<AlertStatus>, DispatchError> {
        self.core.process_alert(alert).await
    }

    // ── Sweeps ──────────────────────────────────────────────────────

    /// Re-send failed notification logs below the retry cap. Returns how many were picked up.
    pub async fn retry_failed_notifications(&self) -> Result<usize, DispatchError> {
        let logs = self
            .core
            .db
            .list_failed_logs(self.core.config.max_retry_count, self.core.config.batch_size)
            .await?;
        if logs.is_empty() {
            return Ok(0);
        }

        info!(count = logs.len(), "Retrying failed notifications");
        let count = logs.len();
        for log in logs {
            if !self.is_running() {
                self.core.retry_log(log).await;
                continue;
            }
            if let Err(
                mpsc::error::TrySendError::Full(log) | mpsc::error::TrySendError::Closed(log),
            ) = self.retry_tx.try_send(log)
            {
                self.core.retry_log(log).await;
            }
        }
        Ok(count)
    }

    /// Re-process pending alerts, at most `max_workers` at a time.
    pub async fn process_pending_alerts(&self) -> Result<usize, DispatchError> {
        self.core.process_pending_alerts().await
    }

    // ── Manual retry ────────────────────────────────────────────────

    /// Reset an alert to pending and dispatch it synchronously.
    pub async fn retry_alert(&self, alert_id: Uuid) -> Result<AlertStatus, DispatchError> {
        let db = &self.core.db;
        if db.get_alert(alert_id).await?.is_none() {
            return Err(DispatchError::AlertNotFound(alert_id));
        }
        db.reset_alert_for_retry(alert_id).await?;
        let alert = db
            .get_alert(alert_id)
            .await?
            .ok_or(DispatchError::AlertNotFound(alert_id))?;

        match self.core.process_alert(&alert).await {
            Ok(Some(AlertStatus::Sent)) => Ok(AlertStatus::Sent),
            Ok(Some(status)) => Err(DispatchError::DeliveryFailed {
                id: alert_id,
                reason: format!("alert ended {}", status.as_str()),
            }),
            Ok(None) => {
                let reason = "no notification channels configured".to_string();
                db.update_alert_status(alert_id, AlertStatus::Failed, &[], Some(&reason))
                    .await?;
                Err(DispatchError::DeliveryFailed {
                    id: alert_id,
                    reason,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                db.update_alert_status(alert_id, AlertStatus::Failed, &[], Some(&reason))
                    .await?;
                Err(DispatchError::DeliveryFailed {
                    id: alert_id,
                    reason,
                })
            }
        }
    }

    // ── Stats ───────────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<DispatchStats, DispatchError> {
        let today = self.core.db.log_stats_since(start_of_reference_day()).await?;
        Ok(DispatchStats {
            today,
            queue_size: self.alert_tx.max_capacity() - self.alert_tx.capacity(),
            retry_queue_size: self.retry_tx.max_capacity() - self.retry_tx.capacity(),
            max_workers: self.core.config.max_workers,
            max_retry_count: self.core.config.max_retry_count,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the worker pool and both sweep timers.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatcher already running");
            return;
        }
        self.shutdown.send_replace(false);

        let mut tasks = self.tasks.lock().await;
        for worker_id in 0..self.core.config.max_workers.max(1) {
            tasks.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.core),
                Arc::clone(&self.queues),
                self.shutdown.subscribe(),
            )));
        }

        let retry = Arc::clone(self);
        tasks.push(spawn_ticker(
            "retry sweep",
            self.core.config.retry_interval,
            self.shutdown.subscribe(),
            move || {
                let retry = Arc::clone(&retry);
                async move {
                    if let Err(e) = retry.retry_failed_notifications().await {
                        error!("Retry sweep failed: {e}");
                    }
                }
            },
        ));

        let core = Arc::clone(&self.core);
        tasks.push(spawn_ticker(
            "pending sweep",
            self.core.config.pending_interval,
            self.shutdown.subscribe(),
            move || {
                let core = Arc::clone(&core);
                async move {
                    if let Err(e) = core.process_pending_alerts().await {
                        error!("Pending sweep failed: {e}");
                    }
                }
            },
        ));

        info!(
            workers = self.core.config.max_workers,
            "Notification dispatcher started"
        );
    }

    /// Signal all background tasks and wait for them, up to a bounded timeout.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(STOP_TIMEOUT, join_all(handles))
            .await
            .is_err()
        {
            warn!("Dispatcher tasks did not stop in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
        info!("Notification dispatcher stopped");
    }
}

impl Core {
    /// Fan an alert out to its channels and record the aggregate status.
    async fn process_alert(&self, alert: &Alert) -> Result<Option<AlertStatus>, DispatchError> {
        let channels = self.resolve_channels(alert).await?;
        if channels.is_empty() {
            debug!(alert_id = %alert.id, "No active notification channels, skipping");
            return Ok(None);
        }

        let outcomes = join_all(channels.iter().map(|c| self.deliver(alert, c))).await;
        let sent: Vec<String> = channels
            .iter()
            .zip(&outcomes)
            .filter(|(_, ok)| **ok)
            .map(|(c, _)| c.name.clone())
            .collect();

        let (status, error) = if sent.is_empty() {
            (
                AlertStatus::Failed,
                Some(format!("all {} channel(s) failed", channels.len())),
            )
        } else {
            (AlertStatus::Sent, None)
        };
        self.db
            .update_alert_status(alert.id, status, &sent, error.as_deref())
            .await?;

        info!(
            alert_id = %alert.id,
            status = status.as_str(),
            sent = sent.len(),
            total = channels.len(),
            "Alert dispatched"
        );
        Ok(Some(status))
    }

    /// Rule-group channels, else legacy rule channels. Inactive channels are dropped.
    async fn resolve_channels(&self, alert: &Alert) -> Result<Vec<Channel>, DispatchError> {
        let lookup = |e: crate::error::DatabaseError| DispatchError::ChannelLookup {
            id: alert.id,
            reason: e.to_string(),
        };
        let channels = if let Some(group_id) = alert.rule_group_id {
            self.db.channels_for_rule_group(group_id).await.map_err(lookup)?
        } else if let Some(rule_id) = alert.rule_id {
            self.db.channels_for_rule(rule_id).await.map_err(lookup)?
        } else {
            debug!(alert_id = %alert.id, "Alert has no rule group or rule");
            Vec::new()
        };
        Ok(channels.into_iter().filter(Channel::is_active).collect())
    }

    /// Deliver on one channel with its own notification log. Returns success.
    async fn deliver(&self, alert: &Alert, channel: &Channel) -> bool {
        let rendered = self.content_for(alert, channel).await;
        let log = NotificationLog {
            content: rendered.content.clone(),
            ..NotificationLog::pending(channel.id, alert.id)
        };
        if let Err(e) = self.db.insert_notification_log(&log).await {
            error!(channel = %channel.name, "Failed to create notification log: {e}");
            return false;
        }

        let outcome: SendOutcome = self
            .senders
            .send(channel, &rendered.subject, &rendered.content)
            .await
            .into();
        self.record(log.id, &outcome).await;

        if !outcome.success {
            warn!(
                alert_id = %alert.id,
                channel = %channel.name,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Notification failed"
            );
        }
        outcome.success
    }

    /// Channel template → family default template → built-in format.
    async fn content_for(&self, alert: &Alert, channel: &Channel) -> Rendered {
        let family = channel.kind.family();

        let mut template = None;
        if let Some(template_id) = channel.template_id {
            match self.db.get_template(template_id).await {
                Ok(found) => template = found.filter(|t| t.status == ChannelStatus::Active),
                Err(e) => warn!(template_id, "Channel template lookup failed: {e}"),
            }
        }
        if template.is_none() {
            match self.db.default_template(family.as_str()).await {
                Ok(found) => template = found,
                Err(e) => warn!(family = family.as_str(), "Default template lookup failed: {e}"),
            }
        }

        let rendered = match template.map(|t| self.renderer.render(&t, alert)) {
            Some(Ok(rendered)) => rendered,
            Some(Err(e)) => {
                warn!(channel = %channel.name, "Template render failed, using built-in format: {e}");
                simple(alert, family)
            }
            None => simple(alert, family),
        };
        Rendered {
            subject: rendered.subject,
            content: template::truncate(&rendered.content, family),
        }
    }

    async fn record(&self, log_id: Uuid, outcome: &SendOutcome) {
        let status = if outcome.success {
            LogStatus::Success
        } else {
            LogStatus::Failed
        };
        if let Err(e) = self
            .db
            .update_log_result(
                log_id,
                status,
                outcome.error.as_deref(),
                outcome.response.as_deref(),
            )
            .await
        {
            warn!(%log_id, "Failed to record notification result: {e}");
        }
    }

    /// Re-send one stored notification. The retry count is bumped before sending.
    async fn retry_log(&self, log: NotificationLog) {
        if let Err(e) = self.db.increment_log_retry(log.id).await {
            warn!(log_id = %log.id, "Failed to bump retry count: {e}");
        }

        let outcome = match self.db.get_channel(log.channel_id).await {
            Ok(Some(channel)) => self
                .senders
                .send(&channel, RETRY_SUBJECT, &log.content)
                .await
                .into(),
            Ok(None) => SendOutcome::failed(format!("channel {} not found", log.channel_id)),
            Err(e) => SendOutcome::failed(format!("channel lookup failed: {e}")),
        };
        self.record(log.id, &outcome).await;

        if outcome.success {
            info!(log_id = %log.id, "Notification retry succeeded");
        } else {
            warn!(
                log_id = %log.id,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Notification retry failed"
            );
        }
    }

    async fn process_pending_alerts(&self) -> Result<usize, DispatchError> {
        let alerts = self.db.list_pending_alerts(self.config.batch_size).await?;
        if alerts.is_empty() {
            return Ok(0);
        }

        let count = alerts.len();
        info!(count, "Processing pending alerts");
        futures::stream::iter(alerts)
            .for_each_concurrent(self.config.max_workers.max(1), |alert| async move {
                if let Err(e) = self.process_alert(&alert).await {
                    error!(alert_id = %alert.id, "Failed to process pending alert: {e}");
                }
            })
            .await;
        Ok(count)
    }
}

fn simple(alert: &Alert, family: ChannelFamily) -> Rendered {
    Rendered {
        subject: template::fallback_subject(alert),
        content: template::simple_content(alert, family),
    }
}

async fn run_worker(
    worker_id: usize,
    core: Arc<Core>,
    queues: Arc<Mutex<Queues>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Dispatch worker started");
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = next_job(&queues) => job,
        };
        match job {
            Some(Job::Alert(alert)) => {
                if let Err(e) = core.process_alert(&alert).await {
                    error!(alert_id = %alert.id, "Failed to process alert: {e}");
                }
            }
            Some(Job::Retry(log)) => core.retry_log(log).await,
            None => break,
        }
    }
    debug!(worker_id, "Dispatch worker stopped");
}

/// Wait for the next job on either queue. `None` once both are closed.
async fn next_job(queues: &Mutex<Queues>) -> Option<Job> {
    let mut guard = queues.lock().await;
    let queues = &mut *guard;
    tokio::select! {
        Some(alert) = queues.alerts.recv() => Some(Job::Alert(alert)),
        Some(log) = queues.retries.recv() => Some(Job::Retry(log)),
        else => None,
    }
}

/// Run `tick` every `period` (first run one period after start) until shutdown.
fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let period = period.max(Duration::from_millis(10));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = name, ?period, "Ticker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "Ticker stopped");
    })
}
