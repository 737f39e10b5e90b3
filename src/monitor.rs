//! Mailbox monitor: one polling task per active mailbox.
//!
//! All polling state (mailbox list, last-seen UIDs, running flag, start
//! instant) lives behind a single `RwLock`. Each mailbox loop validates
//! access once, checks immediately, then checks on every interval tick until
//! stopped. A failed check is retried with linear backoff before yielding to
//! the next tick; failures never leave the mailbox's own loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{MailError, MonitorError};
use crate::logs::LogBroadcaster;
use crate::mail::{EmailMessage, FetchQuery, MailFetcher, MailboxConfig, reference_now};

/// Receives every eligible message, in ascending UID order per mailbox.
#[async_trait]
pub trait MailHandler: Send + Sync {
    /// `started_at` is the monitor's start instant.
    async fn handle(&self, mailbox_id: i64, started_at: DateTime<FixedOffset>, email: EmailMessage);
}

/// Snapshot for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub mailbox_count: usize,
    pub check_interval_secs: u64,
    pub last_uids: HashMap<i64, u32>,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub running_secs: Option<u64>,
}

#[derive(Default)]
struct State {
    mailboxes: HashMap<i64, MailboxConfig>,
    last_uids: HashMap<i64, u32>,
    running: bool,
    started_at: Option<DateTime<FixedOffset>>,
    started: Option<Instant>,
}

struct MailboxLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Everything a mailbox loop needs.
#[derive(Clone)]
struct LoopContext {
    config: MonitorConfig,
    fetcher: Arc<dyn MailFetcher>,
    handler: Arc<dyn MailHandler>,
    logs: Arc<LogBroadcaster>,
    state: Arc<RwLock<State>>,
}

pub struct Monitor {
    ctx: LoopContext,
    loops: Mutex<HashMap<i64, MailboxLoop>>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        fetcher: Arc<dyn MailFetcher>,
        handler: Arc<dyn MailHandler>,
        logs: Arc<LogBroadcaster>,
    ) -> Self {
        Self {
            ctx: LoopContext {
                config,
                fetcher,
                handler,
                logs,
                state: Arc::new(RwLock::new(State::default())),
            },
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Record the start instant and spawn a loop for every active mailbox.
    pub async fn start(&self, mailboxes: Vec<MailboxConfig>) -> Result<(), MonitorError> {
        let active: Vec<MailboxConfig> = {
            let mut state = self.ctx.state.write().await;
            if state.running {
                return Err(MonitorError::AlreadyRunning);
            }
            state.running = true;
            state.started_at = Some(reference_now());
            state.started = Some(Instant::now());
            state.last_uids.clear();
            state.mailboxes = mailboxes
                .into_iter()
                .filter(MailboxConfig::is_active)
                .map(|m| (m.id, m))
                .collect();
            state.mailboxes.values().cloned().collect()
        };

        let mut loops = self.loops.lock().await;
        for mailbox in active {
            loops.insert(mailbox.id, self.spawn_loop(mailbox));
        }
        info!(mailboxes = loops.len(), "Mailbox monitor started");
        self.ctx
            .logs
            .success(format!("Monitoring started for {} mailbox(es)", loops.len()), None);
        Ok(())
    }

    /// Signal every loop and wait up to the configured timeout.
    ///
    /// Loops still running after the timeout are aborted and `StopTimeout` is returned.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        {
            let mut state = self.ctx.state.write().await;
            if !state.running {
                return Ok(());
            }
            state.running = false;
        }

        let loops: Vec<MailboxLoop> = self.loops.lock().await.drain().map(|(_, l)| l).collect();
        let result = stop_loops(loops, self.ctx.config.stop_timeout).await;
        info!("Mailbox monitor stopped");
        self.ctx.logs.info("Monitoring stopped", None);
        result
    }

    pub async fn is_running(&self) -> bool {
        self.ctx.state.read().await.running
    }

    /// Start instant of the current run.
    pub async fn started_at(&self) -> Option<DateTime<FixedOffset>> {
        self.ctx.state.read().await.started_at
    }

    pub async fn status(&self) -> MonitorStatus {
        let state = self.ctx.state.read().await;
        MonitorStatus {
            running: state.running,
            mailbox_count: state.mailboxes.len(),
            check_interval_secs: self.ctx.config.check_interval.as_secs(),
            last_uids: state.last_uids.clone(),
            started_at: state.started_at,
            running_secs: state
                .running
                .then(|| state.started.map(|s| s.elapsed().as_secs()))
                .flatten(),
        }
    }

    /// Insert or replace a mailbox. While running, its loop is restarted
    /// (or stopped, if the mailbox is no longer active).
    pub async fn add_mailbox(&self, mailbox: MailboxConfig) {
        let id = mailbox.id;
        let running = {
            let mut state = self.ctx.state.write().await;
            if mailbox.is_active() {
                state.mailboxes.insert(id, mailbox.clone());
            } else {
                state.mailboxes.remove(&id);
                state.last_uids.remove(&id);
            }
            state.running
        };
        if !running {
            return;
        }

        let mut loops = self.loops.lock().await;
        if let Some(previous) = loops.remove(&id) {
            let _ = stop_loops(vec![previous], self.ctx.config.stop_timeout).await;
        }
        if mailbox.is_active() {
            loops.insert(id, self.spawn_loop(mailbox));
            info!(mailbox_id = id, "Mailbox added to monitor");
        }
    }

    /// Forget a mailbox and its last-seen UID, stopping its loop.
    pub async fn remove_mailbox(&self, id: i64) {
        {
            let mut state = self.ctx.state.write().await;
            state.mailboxes.remove(&id);
            state.last_uids.remove(&id);
        }
        let removed = self.loops.lock().await.remove(&id);
        if let Some(removed) = removed {
            let _ = stop_loops(vec![removed], self.ctx.config.stop_timeout).await;
            info!(mailbox_id = id, "Mailbox removed from monitor");
        }
    }

    /// Replace the mailbox list. Unknown ids are removed, the rest upserted.
    pub async fn update_mailboxes(&self, mailboxes: Vec<MailboxConfig>) {
        let current: Vec<i64> = self.ctx.state.read().await.mailboxes.keys().copied().collect();
        for id in current {
            if !mailboxes.iter().any(|m| m.id == id) {
                self.remove_mailbox(id).await;
            }
        }
        for mailbox in mailboxes {
            self.add_mailbox(mailbox).await;
        }
    }

    fn spawn_loop(&self, mailbox: MailboxConfig) -> MailboxLoop {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_mailbox(self.ctx.clone(), mailbox, stop_rx));
        MailboxLoop { stop, handle }
    }
}

async fn stop_loops(loops: Vec<MailboxLoop>, timeout: Duration) -> Result<(), MonitorError> {
    let mut handles = Vec::with_capacity(loops.len());
    for l in loops {
        l.stop.send_replace(true);
        handles.push(l.handle);
    }
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
        warn!(?timeout, "Mailbox loops did not stop in time, aborting");
        for handle in aborts {
            handle.abort();
        }
        return Err(MonitorError::StopTimeout(timeout));
    }
    Ok(())
}

// ── Mailbox loop ────────────────────────────────────────────────────

async fn run_mailbox(ctx: LoopContext, mailbox: MailboxConfig, mut stop: watch::Receiver<bool>) {
    let id = mailbox.id;
    if let Err(e) = ctx.fetcher.validate(&mailbox, &ctx.config.folder).await {
        warn!(mailbox_id = id, error = %e, "Mailbox validation failed, not monitoring");
        ctx.logs
            .error(format!("Cannot access mailbox {}: {e}", mailbox.email), Some(id));
        return;
    }
    ctx.logs
        .info(format!("Monitoring mailbox {}", mailbox.email), Some(id));

    let mut interval = tokio::time::interval(ctx.config.check_interval.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            // The first tick completes immediately.
            _ = interval.tick() => {}
        }
        check_with_retries(&ctx, &mailbox, &mut stop).await;
        if *stop.borrow() {
            break;
        }
    }
    debug!(mailbox_id = id, "Mailbox loop stopped");
}

async fn check_with_retries(
    ctx: &LoopContext,
    mailbox: &MailboxConfig,
    stop: &mut watch::Receiver<bool>,
) {
    let max_retries = ctx.config.max_retries;
    for attempt in 0..=max_retries {
        let err = match check(ctx, mailbox).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if attempt == max_retries {
            warn!(mailbox_id = mailbox.id, error = %err, "Mailbox check failed, giving up until next tick");
            ctx.logs.error(
                format!("Check of {} failed after {} retries: {err}", mailbox.email, max_retries),
                Some(mailbox.id),
            );
            return;
        }

        let backoff = Duration::from_secs(u64::from(attempt + 1));
        warn!(mailbox_id = mailbox.id, attempt = attempt + 1, error = %err, "Mailbox check failed, retrying");
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// One check: fetch, hand eligible messages downstream, advance the last-seen UID.
async fn check(ctx: &LoopContext, mailbox: &MailboxConfig) -> Result<(), MailError> {
    let (since, last_uid) = {
        let state = ctx.state.read().await;
        let Some(since) = state.started_at else {
            return Ok(());
        };
        (since, state.last_uids.get(&mailbox.id).copied().unwrap_or(0))
    };

    let query = FetchQuery {
        folder: ctx.config.folder.clone(),
        since,
        last_uid,
        only_unread: ctx.config.only_unread,
    };
    let batch = ctx.fetcher.fetch_new(mailbox, &query).await?;

    let mut handled = 0usize;
    for email in batch.messages {
        if email.uid <= last_uid || !email.received_after(&since) {
            continue;
        }
        ctx.handler.handle(mailbox.id, since, email).await;
        handled += 1;
    }

    let mut state = ctx.state.write().await;
    if state.mailboxes.contains_key(&mailbox.id) {
        let entry = state.last_uids.entry(mailbox.id).or_insert(0);
        *entry = (*entry).max(batch.max_uid);
    }
    if handled > 0 {
        debug!(mailbox_id = mailbox.id, handled, "New messages handled");
    }
    Ok(())
}
