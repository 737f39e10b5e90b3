//! End-to-end pipeline: mailbox poll → rule match → alert → channel fan-out.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use mail_alert::AppConfig;
use mail_alert::config::{DispatcherConfig, MonitorConfig, SystemInfo};
use mail_alert::error::{MailError, NotifyError};
use mail_alert::mail::{
    EmailMessage, FetchBatch, FetchQuery, MailFetcher, MailboxConfig, MailboxStatus, reference_now,
};
use mail_alert::notify::{
    Channel, ChannelKind, ChannelSender, ChannelStatus, SenderRegistry,
};
use mail_alert::rules::{Field, Logic, MatchCondition, Operator, RuleGroup, RuleStatus};
use mail_alert::service::MonitorService;
use mail_alert::store::{Database, LibSqlBackend};

// ── Fakes ───────────────────────────────────────────────────────────

/// Serves queued batches, then empty ones.
#[derive(Default)]
struct QueuedFetcher {
    batches: Mutex<VecDeque<Vec<EmailMessage>>>,
}

#[async_trait]
impl MailFetcher for QueuedFetcher {
    async fn validate(&self, _mailbox: &MailboxConfig, _folder: &str) -> Result<(), MailError> {
        Ok(())
    }

    async fn fetch_new(
        &self,
        _mailbox: &MailboxConfig,
        query: &FetchQuery,
    ) -> Result<FetchBatch, MailError> {
        let messages = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        let max_uid = messages
            .iter()
            .map(|m| m.uid)
            .max()
            .unwrap_or(0)
            .max(query.last_uid);
        Ok(FetchBatch { messages, max_uid })
    }
}

/// Webhook stand-in: fails when the channel config is `"fail"`.
#[derive(Default)]
struct RecordingWebhook {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelSender for RecordingWebhook {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn validate(&self, _config: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn send(&self, config: &str, subject: &str, _content: &str) -> Result<String, NotifyError> {
        if config == "fail" {
            return Err(NotifyError::Http("HTTP 502".into()));
        }
        self.delivered.lock().unwrap().push(subject.to_string());
        Ok("HTTP 200: ok".into())
    }
}

struct Harness {
    db: Arc<LibSqlBackend>,
    fetcher: Arc<QueuedFetcher>,
    webhook: Arc<RecordingWebhook>,
    service: MonitorService,
}

async fn harness() -> Harness {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let fetcher = Arc::new(QueuedFetcher::default());
    let webhook = Arc::new(RecordingWebhook::default());
    let mut registry = SenderRegistry::new();
    registry.register(webhook.clone());

    let config = AppConfig {
        db_path: PathBuf::from(":memory:"),
        monitor: MonitorConfig {
            check_interval: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        dispatcher: DispatcherConfig::default(),
        system: SystemInfo::default(),
    };
    let service = MonitorService::new(&config, db.clone(), fetcher.clone(), Arc::new(registry));
    Harness {
        db,
        fetcher,
        webhook,
        service,
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

async fn seed_mailbox(db: &LibSqlBackend) {
    db.save_mailbox(&MailboxConfig {
        id: 1,
        name: "ops".into(),
        email: "ops@example.com".into(),
        host: "imap.example.com".into(),
        port: 993,
        username: "ops".into(),
        password: SecretString::from("pw".to_string()),
        protocol: "imap".into(),
        ssl: true,
        status: MailboxStatus::Active,
    })
    .await
    .unwrap();
}

fn condition(id: i64, field: Field, operator: Operator, keywords: &str) -> MatchCondition {
    MatchCondition {
        id,
        rule_group_id: 1,
        field,
        operator,
        keywords: keywords.into(),
        keyword_logic: Logic::Or,
        priority: 0,
        status: RuleStatus::Active,
    }
}

/// G1 (or): subject contains "error", from equals "alerts@x.com".
async fn seed_rules(db: &LibSqlBackend) {
    db.save_rule_group(&RuleGroup {
        id: 1,
        name: "G1".into(),
        mailbox_id: 1,
        logic: Logic::Or,
        priority: 10,
        status: RuleStatus::Active,
        conditions: vec![
            condition(1, Field::Subject, Operator::Contains, "error"),
            condition(2, Field::From, Operator::Equals, "alerts@x.com"),
        ],
    })
    .await
    .unwrap();
}

async fn seed_channel(db: &LibSqlBackend, id: i64, config: &str) {
    db.save_channel(&Channel {
        id,
        name: format!("c{id}"),
        kind: ChannelKind::Webhook,
        config: config.into(),
        status: ChannelStatus::Active,
        template_id: None,
    })
    .await
    .unwrap();
    db.link_rule_group_channel(1, id, id as i32).await.unwrap();
}

fn message(uid: u32, message_id: &str, offset_secs: i64) -> EmailMessage {
    EmailMessage {
        uid,
        subject: "system error detected".into(),
        sender: "other@y.com".into(),
        content: "disk failure on web-1".into(),
        message_id: message_id.into(),
        received_at: Some(reference_now() + chrono::Duration::seconds(offset_secs)),
        ..Default::default()
    }
}

fn an_hour_ago() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() - chrono::Duration::hours(1)
}

async fn wait_for(mut done: impl AsyncFnMut() -> bool) {
    for _ in 0..150 {
        if done().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pipeline did not settle");
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn or_group_match_is_delivered_to_all_channels() {
    let h = harness().await;
    seed_mailbox(&h.db).await;
    seed_rules(&h.db).await;
    seed_channel(&h.db, 1, "{}").await;
    seed_channel(&h.db, 2, "{}").await;
    h.fetcher
        .batches
        .lock()
        .unwrap()
        .push_back(vec![message(10, "m1@x", 60)]);

    h.service.start().await.unwrap();
    let db = h.db.clone();
    wait_for(async || {
        let logs = db.log_stats_since(an_hour_ago()).await.unwrap();
        let alerts = db.alert_counts(an_hour_ago()).await.unwrap();
        logs.success == 2 && alerts.today == 1 && alerts.pending == 0
    })
    .await;

    let stats = h.service.email_stats().await.unwrap();
    assert_eq!(stats.today_alerts, 1);
    assert_eq!(stats.pending_alerts, 0);
    assert_eq!(stats.failed_alerts, 0);
    assert!(stats.running);
    assert_eq!(
        *h.webhook.delivered.lock().unwrap(),
        vec!["[Alert] system error detected"; 2]
    );

    h.service.stop().await;
    assert!(!h.service.is_running().await);
}

#[tokio::test]
async fn partial_channel_failure_still_sends() {
    let h = harness().await;
    seed_mailbox(&h.db).await;
    seed_rules(&h.db).await;
    seed_channel(&h.db, 1, "{}").await;
    seed_channel(&h.db, 2, "{}").await;
    seed_channel(&h.db, 3, "fail").await;
    h.fetcher
        .batches
        .lock()
        .unwrap()
        .push_back(vec![message(10, "m2@x", 60)]);

    h.service.start().await.unwrap();
    let db = h.db.clone();
    wait_for(async || {
        let logs = db.log_stats_since(an_hour_ago()).await.unwrap();
        let alerts = db.alert_counts(an_hour_ago()).await.unwrap();
        logs.success + logs.failed == 3 && alerts.pending == 0
    })
    .await;
    h.service.stop().await;

    let dispatch = h.service.dispatch_stats().await.unwrap();
    assert_eq!(dispatch.today.total, 3);
    assert_eq!(dispatch.today.success, 2);
    assert_eq!(dispatch.today.failed, 1);

    let stats = h.service.email_stats().await.unwrap();
    assert_eq!(stats.today_alerts, 1);
    assert_eq!(stats.failed_alerts, 0);
    assert_eq!(stats.pending_alerts, 0);
}

#[tokio::test]
async fn repeated_message_id_creates_one_alert() {
    let h = harness().await;
    seed_mailbox(&h.db).await;
    seed_rules(&h.db).await;
    seed_channel(&h.db, 1, "{}").await;
    {
        let mut batches = h.fetcher.batches.lock().unwrap();
        batches.push_back(vec![message(10, "same@x", 60)]);
        batches.push_back(vec![message(11, "same@x", 60)]);
    }

    h.service.start().await.unwrap();
    let fetcher = h.fetcher.clone();
    wait_for(async || fetcher.batches.lock().unwrap().is_empty()).await;
    // One more tick so the second batch has been handled.
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.service.stop().await;

    assert_eq!(h.service.email_stats().await.unwrap().today_alerts, 1);
    assert_eq!(h.webhook.delivered.lock().unwrap().len(), 1);
    assert!(h.db.alert_exists_by_message_id("same@x").await.unwrap());
}

#[tokio::test]
async fn message_before_start_is_ignored() {
    let h = harness().await;
    seed_mailbox(&h.db).await;
    seed_rules(&h.db).await;
    seed_channel(&h.db, 1, "{}").await;
    h.fetcher
        .batches
        .lock()
        .unwrap()
        .push_back(vec![message(10, "old@x", -3600)]);

    h.service.start().await.unwrap();
    let fetcher = h.fetcher.clone();
    wait_for(async || fetcher.batches.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.service.stop().await;

    assert!(!h.db.alert_exists_by_message_id("old@x").await.unwrap());
    assert!(h.webhook.delivered.lock().unwrap().is_empty());
    assert_eq!(h.service.status().await.last_uids.get(&1), Some(&10));
}

#[tokio::test]
async fn mailbox_control_surface() {
    let h = harness().await;
    seed_mailbox(&h.db).await;

    h.service.start().await.unwrap();
    assert!(h.service.start().await.is_err());
    assert_eq!(h.service.status().await.mailbox_count, 1);

    h.service.remove_mailbox(1).await;
    assert_eq!(h.service.status().await.mailbox_count, 0);

    assert_eq!(h.service.refresh_mailboxes().await.unwrap(), 1);
    assert_eq!(h.service.status().await.mailbox_count, 1);

    assert!(h.service.add_mailbox(99).await.is_err());

    let report = h.service.diagnose_mailbox(1).await.unwrap();
    assert_eq!(report.len(), 1);
    assert!(report[0].success);
    assert!(h.service.diagnose_mailbox(99).await.is_err());
    h.service.stop().await;
}

#[tokio::test]
async fn start_seeds_default_templates() {
    let h = harness().await;
    assert!(h.db.default_template("webhook").await.unwrap().is_none());

    h.service.start().await.unwrap();
    h.service.stop().await;

    for kind in ["email", "webhook", "wechat", "dingtalk"] {
        assert!(h.db.default_template(kind).await.unwrap().is_some(), "{kind}");
    }
}
