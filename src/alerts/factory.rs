//! Turns rule-group matches into deduplicated alerts and hands them to the dispatcher.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Alert, CompositeKey};
use crate::error::DatabaseError;
use crate::mail::{EmailMessage, reference_now};
use crate::notify::Dispatcher;
use crate::rules::GroupMatch;
use crate::store::Database;

/// Outcome for one matched rule group.
#[derive(Debug, Clone, Serialize)]
pub struct AlertResult {
    pub rule_group_id: i64,
    pub rule_group_name: String,
    pub alert_id: Option<Uuid>,
    /// An alert for this message already existed.
    pub duplicate: bool,
    pub created: bool,
    pub error: Option<String>,
}

impl AlertResult {
    fn new(group: &GroupMatch) -> Self {
        Self {
            rule_group_id: group.group_id,
            rule_group_name: group.group_name.clone(),
            alert_id: None,
            duplicate: false,
            created: false,
            error: None,
        }
    }
}

pub struct AlertFactory {
    db: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
}

impl AlertFactory {
    pub fn new(db: Arc<dyn Database>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { db, dispatcher }
    }

    /// Create alerts for every matched group of `email`, in the order given.
    ///
    /// A failure on one group is recorded in its result and does not stop the others.
    pub async fn process(
        &self,
        mailbox_id: i64,
        email: &EmailMessage,
        matches: &[GroupMatch],
    ) -> Vec<AlertResult> {
        let mut results = Vec::new();
        for group in matches.iter().filter(|m| m.matched) {
            let mut result = AlertResult::new(group);
            match self.create(mailbox_id, email, group.group_id).await {
                Ok(Some(id)) => {
                    result.alert_id = Some(id);
                    result.created = true;
                }
                Ok(None) => result.duplicate = true,
                Err(e) => {
                    warn!(
                        group_id = group.group_id,
                        uid = email.uid,
                        "Failed to create alert: {e}"
                    );
                    result.error = Some(e.to_string());
                }
            }
            results.push(result);
        }
        results
    }

    /// Insert and dispatch a pending alert. `None` when the message already has one.
    async fn create(
        &self,
        mailbox_id: i64,
        email: &EmailMessage,
        group_id: i64,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let received_at = email.received_at.unwrap_or_else(reference_now);
        if self.is_duplicate(mailbox_id, email, &received_at).await? {
            debug!(uid = email.uid, group_id, "Duplicate alert skipped");
            return Ok(None);
        }

        let alert = Alert::from_email(email, mailbox_id, group_id, received_at);
        match self.db.insert_alert(&alert).await {
            Ok(()) => {}
            // Lost a race with another insert for the same message.
            Err(DatabaseError::Constraint(_)) => {
                debug!(uid = email.uid, group_id, "Duplicate alert rejected by store");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        info!(
            alert_id = %alert.id,
            mailbox_id,
            group_id,
            subject = %alert.subject,
            "Alert created"
        );
        let id = alert.id;
        if let Err(e) = self.dispatcher.dispatch(alert).await {
            // The alert stays pending and is picked up by the pending sweep.
            warn!(alert_id = %id, "Dispatch failed: {e}");
        }
        Ok(Some(id))
    }

    async fn is_duplicate(
        &self,
        mailbox_id: i64,
        email: &EmailMessage,
        received_at: &chrono::DateTime<chrono::FixedOffset>,
    ) -> Result<bool, DatabaseError> {
        if !email.message_id.is_empty() {
            return self.db.alert_exists_by_message_id(&email.message_id).await;
        }
        let key = CompositeKey::for_email(mailbox_id, email, received_at);
        self.db.alert_exists_by_composite_key(&key).await
    }
}
