//! DingTalk senders: group robot (optionally signed) and work notifications.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ring::hmac;
use serde::Deserialize;
use serde_json::json;

use crate::error::NotifyError;
use crate::notify::model::ChannelKind;
use crate::notify::sender::{ChannelSender, call_api, invalid, parse_config};

const PROVIDER: &str = "dingtalk";
const API_BASE: &str = "https://oapi.dingtalk.com";

/// Stored configuration shared by both DingTalk kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DingtalkConfig {
    /// `robot` or `work`.
    #[serde(rename = "type")]
    pub variant: String,
    pub webhook_url: String,
    /// Robot signing secret; unsigned when empty.
    pub secret: String,
    pub app_key: String,
    pub app_secret: String,
    pub agent_id: i64,
    /// Comma-separated user ids.
    pub user_ids: String,
}

/// Robot request signature: base64(HMAC-SHA256(secret, "{timestamp_ms}\n{secret}")).
pub fn sign(timestamp_ms: i64, secret: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, format!("{timestamp_ms}\n{secret}").as_bytes());
    STANDARD.encode(tag.as_ref())
}

// ── Robot ───────────────────────────────────────────────────────────

pub struct DingtalkRobotSender {
    client: reqwest::Client,
}

impl DingtalkRobotSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for DingtalkRobotSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::DingtalkRobot
    }

    fn validate(&self, config: &str) -> Result<(), NotifyError> {
        let cfg: DingtalkConfig = parse_config(self.kind(), config)?;
        if cfg.webhook_url.trim().is_empty() {
            return Err(invalid(self.kind(), "robot webhook_url is required"));
        }
        Ok(())
    }

    async fn send(
        &self,
        config: &str,
        subject: &str,
        content: &str,
    ) -> Result<String, NotifyError> {
        self.validate(config)?;
        let cfg: DingtalkConfig = parse_config(self.kind(), config)?;

        let body = json!({
            "msgtype": "markdown",
            "markdown": {
                "title": subject,
                "text": format!("## {subject}\n\n{content}"),
            },
        });
        let mut request = self.client.post(&cfg.webhook_url).json(&body);
        if !cfg.secret.is_empty() {
            let timestamp = Utc::now().timestamp_millis();
            let signature = sign(timestamp, &cfg.secret);
            // reqwest percent-encodes the base64 signature.
            request = request.query(&[
                ("timestamp", timestamp.to_string()),
                ("sign", signature),
            ]);
        }

        let (raw, _) = call_api(request, PROVIDER).await?;
        Ok(raw)
    }
}

// ── Work notification ───────────────────────────────────────────────

pub struct DingtalkWorkSender {
    client: reqwest::Client,
    api_base: String,
}

impl DingtalkWorkSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_api_base(client, API_BASE)
    }

    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn access_token(&self, cfg: &DingtalkConfig) -> Result<String, NotifyError> {
        let request = self
            .client
            .get(format!("{}/gettoken", self.api_base))
            .query(&[("appkey", cfg.app_key.as_str()), ("appsecret", cfg.app_secret.as_str())]);
        let (_, reply) = call_api(request, PROVIDER).await?;
        if reply.access_token.is_empty() {
            return Err(NotifyError::Http("dingtalk gettoken returned no token".into()));
        }
        Ok(reply.access_token)
    }
}

#[async_trait]
impl ChannelSender for DingtalkWorkSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::DingtalkWork
    }

    fn validate(&self, config: &str) -> Result<(), NotifyError> {
        let cfg: DingtalkConfig = parse_config(self.kind(), config)?;
        if cfg.app_key.is_empty() || cfg.app_secret.is_empty() || cfg.agent_id == 0 {
            return Err(invalid(
                self.kind(),
                "app_key, app_secret and agent_id are required",
            ));
        }
        if cfg.user_ids.trim().is_empty() {
            return Err(invalid(self.kind(), "user_ids is required"));
        }
        Ok(())
    }

    async fn send(
        &self,
        config: &str,
        subject: &str,
        content: &str,
    ) -> Result<String, NotifyError> {
        self.validate(config)?;
        let cfg: DingtalkConfig = parse_config(self.kind(), config)?;
        let token = self.access_token(&cfg).await?;

        let body = json!({
            "agent_id": cfg.agent_id,
            "userid_list": cfg.user_ids,
            "msg": {
                "msgtype": "oa",
                "oa": {
                    "head": { "bgcolor": "FFBBBBBB", "text": subject },
                    "body": { "title": subject, "content": content },
                },
            },
        });
        let request = self
            .client
            .post(format!(
                "{}/topapi/message/corpconversation/asyncsend_v2",
                self.api_base
            ))
            .query(&[("access_token", token.as_str())])
            .json(&body);
        let (raw, _) = call_api(request, PROVIDER).await?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    #[test]
    fn signature_known_vector() {
        assert_eq!(
            sign(1_700_000_000_000, "SECxyz"),
            "0PUR1j8g85Xg3vlFV/UrEcxXfF5HpCAGzcjrNfyJoyg="
        );
        assert_ne!(
            sign(1_700_000_000_001, "SECxyz"),
            sign(1_700_000_000_000, "SECxyz")
        );
    }

    #[test]
    fn work_validation() {
        let sender = DingtalkWorkSender::new(reqwest::Client::new());
        assert!(
            sender
                .validate(r#"{"type":"work","app_key":"k","app_secret":"s","agent_id":1}"#)
                .is_err()
        );
        assert!(
            sender
                .validate(r#"{"type":"work","app_key":"k","app_secret":"s","agent_id":1,"user_ids":"u1,u2"}"#)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn signed_robot_adds_timestamp_and_sign() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/robot/send")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("access_token".into(), "abc".into()),
                Matcher::Regex(r"timestamp=\d{13}".into()),
                Matcher::Regex("sign=".into()),
            ]))
            .match_body(Matcher::PartialJson(json!({
                "msgtype": "markdown",
                "markdown": { "title": "Disk full", "text": "## Disk full\n\nweb-1" }
            })))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let config = json!({
            "type": "robot",
            "webhook_url": format!("{}/robot/send?access_token=abc", server.url()),
            "secret": "SECxyz",
        })
        .to_string();
        let sender = DingtalkRobotSender::new(reqwest::Client::new());
        sender.send(&config, "Disk full", "web-1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unsigned_robot_error_code() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/robot/send")
            .with_body(r#"{"errcode":310000,"errmsg":"keywords not in content"}"#)
            .create_async()
            .await;

        let config = json!({ "webhook_url": format!("{}/robot/send", server.url()) }).to_string();
        let sender = DingtalkRobotSender::new(reqwest::Client::new());
        let err = sender.send(&config, "t", "c").await.unwrap_err();
        assert!(err.to_string().contains("keywords not in content"));
    }

    #[tokio::test]
    async fn work_sends_oa_message() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("GET", "/gettoken")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("appkey".into(), "key".into()),
                Matcher::UrlEncoded("appsecret".into(), "secret".into()),
            ]))
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"T1"}"#)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/topapi/message/corpconversation/asyncsend_v2")
            .match_query(Matcher::UrlEncoded("access_token".into(), "T1".into()))
            .match_body(Matcher::PartialJson(json!({
                "agent_id": 42,
                "userid_list": "u1,u2",
                "msg": { "msgtype": "oa", "oa": { "body": { "title": "Disk full" } } }
            })))
            .with_body(r#"{"errcode":0,"errmsg":"ok","task_id":7}"#)
            .create_async()
            .await;

        let config = r#"{"type":"work","app_key":"key","app_secret":"secret","agent_id":42,"user_ids":"u1,u2"}"#;
        let sender = DingtalkWorkSender::with_api_base(reqwest::Client::new(), server.url());
        let raw = sender.send(config, "Disk full", "details").await.unwrap();
        assert!(raw.contains("task_id"));
        token.assert_async().await;
        send.assert_async().await;
    }
}
