//! WeCom (WeChat Work) senders: group robot webhook and application messages.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::NotifyError;
use crate::notify::model::ChannelKind;
use crate::notify::sender::{ChannelSender, call_api, invalid, parse_config};

const PROVIDER: &str = "wechat";
const API_BASE: &str = "https://qyapi.weixin.qq.com";

/// Stored configuration shared by both WeChat kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WechatConfig {
    /// `robot` or `app`.
    #[serde(rename = "type")]
    pub variant: String,
    pub webhook_url: String,
    pub key: String,
    pub corp_id: String,
    pub agent_id: i64,
    pub secret: String,
    pub to_user: String,
    pub to_party: String,
    pub to_tag: String,
}

// ── Robot ───────────────────────────────────────────────────────────

/// Group robot: markdown message posted to the robot webhook.
pub struct WechatRobotSender {
    client: reqwest::Client,
}

impl WechatRobotSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for WechatRobotSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WechatRobot
    }

    fn validate(&self, config: &str) -> Result<(), NotifyError> {
        let cfg: WechatConfig = parse_config(self.kind(), config)?;
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
        let cfg: WechatConfig = parse_config(self.kind(), config)?;

        let body = json!({
            "msgtype": "markdown",
            "markdown": { "content": format!("**{subject}**\n\n{content}") },
        });
        let mut request = self.client.post(&cfg.webhook_url).json(&body);
        if !cfg.key.is_empty() && !cfg.webhook_url.contains("key=") {
            request = request.query(&[("key", cfg.key.as_str())]);
        }

        let (raw, _) = call_api(request, PROVIDER).await?;
        tracing::debug!(kind = self.kind().as_str(), "WeChat robot message sent");
        Ok(raw)
    }
}

// ── Application ─────────────────────────────────────────────────────

/// Application message: fetch an access token, then send a text card.
pub struct WechatAppSender {
    client: reqwest::Client,
    api_base: String,
}

impl WechatAppSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_api_base(client, API_BASE)
    }

    /// Point the sender at a different API host.
    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn access_token(&self, cfg: &WechatConfig) -> Result<String, NotifyError> {
        let request = self
            .client
            .get(format!("{}/cgi-bin/gettoken", self.api_base))
            .query(&[("corpid", cfg.corp_id.as_str()), ("corpsecret", cfg.secret.as_str())]);
        let (_, reply) = call_api(request, PROVIDER).await?;
        if reply.access_token.is_empty() {
            return Err(NotifyError::Http("wechat gettoken returned no token".into()));
        }
        Ok(reply.access_token)
    }
}

#[async_trait]
impl ChannelSender for WechatAppSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WechatApp
    }

    fn validate(&self, config: &str) -> Result<(), NotifyError> {
        let cfg: WechatConfig = parse_config(self.kind(), config)?;
        if cfg.corp_id.is_empty() || cfg.secret.is_empty() || cfg.agent_id == 0 {
            return Err(invalid(
                self.kind(),
                "corp_id, secret and agent_id are required",
            ));
        }
        if cfg.to_user.is_empty() && cfg.to_party.is_empty() && cfg.to_tag.is_empty() {
            return Err(invalid(
                self.kind(),
                "one of to_user, to_party or to_tag is required",
            ));
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
        let cfg: WechatConfig = parse_config(self.kind(), config)?;
        let token = self.access_token(&cfg).await?;

        let mut body = json!({
            "msgtype": "textcard",
            "agentid": cfg.agent_id,
            "textcard": {
                "title": subject,
                "description": content,
                "url": "",
            },
            "safe": 0,
        });
        for (field, value) in [
            ("touser", &cfg.to_user),
            ("toparty", &cfg.to_party),
            ("totag", &cfg.to_tag),
        ] {
            if !value.is_empty() {
                body[field] = json!(value);
            }
        }

        let request = self
            .client
            .post(format!("{}/cgi-bin/message/send", self.api_base))
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
    fn robot_requires_webhook_url() {
        let sender = WechatRobotSender::new(reqwest::Client::new());
        assert!(sender.validate(r#"{"type":"robot"}"#).is_err());
        assert!(sender.validate("not json").is_err());
        assert!(
            sender
                .validate(r#"{"type":"robot","webhook_url":"https://x"}"#)
                .is_ok()
        );
    }

    #[test]
    fn app_requires_recipient() {
        let sender = WechatAppSender::new(reqwest::Client::new());
        let no_target = r#"{"type":"app","corp_id":"c","secret":"s","agent_id":1000}"#;
        assert!(sender.validate(no_target).is_err());
        let no_agent = r#"{"type":"app","corp_id":"c","secret":"s","to_user":"@all"}"#;
        assert!(sender.validate(no_agent).is_err());
        let ok = r#"{"type":"app","corp_id":"c","secret":"s","agent_id":1000,"to_party":"2"}"#;
        assert!(sender.validate(ok).is_ok());
    }

    #[tokio::test]
    async fn robot_posts_markdown() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/cgi-bin/webhook/send")
            .match_query(Matcher::UrlEncoded("key".into(), "abc".into()))
            .match_body(Matcher::PartialJson(json!({
                "msgtype": "markdown",
                "markdown": { "content": "**Disk full**\n\nweb-1 at 99%" }
            })))
            .with_status(200)
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let config = json!({
            "type": "robot",
            "webhook_url": format!("{}/cgi-bin/webhook/send", server.url()),
            "key": "abc",
        })
        .to_string();
        let sender = WechatRobotSender::new(reqwest::Client::new());
        let raw = sender.send(&config, "Disk full", "web-1 at 99%").await.unwrap();
        assert!(raw.contains("\"errcode\":0"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn robot_nonzero_errcode_is_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .with_body(r#"{"errcode":93000,"errmsg":"invalid webhook url"}"#)
            .create_async()
            .await;

        let config = json!({ "type": "robot", "webhook_url": format!("{}/hook", server.url()) })
            .to_string();
        let sender = WechatRobotSender::new(reqwest::Client::new());
        let err = sender.send(&config, "t", "c").await.unwrap_err();
        assert!(matches!(err, NotifyError::Api { code: 93000, .. }));
    }

    #[tokio::test]
    async fn app_fetches_token_then_sends_textcard() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("corpid".into(), "corp".into()),
                Matcher::UrlEncoded("corpsecret".into(), "sec".into()),
            ]))
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"TOKEN","expires_in":7200}"#)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/cgi-bin/message/send")
            .match_query(Matcher::UrlEncoded("access_token".into(), "TOKEN".into()))
            .match_body(Matcher::PartialJson(json!({
                "touser": "alice",
                "msgtype": "textcard",
                "agentid": 1000002,
                "textcard": { "title": "Disk full", "description": "details" }
            })))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let config = r#"{"type":"app","corp_id":"corp","secret":"sec","agent_id":1000002,"to_user":"alice"}"#;
        let sender = WechatAppSender::with_api_base(reqwest::Client::new(), server.url());
        sender.send(config, "Disk full", "details").await.unwrap();
        token.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn app_token_failure_stops_send() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", "/cgi-bin/gettoken")
            .match_query(Matcher::Any)
            .with_body(r#"{"errcode":40013,"errmsg":"invalid corpid"}"#)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/cgi-bin/message/send")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let config = r#"{"type":"app","corp_id":"bad","secret":"sec","agent_id":1,"to_tag":"ops"}"#;
        let sender = WechatAppSender::with_api_base(reqwest::Client::new(), server.url());
        let err = sender.send(config, "t", "c").await.unwrap_err();
        assert!(matches!(err, NotifyError::Api { code: 40013, .. }));
        send.assert_async().await;
    }
}
