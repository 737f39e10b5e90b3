//! Generic HTTP webhook sender.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::mail::reference_now;
use crate::notify::model::ChannelKind;
use crate::notify::sender::{ChannelSender, invalid, parse_config};

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

const CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/x-www-form-urlencoded",
    "text/plain",
    "text/xml",
    "application/xml",
];

const MAX_TIMEOUT_SECS: i64 = 300;
const MAX_RETRIES: i64 = 10;

/// Stored webhook configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    /// Defaults to POST.
    pub method: String,
    pub headers: HashMap<String, String>,
    /// Defaults to `application/json`.
    pub content_type: String,
    /// `none`, `basic`, `bearer` or `apikey`.
    pub auth_type: String,
    pub username: String,
    pub password: String,
    /// Bearer token or API key.
    pub token: String,
    /// Seconds; 0 keeps the client default.
    pub timeout: i64,
    /// Attempts; 0 still means one attempt.
    pub retries: i64,
    pub skip_ssl: bool,
    /// Raw body with `{{title}}`, `{{content}}`, `{{timestamp}}`, `{{level}}`, `{{source}}`.
    pub template: String,
}

impl WebhookConfig {
    fn method(&self) -> &str {
        if self.method.is_empty() { "POST" } else { &self.method }
    }

    fn content_type(&self) -> String {
        if self.content_type.is_empty() {
            "application/json".to_string()
        } else {
            self.content_type.to_ascii_lowercase()
        }
    }
}

/// Default JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub title: String,
    pub content: String,
    pub timestamp: String,
    pub level: String,
    pub source: String,
    pub tags: Vec<String>,
}

impl WebhookPayload {
    pub fn new(title: &str, content: &str) -> Self {
        Self {
            title: title.to_string(),
            content: content.to_string(),
            timestamp: reference_now().format("%Y-%m-%d %H:%M:%S").to_string(),
            level: "info".to_string(),
            source: "MailAlert".to_string(),
            tags: vec!["email".to_string(), "alert".to_string()],
        }
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{{title}}", &self.title)
            .replace("{{content}}", &self.content)
            .replace("{{timestamp}}", &self.timestamp)
            .replace("{{level}}", &self.level)
            .replace("{{source}}", &self.source)
    }
}

pub struct WebhookSender {
    client: reqwest::Client,
    backoff_unit: Duration,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            backoff_unit: Duration::from_secs(2),
        }
    }

    /// Attempt `i` waits `i * unit` before it starts.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn client_for(&self, cfg: &WebhookConfig) -> Result<reqwest::Client, NotifyError> {
        if !cfg.skip_ssl {
            return Ok(self.client.clone());
        }
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| NotifyError::Http(format!("failed to build webhook client: {e}")))
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        cfg: &WebhookConfig,
        payload: &WebhookPayload,
    ) -> Result<reqwest::RequestBuilder, NotifyError> {
        let method = Method::from_bytes(cfg.method().to_ascii_uppercase().as_bytes())
            .map_err(|e| invalid(ChannelKind::Webhook, format!("bad method: {e}")))?;
        let content_type = cfg.content_type();

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        for (name, value) in &cfg.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping invalid webhook header"),
            }
        }

        let mut request = client.request(method, &cfg.url).headers(headers);
        if cfg.timeout > 0 {
            request = request.timeout(Duration::from_secs(cfg.timeout.unsigned_abs()));
        }

        request = if content_type.starts_with("application/x-www-form-urlencoded") {
            request.form(&[
                ("title", payload.title.as_str()),
                ("content", payload.content.as_str()),
                ("timestamp", payload.timestamp.as_str()),
                ("level", payload.level.as_str()),
                ("source", payload.source.as_str()),
            ])
        } else if content_type.starts_with("text/plain") {
            request.body(format!(
                "Title: {}\nContent: {}\nTime: {}",
                payload.title, payload.content, payload.timestamp
            ))
        } else if !cfg.template.is_empty() {
            request.body(payload.render(&cfg.template))
        } else {
            let body = serde_json::to_string(payload)
                .map_err(|e| NotifyError::Http(format!("failed to encode payload: {e}")))?;
            request.body(body)
        };

        request = match cfg.auth_type.to_ascii_lowercase().as_str() {
            "basic" => request.basic_auth(&cfg.username, Some(&cfg.password)),
            "bearer" => request.bearer_auth(&cfg.token),
            "apikey" => request.header("X-API-Key", cfg.token.as_str()),
            _ => request,
        };
        Ok(request)
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        cfg: &WebhookConfig,
        payload: &WebhookPayload,
    ) -> Result<String, NotifyError> {
        let resp = self
            .build_request(client, cfg, payload)?
            .send()
            .await
            .map_err(|e| NotifyError::Http(format!("webhook request failed: {e}")))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(format!("HTTP {}: {body}", status.as_u16()))
        } else {
            Err(NotifyError::Http(format!("HTTP {}: {body}", status.as_u16())))
        }
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn validate(&self, config: &str) -> Result<(), NotifyError> {
        let cfg: WebhookConfig = parse_config(self.kind(), config)?;
        if cfg.url.trim().is_empty() {
            return Err(invalid(self.kind(), "url is required"));
        }
        reqwest::Url::parse(&cfg.url)
            .map_err(|e| invalid(self.kind(), format!("invalid url: {e}")))?;

        if !cfg.method.is_empty() && !METHODS.contains(&cfg.method.to_ascii_uppercase().as_str()) {
            return Err(invalid(self.kind(), format!("unsupported method {}", cfg.method)));
        }
        if !cfg.content_type.is_empty() {
            let ct = cfg.content_type.to_ascii_lowercase();
            if !CONTENT_TYPES.iter().any(|v| ct.starts_with(v)) {
                return Err(invalid(
                    self.kind(),
                    format!("unsupported content type {}", cfg.content_type),
                ));
            }
        }
        match cfg.auth_type.to_ascii_lowercase().as_str() {
            "" | "none" => {}
            "basic" if cfg.username.is_empty() || cfg.password.is_empty() => {
                return Err(invalid(self.kind(), "basic auth needs username and password"));
            }
            "bearer" | "apikey" if cfg.token.is_empty() => {
                return Err(invalid(
                    self.kind(),
                    format!("{} auth needs a token", cfg.auth_type),
                ));
            }
            "basic" | "bearer" | "apikey" => {}
            other => {
                return Err(invalid(self.kind(), format!("unsupported auth type {other}")));
            }
        }
        if !(0..=MAX_TIMEOUT_SECS).contains(&cfg.timeout) {
            return Err(invalid(self.kind(), "timeout must be within 0-300 seconds"));
        }
        if !(0..=MAX_RETRIES).contains(&cfg.retries) {
            return Err(invalid(self.kind(), "retries must be within 0-10"));
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
        let cfg: WebhookConfig = parse_config(self.kind(), config)?;
        let client = self.client_for(&cfg)?;
        let payload = WebhookPayload::new(subject, content);
        let attempts = cfg.retries.max(1).unsigned_abs() as u32;

        let mut last_err = None;
        for i in 0..attempts {
            if i > 0 {
                tokio::time::sleep(self.backoff_unit * i).await;
            }
            match self.attempt(&client, &cfg, &payload).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(attempt = i + 1, attempts, "Webhook attempt failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| NotifyError::Http("webhook not attempted".into())))
    }
}
