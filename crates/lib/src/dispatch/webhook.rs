//! HTTP webhook client for the automation endpoint (e.g. n8n webhook nodes).

use super::{AutomationEndpoint, DispatchError, InboundForward, TakeoverRequest};
use crate::config::{self, Config};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Posts JSON to the configured inbound and bot-response URLs.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    inbound_url: Option<String>,
    bot_response_url: Option<String>,
}

impl WebhookClient {
    pub fn new(inbound_url: Option<String>, bot_response_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("webhook: building client with timeout failed ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            client,
            inbound_url,
            bot_response_url,
        }
    }

    /// Build from config; env overrides for both URLs apply.
    pub fn from_config(config: &Config) -> Self {
        let inbound = config::resolve_inbound_webhook_url(config);
        let bot = config::resolve_bot_response_url(config);
        if inbound.is_none() {
            log::warn!("webhook: no inbound webhook url configured; inbound messages will not be forwarded");
        }
        if bot.is_none() {
            log::warn!("webhook: no bot response url configured; takeover requests will fail");
        }
        Self::new(
            inbound,
            bot,
            Duration::from_secs(config.automation.request_timeout_secs.max(1)),
        )
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), DispatchError> {
        let res = self.client.post(url).json(body).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(DispatchError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationEndpoint for WebhookClient {
    async fn forward_inbound(&self, payload: &InboundForward) -> Result<(), DispatchError> {
        let url = self
            .inbound_url
            .as_deref()
            .ok_or(DispatchError::NotConfigured("inbound webhook"))?;
        self.post_json(url, payload).await
    }

    async fn request_bot_takeover(&self, payload: &TakeoverRequest) -> Result<(), DispatchError> {
        let url = self
            .bot_response_url
            .as_deref()
            .ok_or(DispatchError::NotConfigured("bot response"))?;
        self.post_json(url, payload).await
    }
}
