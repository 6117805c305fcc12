//! Notification dispatch to the external automation endpoint.
//!
//! Two calls: forwarding inbound conversation events (always) and requesting a bot takeover.
//! Both are fire-and-forget: the dispatcher spawns the delivery and logs failures, so a slow or
//! broken endpoint never blocks event processing or leaves session state stuck.

mod webhook;

pub use webhook::WebhookClient;

use crate::session::{ConversationId, Trigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Context tag sent with every takeover request.
pub const TAKEOVER_CONTEXT: &str = "BOT_TAKEOVER";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{0} url not configured")]
    NotConfigured(&'static str),
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Body of a bot takeover request: `{number, trigger, timestamp, context}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverRequest {
    pub number: ConversationId,
    pub trigger: Trigger,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub context: String,
}

impl TakeoverRequest {
    pub fn new(number: impl Into<ConversationId>, trigger: Trigger, timestamp: DateTime<Utc>) -> Self {
        Self {
            number: number.into(),
            trigger,
            timestamp,
            context: TAKEOVER_CONTEXT.to_string(),
        }
    }
}

/// Ownership summary embedded in a forwarded inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedOwnership {
    pub operator_active: bool,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_operator_activity: Option<DateTime<Utc>>,
    pub is_operator_inactive: bool,
}

/// Media metadata of a forwarded message; the bytes themselves are never forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MediaInfo {
    #[serde(rename_all = "camelCase")]
    Attached {
        has_media: bool,
        mimetype: Option<String>,
        filename: Option<String>,
    },
    Failed {
        error: String,
    },
}

/// Body of an inbound forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundForward {
    pub number: ConversationId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub operator_active: bool,
    pub conversation_state: ForwardedOwnership,
    pub msg_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_info: Option<MediaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// The automation endpoint as seen by the core.
#[async_trait]
pub trait AutomationEndpoint: Send + Sync {
    async fn forward_inbound(&self, payload: &InboundForward) -> Result<(), DispatchError>;
    async fn request_bot_takeover(&self, payload: &TakeoverRequest) -> Result<(), DispatchError>;
}

/// Spawns deliveries to an [`AutomationEndpoint`] and logs their outcome.
#[derive(Clone)]
pub struct Dispatcher {
    endpoint: Arc<dyn AutomationEndpoint>,
}

impl Dispatcher {
    pub fn new(endpoint: Arc<dyn AutomationEndpoint>) -> Self {
        Self { endpoint }
    }

    /// Forward an inbound message. The returned handle may be ignored.
    pub fn forward_inbound(&self, payload: InboundForward) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            match endpoint.forward_inbound(&payload).await {
                Ok(()) => log::info!("inbound: message from {} forwarded to automation", payload.number),
                Err(e) => log::error!("inbound: forwarding message from {} failed: {}", payload.number, e),
            }
        })
    }

    /// Ask the automation to produce a bot reply. The returned handle may be ignored.
    pub fn request_bot_takeover(&self, payload: TakeoverRequest) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            match endpoint.request_bot_takeover(&payload).await {
                Ok(()) => log::info!(
                    "bot: takeover requested for {} ({})",
                    payload.number,
                    payload.trigger
                ),
                Err(e) => log::error!(
                    "bot: takeover request for {} ({}) failed: {}",
                    payload.number,
                    payload.trigger,
                    e
                ),
            }
        })
    }
}
