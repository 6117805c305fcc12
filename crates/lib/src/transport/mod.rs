//! Messaging transport: events coming from the messaging account and outgoing sends.
//!
//! The messaging protocol lives in an external bridge process. It pushes [`TransportEvent`]s to
//! the gateway (`POST /transport/events`) and receives outgoing messages through a
//! [`MessagingTransport`] implementation.

mod bridge;

pub use bridge::HttpBridgeTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Sender id of status broadcasts, which are never relayed.
pub const STATUS_BROADCAST: &str = "status@broadcast";
/// Suffix of group conversation ids, which are never relayed.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Event reported by the transport bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A message arrived from a contact.
    Message(InboundMessage),
    /// A message was created on the account; `fromMe` marks operator replies.
    MessageCreate(CreatedMessage),
    /// Pairing code to scan.
    Qr { code: String },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
}

/// Inbound message; media is downloaded by the bridge and only described here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
    /// Set when the bridge could not download the media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedMessage {
    pub to: String,
    #[serde(default)]
    pub from_me: bool,
}

/// True for senders the relay ignores (status broadcasts, groups).
pub fn is_ignored_sender(from: &str) -> bool {
    from == STATUS_BROADCAST || from.contains(GROUP_SUFFIX)
}

/// Content of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingContent {
    Text(String),
    Media { url: String, caption: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub content: OutgoingContent,
}

/// Transport acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport send url not configured")]
    NotConfigured,
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport rejected message: {status} {body}")]
    Rejected { status: u16, body: String },
}

/// Outgoing side of the messaging account.
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError>;
}

/// Connection state of the transport as last reported by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransportStatus {
    Starting,
    AwaitingQr,
    Ready,
    AuthFailed { reason: String },
    Disconnected { reason: String },
}

impl TransportStatus {
    pub fn is_healthy(&self) -> bool {
        !matches!(
            self,
            TransportStatus::AuthFailed { .. } | TransportStatus::Disconnected { .. }
        )
    }
}

/// Shared, updatable transport status.
#[derive(Debug, Clone)]
pub struct TransportHealth {
    inner: Arc<RwLock<TransportStatus>>,
}

impl Default for TransportHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportHealth {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TransportStatus::Starting)),
        }
    }

    pub async fn set(&self, status: TransportStatus) {
        *self.inner.write().await = status;
    }

    pub async fn get(&self) -> TransportStatus {
        self.inner.read().await.clone()
    }
}
