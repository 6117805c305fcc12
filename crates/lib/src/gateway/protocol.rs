//! Control API request bodies and client errors.

use crate::transport::{OutgoingContent, OutgoingMessage};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

/// Body of `POST /operator-active`: `{ number, operatorId?, action? }`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSignalBody {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
    /// CONNECT, TYPING, MESSAGE_SENT or DISCONNECT. Anything else counts as activity.
    #[serde(default)]
    pub action: Option<String>,
}

/// Body with only a conversation id (`/force-bot-mode`, `/bot-message-sent`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberBody {
    #[serde(default)]
    pub number: Option<String>,
}

/// Body of `POST /send-message`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// "text" (default) or "media".
    #[serde(default, rename = "type")]
    pub typ: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    /// Set by the automation when this is the bot reply; clears the pending takeover request.
    #[serde(default)]
    pub from_bot: bool,
}

impl SendMessageBody {
    /// Validate and build the outgoing message. Media without a URL is sent as text.
    pub fn into_outgoing(self) -> Result<(OutgoingMessage, bool), ControlError> {
        let to = non_empty(self.to).ok_or(ControlError::MissingSendParams)?;
        let message = self
            .message
            .filter(|m| !m.is_empty())
            .ok_or(ControlError::MissingSendParams)?;
        let content = match (self.typ.as_deref(), non_empty(self.media_url)) {
            (Some("media"), Some(url)) => OutgoingContent::Media {
                url,
                caption: message,
            },
            _ => OutgoingContent::Text(message),
        };
        Ok((OutgoingMessage { to, content }, self.from_bot))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Conversation id from a request body; missing or blank is a client error.
pub fn require_number(number: Option<String>) -> Result<String, ControlError> {
    non_empty(number).ok_or(ControlError::MissingNumber)
}

/// Malformed control input. Rejected before any state is touched.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("number is required")]
    MissingNumber,
    #[error("'to' and 'message' are required")]
    MissingSendParams,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
