//! Transport bridge client: sends outgoing messages via the bridge's HTTP endpoint.

use super::{MessagingTransport, OutgoingContent, OutgoingMessage, SentMessage, TransportError};
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    to: &'a str,
    #[serde(rename = "type")]
    typ: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
}

impl<'a> From<&'a OutgoingMessage> for SendRequest<'a> {
    fn from(msg: &'a OutgoingMessage) -> Self {
        match &msg.content {
            OutgoingContent::Text(text) => SendRequest {
                to: &msg.to,
                typ: "text",
                message: text,
                media_url: None,
            },
            OutgoingContent::Media { url, caption } => SendRequest {
                to: &msg.to,
                typ: "media",
                message: caption,
                media_url: Some(url),
            },
        }
    }
}

/// Posts `{to, type, message, mediaUrl?}` to the bridge and expects `{messageId}` back.
#[derive(Clone)]
pub struct HttpBridgeTransport {
    send_url: Option<String>,
    client: reqwest::Client,
}

impl HttpBridgeTransport {
    pub fn new(send_url: Option<String>) -> Self {
        Self {
            send_url: send_url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessagingTransport for HttpBridgeTransport {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SentMessage, TransportError> {
        let url = self.send_url.as_ref().ok_or(TransportError::NotConfigured)?;
        let res = self
            .client
            .post(url)
            .json(&SendRequest::from(message))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Rejected { status, body });
        }
        Ok(res.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_send_request_shape() {
        let msg = OutgoingMessage {
            to: "336@c.us".to_string(),
            content: OutgoingContent::Media {
                url: "https://cdn.example/a.png".to_string(),
                caption: "your invoice".to_string(),
            },
        };
        let json = serde_json::to_value(SendRequest::from(&msg)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "to": "336@c.us",
                "type": "media",
                "message": "your invoice",
                "mediaUrl": "https://cdn.example/a.png"
            })
        );
    }

    #[tokio::test]
    async fn unconfigured_bridge_fails_fast() {
        let transport = HttpBridgeTransport::new(Some("  ".to_string()));
        let err = transport
            .send_message(&OutgoingMessage {
                to: "x".to_string(),
                content: OutgoingContent::Text("hi".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConfigured));
    }
}
