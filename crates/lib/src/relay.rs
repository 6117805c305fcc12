//! Transport event processing: the single stream through which messaging events reach the core.
//!
//! Inbound messages are forwarded to the automation regardless of ownership; operator replies
//! (`fromMe`) mark the conversation operator-controlled; a transport disconnect hands every
//! conversation to the bot.

use crate::dispatch::{Dispatcher, ForwardedOwnership, InboundForward, MediaInfo};
use crate::ownership::OwnershipEngine;
use crate::session::ConversationState;
use crate::transport::{
    is_ignored_sender, InboundMessage, TransportEvent, TransportHealth, TransportStatus,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

/// Handles transport events against the ownership engine.
#[derive(Clone)]
pub struct Relay {
    engine: OwnershipEngine,
    dispatcher: Dispatcher,
    health: TransportHealth,
}

impl Relay {
    pub fn new(engine: OwnershipEngine, dispatcher: Dispatcher, health: TransportHealth) -> Self {
        Self {
            engine,
            dispatcher,
            health,
        }
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => self.handle_inbound(msg).await,
            TransportEvent::MessageCreate(created) => {
                if created.from_me && !is_ignored_sender(&created.to) {
                    self.engine.mark_operator_active(&created.to).await;
                    self.engine.metrics().operator_response();
                    log::info!("operator: manual reply detected for {} (timer reset)", created.to);
                }
            }
            TransportEvent::Qr { code } => {
                log::info!("transport: scan this pairing code with the messaging app: {}", code);
                self.health.set(TransportStatus::AwaitingQr).await;
            }
            TransportEvent::Ready => {
                log::info!("transport: connected and ready");
                self.health.set(TransportStatus::Ready).await;
            }
            TransportEvent::AuthFailure { message } => {
                log::error!("transport: authentication failed: {}", message);
                self.health
                    .set(TransportStatus::AuthFailed { reason: message })
                    .await;
            }
            TransportEvent::Disconnected { reason } => {
                log::error!("transport: disconnected: {}", reason);
                self.health
                    .set(TransportStatus::Disconnected { reason })
                    .await;
                let switched = self.engine.on_transport_disconnected().await;
                log::info!("transport: {} conversation(s) fell back to bot mode", switched);
            }
        }
    }

    async fn handle_inbound(&self, msg: InboundMessage) {
        if is_ignored_sender(&msg.from) {
            log::debug!("inbound: ignoring message from {}", msg.from);
            return;
        }
        self.engine.metrics().message_received();
        let state = self.engine.record_inbound(&msg.from).await;
        let payload = build_forward(&msg, &state, self.engine.now());
        self.dispatcher.forward_inbound(payload);
    }
}

/// Build the automation payload for an inbound message.
pub fn build_forward(
    msg: &InboundMessage,
    state: &ConversationState,
    timestamp: DateTime<Utc>,
) -> InboundForward {
    let mut payload = InboundForward {
        number: msg.from.clone(),
        timestamp,
        operator_active: state.operator_active,
        conversation_state: ForwardedOwnership {
            operator_active: state.operator_active,
            last_operator_activity: state.last_operator_activity,
            is_operator_inactive: state.is_operator_inactive,
        },
        msg_type: "text".to_string(),
        message: msg.body.clone(),
        media_info: None,
        caption: None,
    };
    if !msg.has_media {
        return payload;
    }
    match (&msg.media_error, &msg.media) {
        (Some(error), _) => {
            payload.msg_type = "media".to_string();
            payload.media_info = Some(MediaInfo::Failed {
                error: error.clone(),
            });
        }
        (None, media) => {
            let mimetype = media.as_ref().and_then(|m| m.mimetype.clone());
            payload.msg_type = mimetype
                .as_deref()
                .and_then(|m| m.split('/').next())
                .filter(|major| !major.is_empty())
                .unwrap_or("media")
                .to_string();
            payload.media_info = Some(MediaInfo::Attached {
                has_media: true,
                mimetype,
                filename: media.as_ref().and_then(|m| m.filename.clone()),
            });
            if !msg.body.is_empty() {
                payload.caption = Some(msg.body.clone());
            }
        }
    }
    payload
}

/// Process transport events one at a time until the sender side closes.
pub async fn run_event_loop(relay: Relay, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        relay.handle_event(event).await;
    }
    log::debug!("transport: event queue closed, processor stopped");
}

/// Periodically reap idle sessions and hand over stale operators until aborted.
pub async fn reaper_loop(engine: OwnershipEngine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = engine.reap_idle().await;
        let expired = engine.expire_stale_operators().await;
        if !removed.is_empty() || !expired.is_empty() {
            log::info!(
                "reaper: {} session(s) removed, {} stale operator(s) handed over",
                removed.len(),
                expired.len()
            );
        }
    }
}
