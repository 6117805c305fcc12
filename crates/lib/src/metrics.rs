//! Process-wide relay counters exposed on `GET /metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bot_responses: AtomicU64,
    operator_responses: AtomicU64,
    session_switches: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bot_responses: u64,
    pub operator_responses: u64,
    pub session_switches: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bot_response(&self) {
        self.bot_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operator_response(&self) {
        self.operator_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_switch(&self) {
        self.session_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bot_responses: self.bot_responses.load(Ordering::Relaxed),
            operator_responses: self.operator_responses.load(Ordering::Relaxed),
            session_switches: self.session_switches.load(Ordering::Relaxed),
        }
    }
}
