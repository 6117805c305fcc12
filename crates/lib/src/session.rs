//! Conversation sessions and the store that owns them.
//!
//! One session per conversation id (phone number / account id). Sessions are created lazily
//! on first reference and removed by the reaper. Fields are only mutated by the ownership
//! engine; everything else reads through the accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Conversation identifier (opaque string, e.g. `33612345678@c.us`).
pub type ConversationId = String;

/// Why the bot is being asked to take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    OperatorTimeout,
    OperatorDisconnect,
    ForcedBotMode,
    AutoResponse,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::OperatorTimeout => "OPERATOR_TIMEOUT",
            Trigger::OperatorDisconnect => "OPERATOR_DISCONNECT",
            Trigger::ForcedBotMode => "FORCED_BOT_MODE",
            Trigger::AutoResponse => "AUTO_RESPONSE",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a scheduled task does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledKind {
    /// Operator went quiet: switch to bot mode and request a response.
    Takeover,
    /// Request a bot response after a short delay (disconnect, forced bot mode).
    DeferredRequest(Trigger),
}

/// The single scheduled task slot of a session. Dropping it does not cancel the task; use [`ScheduledTask::cancel`].
#[derive(Debug)]
pub struct ScheduledTask {
    id: u64,
    kind: ScheduledKind,
    handle: AbortHandle,
}

impl ScheduledTask {
    pub fn new(id: u64, kind: ScheduledKind, handle: AbortHandle) -> Self {
        Self { id, kind, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ScheduledKind {
        self.kind
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// An in-flight bot takeover request. Live until `deadline` or until confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: uuid::Uuid,
    pub trigger: Trigger,
    pub deadline: DateTime<Utc>,
}

impl PendingRequest {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.deadline
    }
}

/// Ownership state of one conversation.
#[derive(Debug)]
pub struct ConversationSession {
    pub(crate) id: ConversationId,
    pub(crate) operator_active: bool,
    pub(crate) last_operator_activity: Option<DateTime<Utc>>,
    pub(crate) last_message_time: DateTime<Utc>,
    pub(crate) pending: Option<PendingRequest>,
    pub(crate) scheduled: Option<ScheduledTask>,
}

impl ConversationSession {
    /// Fresh session: bot-controlled, no timers, nothing pending.
    pub fn new(id: impl Into<ConversationId>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            operator_active: false,
            last_operator_activity: None,
            last_message_time: now,
            pending: None,
            scheduled: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operator_active(&self) -> bool {
        self.operator_active
    }

    pub fn last_operator_activity(&self) -> Option<DateTime<Utc>> {
        self.last_operator_activity
    }

    pub fn last_message_time(&self) -> DateTime<Utc> {
        self.last_message_time
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// True while a takeover request is in flight and its debounce window has not elapsed.
    pub fn pending_bot_response(&self, now: DateTime<Utc>) -> bool {
        self.pending.as_ref().is_some_and(|p| p.is_live(now))
    }

    pub fn scheduled_kind(&self) -> Option<ScheduledKind> {
        self.scheduled.as_ref().map(|t| t.kind())
    }

    pub fn takeover_armed(&self) -> bool {
        self.scheduled_kind() == Some(ScheduledKind::Takeover)
    }

    /// True if the operator was never active, or has been quiet longer than `timeout`.
    pub fn is_operator_inactive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (self.operator_active, self.last_operator_activity) {
            (true, Some(last)) => {
                let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
                now - last > timeout
            }
            _ => true,
        }
    }

    /// Cancel whatever is in the scheduled slot. Returns the kind that was cancelled.
    pub(crate) fn cancel_scheduled(&mut self) -> Option<ScheduledKind> {
        self.scheduled.take().map(|task| {
            let kind = task.kind();
            task.cancel();
            kind
        })
    }

    /// Put `task` in the slot, cancelling the previous one first.
    pub(crate) fn arm(&mut self, task: ScheduledTask) {
        self.cancel_scheduled();
        self.scheduled = Some(task);
    }

    /// Take the slot if it still holds task `id`; a superseded task gets None.
    pub(crate) fn take_scheduled_if(&mut self, id: u64) -> Option<ScheduledKind> {
        match &self.scheduled {
            Some(task) if task.id() == id => self.scheduled.take().map(|t| t.kind()),
            _ => None,
        }
    }

    /// Read-only view for the control API and inbound payloads.
    pub fn view(&self, now: DateTime<Utc>, operator_timeout: Duration) -> ConversationState {
        ConversationState {
            number: self.id.clone(),
            operator_active: self.operator_active,
            last_operator_activity: self.last_operator_activity,
            last_message_time: self.last_message_time,
            is_operator_inactive: self.is_operator_inactive(now, operator_timeout),
            pending_bot_response: self.pending_bot_response(now),
        }
    }
}

/// Snapshot of a session's observable state. Timestamps serialize as Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub number: ConversationId,
    pub operator_active: bool,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_operator_activity: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_message_time: DateTime<Utc>,
    pub is_operator_inactive: bool,
    pub pending_bot_response: bool,
}

/// Map of conversation id to session. Not synchronized; the ownership engine guards it with one mutex.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<ConversationId, ConversationSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, creating a default one if missing.
    pub fn get_or_create(&mut self, id: &str, now: DateTime<Utc>) -> &mut ConversationSession {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| ConversationSession::new(id, now))
    }

    pub fn get(&self, id: &str) -> Option<&ConversationSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ConversationSession> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session, cancelling its scheduled task first.
    pub fn remove(&mut self, id: &str) -> Option<ConversationSession> {
        let mut session = self.sessions.remove(id)?;
        session.cancel_scheduled();
        Some(session)
    }

    pub fn all(&self) -> impl Iterator<Item = &ConversationSession> {
        self.sessions.values()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut ConversationSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of sessions with no inbound message for longer than `threshold`.
    pub fn idle_ids(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<ConversationId> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.sessions
            .values()
            .filter(|s| now - s.last_message_time > threshold)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Cancel every scheduled task (shutdown).
    pub fn cancel_all(&mut self) -> usize {
        self.sessions
            .values_mut()
            .filter_map(|s| s.cancel_scheduled())
            .count()
    }
}
