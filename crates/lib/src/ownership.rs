//! Ownership state machine: who answers a conversation next, the operator or the bot.
//!
//! Two states per session, OperatorControlled and BotControlled (the default). Operator activity
//! enters OperatorControlled and (re)arms a takeover task for the current operator timeout; when it
//! fires the session switches to BotControlled and the automation is asked for a reply. Disconnect,
//! forced bot mode and transport loss switch to BotControlled directly.
//!
//! All session state and the live settings sit behind one mutex, so a transition, the
//! cancellation of the previous task and the arming of the next one are atomic with respect
//! to each other. Scheduled tasks carry an id and check it against the session slot when they
//! fire, so a superseded task never transitions anything.

use crate::clock::Clock;
use crate::config::OwnershipConfig;
use crate::dispatch::{Dispatcher, TakeoverRequest};
use crate::metrics::Metrics;
use crate::persistence::{SessionRecord, Snapshot};
use crate::session::{
    ConversationId, ConversationSession, ConversationState, PendingRequest, ScheduledKind,
    ScheduledTask, SessionStore, Trigger,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Duplicate takeover requests within this window are dropped.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(3);

/// Delay between a forced switch to bot mode and the bot request.
pub const FORCED_BOT_DELAY: Duration = Duration::from_millis(500);

/// Operator signal received on the control API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorAction {
    Connect,
    Typing,
    MessageSent,
    Disconnect,
    /// Unknown or missing action; treated as operator activity.
    Other(String),
}

impl OperatorAction {
    pub fn parse(action: Option<&str>) -> Self {
        match action.map(str::trim).unwrap_or("") {
            "CONNECT" => OperatorAction::Connect,
            "TYPING" => OperatorAction::Typing,
            "MESSAGE_SENT" => OperatorAction::MessageSent,
            "DISCONNECT" => OperatorAction::Disconnect,
            other => OperatorAction::Other(other.to_string()),
        }
    }
}

/// Live ownership timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipSettings {
    pub operator_timeout: Duration,
    pub bot_delay: Duration,
    pub cleanup_threshold: Duration,
}

impl From<&OwnershipConfig> for OwnershipSettings {
    fn from(config: &OwnershipConfig) -> Self {
        Self {
            operator_timeout: config.operator_timeout(),
            bot_delay: config.bot_delay(),
            cleanup_threshold: config.cleanup_threshold(),
        }
    }
}

impl Default for OwnershipSettings {
    fn default() -> Self {
        Self::from(&OwnershipConfig::default())
    }
}

impl OwnershipSettings {
    pub fn view(&self) -> SettingsView {
        SettingsView {
            operator_timeout_ms: millis(self.operator_timeout),
            bot_delay_ms: millis(self.bot_delay),
            cleanup_threshold_ms: millis(self.cleanup_threshold),
            debounce_window_ms: millis(DEBOUNCE_WINDOW),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Settings as reported by `GET /config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub operator_timeout_ms: u64,
    pub bot_delay_ms: u64,
    pub cleanup_threshold_ms: u64,
    pub debounce_window_ms: u64,
}

/// Partial settings update. Fractions are allowed; absent, zero, negative or non-finite values
/// leave the setting unchanged. Values too large for a `Duration` saturate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default, alias = "operatorTimeout")]
    pub operator_timeout_minutes: Option<f64>,
    #[serde(default, alias = "botDelay")]
    pub bot_delay_seconds: Option<f64>,
}

fn positive_duration(value: Option<f64>, unit_secs: f64) -> Option<Duration> {
    let value = value.filter(|v| v.is_finite() && *v > 0.0)?;
    Some(Duration::try_from_secs_f64(value * unit_secs).unwrap_or(Duration::MAX))
}

struct State {
    sessions: SessionStore,
    settings: OwnershipSettings,
}

struct Inner {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    next_task_id: AtomicU64,
}

/// Owns the session store and performs every session mutation. Cheap to clone.
#[derive(Clone)]
pub struct OwnershipEngine {
    inner: Arc<Inner>,
}

impl OwnershipEngine {
    pub fn new(
        settings: OwnershipSettings,
        clock: Arc<dyn Clock>,
        dispatcher: Dispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    sessions: SessionStore::new(),
                    settings,
                }),
                clock,
                dispatcher,
                metrics,
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    // --- transitions (caller holds the state lock) ---

    /// Spawn a task that fires after `delay` and put it in the session's slot.
    fn arm(&self, session: &mut ConversationSession, kind: ScheduledKind, delay: Duration) {
        let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let engine = self.clone();
        let id = session.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.fire_scheduled(&id, task_id).await;
        });
        session.arm(ScheduledTask::new(task_id, kind, handle.abort_handle()));
    }

    fn enter_operator_mode(
        &self,
        session: &mut ConversationSession,
        now: DateTime<Utc>,
        timeout: Duration,
    ) {
        let was_active = session.operator_active;
        session.operator_active = true;
        session.last_operator_activity = Some(now);
        session.cancel_scheduled();
        self.arm(session, ScheduledKind::Takeover, timeout);
        if !was_active {
            self.inner.metrics.session_switch();
            log::info!("operator: {} is now operator-controlled", session.id);
        } else {
            log::debug!("operator: activity for {}, takeover timer reset", session.id);
        }
    }

    fn enter_bot_mode(&self, session: &mut ConversationSession) -> bool {
        let was_active = session.operator_active;
        session.operator_active = false;
        session.last_operator_activity = None;
        session.cancel_scheduled();
        if was_active {
            self.inner.metrics.session_switch();
            log::info!("bot: {} is now bot-controlled", session.id);
        }
        was_active
    }

    fn request_locked(
        &self,
        session: &mut ConversationSession,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> bool {
        if session.pending_bot_response(now) {
            log::debug!(
                "bot: takeover request for {} ({}) suppressed, one already pending",
                session.id,
                trigger
            );
            return false;
        }
        let window = chrono::Duration::from_std(DEBOUNCE_WINDOW).unwrap_or(chrono::Duration::zero());
        session.pending = Some(PendingRequest {
            id: uuid::Uuid::new_v4(),
            trigger,
            deadline: now + window,
        });
        self.inner.metrics.bot_response();
        self.inner
            .dispatcher
            .request_bot_takeover(TakeoverRequest::new(session.id.clone(), trigger, now));
        true
    }

    async fn fire_scheduled(&self, id: &str, task_id: u64) {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let Some(session) = state.sessions.get_mut(id) else {
            return;
        };
        match session.take_scheduled_if(task_id) {
            Some(ScheduledKind::Takeover) => {
                log::info!("bot: taking over {} (operator timeout)", id);
                self.enter_bot_mode(session);
                self.request_locked(session, Trigger::OperatorTimeout, now);
            }
            Some(ScheduledKind::DeferredRequest(trigger)) => {
                self.request_locked(session, trigger, now);
            }
            None => log::debug!("bot: superseded task {} for {} ignored", task_id, id),
        }
    }

    // --- state machine operations ---

    /// Operator is acting on `id`: operator-controlled, activity refreshed, takeover re-armed.
    pub async fn mark_operator_active(&self, id: &str) -> ConversationState {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let timeout = state.settings.operator_timeout;
        let session = state.sessions.get_or_create(id, now);
        self.enter_operator_mode(session, now, timeout);
        session.view(now, timeout)
    }

    /// Switch `id` to bot control and cancel its scheduled task. Idempotent.
    pub async fn activate_bot_mode(&self, id: &str) -> ConversationState {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let timeout = state.settings.operator_timeout;
        let session = state.sessions.get_or_create(id, now);
        self.enter_bot_mode(session);
        session.view(now, timeout)
    }

    /// Re-arm the takeover task of `id` with `delay`. No-op (returns false) unless the operator is active.
    pub async fn schedule_takeover(&self, id: &str, delay: Duration) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.sessions.get_mut(id) else {
            return false;
        };
        if !session.operator_active {
            return false;
        }
        self.arm(session, ScheduledKind::Takeover, delay);
        true
    }

    /// Pure query: true if the operator of `id` was never active or has been quiet past the timeout.
    pub async fn is_operator_inactive(&self, id: &str) -> bool {
        let state = self.inner.state.lock().await;
        let now = self.now();
        state
            .sessions
            .get(id)
            .map_or(true, |s| s.is_operator_inactive(now, state.settings.operator_timeout))
    }

    /// Ask the automation for a bot reply unless a request is already pending. Returns whether one was sent.
    pub async fn request_bot_response(&self, id: &str, trigger: Trigger) -> bool {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let session = state.sessions.get_or_create(id, now);
        self.request_locked(session, trigger, now)
    }

    /// Control-API operator signal.
    pub async fn on_operator_signal(&self, id: &str, action: &OperatorAction) -> ConversationState {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let settings = state.settings;
        let session = state.sessions.get_or_create(id, now);
        match action {
            OperatorAction::Disconnect => {
                self.enter_bot_mode(session);
                self.arm(
                    session,
                    ScheduledKind::DeferredRequest(Trigger::OperatorDisconnect),
                    settings.bot_delay,
                );
                log::info!("operator: disconnected from {}", id);
            }
            OperatorAction::Connect | OperatorAction::Typing | OperatorAction::MessageSent => {
                self.enter_operator_mode(session, now, settings.operator_timeout);
            }
            OperatorAction::Other(raw) => {
                log::debug!("operator: unknown action {:?} for {}, treated as activity", raw, id);
                self.enter_operator_mode(session, now, settings.operator_timeout);
            }
        }
        session.view(now, settings.operator_timeout)
    }

    /// Force bot mode for `id` and request a bot reply shortly after.
    pub async fn force_bot_mode(&self, id: &str) -> ConversationState {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let timeout = state.settings.operator_timeout;
        let session = state.sessions.get_or_create(id, now);
        self.enter_bot_mode(session);
        self.arm(
            session,
            ScheduledKind::DeferredRequest(Trigger::ForcedBotMode),
            FORCED_BOT_DELAY,
        );
        log::info!("bot: forced bot mode for {}", id);
        session.view(now, timeout)
    }

    /// Current state of `id` (created lazily).
    pub async fn get_state(&self, id: &str) -> ConversationState {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let timeout = state.settings.operator_timeout;
        state.sessions.get_or_create(id, now).view(now, timeout)
    }

    /// The bot reply for `id` went out: clear the pending request. Unknown ids are ignored.
    pub async fn confirm_bot_message_sent(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.sessions.get_mut(id) {
            Some(session) => {
                session.pending = None;
                log::info!("bot: reply confirmed sent for {}", id);
                true
            }
            None => false,
        }
    }

    /// Inbound message on `id`: refresh its message time. Ownership is unaffected.
    pub async fn record_inbound(&self, id: &str) -> ConversationState {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let timeout = state.settings.operator_timeout;
        let session = state.sessions.get_or_create(id, now);
        session.last_message_time = now;
        session.view(now, timeout)
    }

    pub async fn settings(&self) -> OwnershipSettings {
        self.inner.state.lock().await.settings
    }

    /// Apply a runtime settings update. Already armed tasks keep their original deadline.
    pub async fn update_config(&self, update: ConfigUpdate) -> OwnershipSettings {
        let mut state = self.inner.state.lock().await;
        if let Some(timeout) = positive_duration(update.operator_timeout_minutes, 60.0) {
            state.settings.operator_timeout = timeout;
            log::info!("config: operator timeout set to {:?}", timeout);
        }
        if let Some(delay) = positive_duration(update.bot_delay_seconds, 1.0) {
            state.settings.bot_delay = delay;
            log::info!("config: bot delay set to {:?}", delay);
        }
        state.settings
    }

    /// The messaging transport went down: every session falls back to bot control.
    pub async fn on_transport_disconnected(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let mut switched = 0;
        for session in state.sessions.all_mut() {
            if self.enter_bot_mode(session) {
                switched += 1;
                log::info!("transport: {} switched to bot mode (transport disconnected)", session.id);
            }
        }
        switched
    }

    /// Remove sessions idle past the cleanup threshold. Returns the removed ids.
    pub async fn reap_idle(&self) -> Vec<ConversationId> {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let threshold = state.settings.cleanup_threshold;
        let idle = state.sessions.idle_ids(now, threshold);
        for id in &idle {
            state.sessions.remove(id);
            log::info!("reaper: session {} removed", id);
        }
        idle
    }

    /// Hand over operator-active sessions whose operator went quiet with no takeover armed
    /// (e.g. restored from a snapshot). Returns the ids handed over.
    pub async fn expire_stale_operators(&self) -> Vec<ConversationId> {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let timeout = state.settings.operator_timeout;
        let mut expired = Vec::new();
        for session in state.sessions.all_mut() {
            if session.operator_active
                && !session.takeover_armed()
                && session.is_operator_inactive(now, timeout)
            {
                log::info!("bot: taking over {} (stale operator)", session.id);
                self.enter_bot_mode(session);
                self.request_locked(session, Trigger::OperatorTimeout, now);
                expired.push(session.id.clone());
            }
        }
        expired
    }

    /// Ownership fields of every session.
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .all()
            .map(|s| (s.id.clone(), SessionRecord::from(s)))
            .collect()
    }

    /// Rehydrate sessions from a snapshot. Restored sessions have no scheduled task and nothing pending.
    pub async fn restore(&self, snapshot: Snapshot) -> usize {
        let mut state = self.inner.state.lock().await;
        let now = self.now();
        let count = snapshot.len();
        for (id, record) in snapshot {
            let session = state.sessions.get_or_create(&id, now);
            session.cancel_scheduled();
            session.pending = None;
            session.operator_active = record.operator_active;
            session.last_operator_activity = record.last_operator_activity;
            session.last_message_time = record.last_message_time;
        }
        count
    }

    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    /// Internal view including scheduler state (tests and diagnostics).
    pub async fn scheduled_kind(&self, id: &str) -> Option<ScheduledKind> {
        let state = self.inner.state.lock().await;
        state.sessions.get(id).and_then(|s| s.scheduled_kind())
    }

    /// Cancel every scheduled task (shutdown). Returns how many were cancelled.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        state.sessions.cancel_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::dispatch::{AutomationEndpoint, DispatchError, InboundForward};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        takeovers: std::sync::Mutex<Vec<TakeoverRequest>>,
    }

    impl Recorder {
        fn triggers(&self) -> Vec<Trigger> {
            self.takeovers.lock().unwrap().iter().map(|t| t.trigger).collect()
        }
    }

    #[async_trait]
    impl AutomationEndpoint for Recorder {
        async fn forward_inbound(&self, _payload: &InboundForward) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn request_bot_takeover(&self, payload: &TakeoverRequest) -> Result<(), DispatchError> {
            self.takeovers.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn engine() -> (OwnershipEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let engine = OwnershipEngine::new(
            OwnershipSettings::default(),
            Arc::new(TokioClock::new()),
            Dispatcher::new(recorder.clone()),
            Arc::new(Metrics::new()),
        );
        (engine, recorder)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn operator_action_parse() {
        assert_eq!(OperatorAction::parse(Some("TYPING")), OperatorAction::Typing);
        assert_eq!(OperatorAction::parse(Some("DISCONNECT")), OperatorAction::Disconnect);
        assert_eq!(
            OperatorAction::parse(Some("WAVE")),
            OperatorAction::Other("WAVE".to_string())
        );
        assert_eq!(OperatorAction::parse(None), OperatorAction::Other(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_activity_keeps_a_single_takeover() {
        let (engine, recorder) = engine();
        for _ in 0..5 {
            engine.mark_operator_active("a").await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        assert!(!engine.is_operator_inactive("a").await);
        assert!(engine.schedule_takeover("a", Duration::from_secs(30)).await);
        assert!(engine.schedule_takeover("a", Duration::from_secs(45)).await);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(recorder.triggers(), vec![Trigger::OperatorTimeout]);
        assert!(engine.scheduled_kind("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn activate_bot_mode_is_idempotent() {
        let (engine, recorder) = engine();
        engine.mark_operator_active("a").await;
        let once = engine.activate_bot_mode("a").await;
        let twice = engine.activate_bot_mode("a").await;
        assert_eq!(once, twice);
        assert!(!twice.operator_active);
        assert!(twice.last_operator_activity.is_none());
        assert!(engine.scheduled_kind("a").await.is_none());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(recorder.triggers().is_empty());
        assert_eq!(engine.metrics().snapshot().session_switches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_takeover_is_noop_in_bot_mode() {
        let (engine, _recorder) = engine();
        engine.get_state("a").await;
        assert!(!engine.schedule_takeover("a", Duration::from_secs(1)).await);
        assert!(!engine.schedule_takeover("unknown", Duration::from_secs(1)).await);
        assert!(engine.scheduled_kind("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn request_bot_response_debounces() {
        let (engine, recorder) = engine();
        assert!(engine.request_bot_response("a", Trigger::AutoResponse).await);
        assert!(!engine.request_bot_response("a", Trigger::AutoResponse).await);
        settle().await;
        assert_eq!(recorder.triggers().len(), 1);
        tokio::time::sleep(DEBOUNCE_WINDOW).await;
        assert!(engine.request_bot_response("a", Trigger::AutoResponse).await);
        settle().await;
        assert_eq!(recorder.triggers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_clears_pending_early() {
        let (engine, recorder) = engine();
        engine.request_bot_response("a", Trigger::AutoResponse).await;
        assert!(engine.get_state("a").await.pending_bot_response);
        assert!(engine.confirm_bot_message_sent("a").await);
        assert!(!engine.confirm_bot_message_sent("nobody").await);
        assert!(engine.request_bot_response("a", Trigger::AutoResponse).await);
        settle().await;
        assert_eq!(recorder.triggers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_returning_cancels_deferred_disconnect_request() {
        let (engine, recorder) = engine();
        engine.mark_operator_active("a").await;
        engine.on_operator_signal("a", &OperatorAction::Disconnect).await;
        assert_eq!(
            engine.scheduled_kind("a").await,
            Some(ScheduledKind::DeferredRequest(Trigger::OperatorDisconnect))
        );
        engine.on_operator_signal("a", &OperatorAction::Connect).await;
        assert_eq!(engine.scheduled_kind("a").await, Some(ScheduledKind::Takeover));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(recorder.triggers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn force_bot_mode_requests_after_short_delay() {
        let (engine, recorder) = engine();
        engine.mark_operator_active("a").await;
        let state = engine.force_bot_mode("a").await;
        assert!(!state.operator_active);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(recorder.triggers().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.triggers(), vec![Trigger::ForcedBotMode]);
    }

    #[tokio::test(start_paused = true)]
    async fn update_config_ignores_zero_values() {
        let (engine, _recorder) = engine();
        let settings = engine
            .update_config(ConfigUpdate {
                operator_timeout_minutes: Some(5.0),
                bot_delay_seconds: Some(0.0),
            })
            .await;
        assert_eq!(settings.operator_timeout, Duration::from_secs(300));
        assert_eq!(settings.bot_delay, Duration::from_secs(2));
        let update: ConfigUpdate = serde_json::from_str(r#"{"operatorTimeout": 1, "botDelay": 7}"#).unwrap();
        let settings = engine.update_config(update).await;
        assert_eq!(settings.operator_timeout, Duration::from_secs(60));
        assert_eq!(settings.bot_delay, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn update_config_accepts_fractions_and_saturates() {
        let (engine, recorder) = engine();
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"operatorTimeout": 0.5, "botDelaySeconds": 1.5}"#).unwrap();
        let settings = engine.update_config(update).await;
        assert_eq!(settings.operator_timeout, Duration::from_secs(30));
        assert_eq!(settings.bot_delay, Duration::from_millis(1500));

        let update: ConfigUpdate =
            serde_json::from_str(r#"{"operatorTimeoutMinutes": 18446744073709551615, "botDelay": -4}"#)
                .unwrap();
        let settings = engine.update_config(update).await;
        assert_eq!(settings.operator_timeout, Duration::MAX);
        assert_eq!(settings.bot_delay, Duration::from_millis(1500));
        assert_eq!(settings.view().operator_timeout_ms, u64::MAX);

        engine.mark_operator_active("a").await;
        tokio::time::sleep(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert!(!engine.is_operator_inactive("a").await);
        assert!(recorder.triggers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_drops_deferred_requests() {
        let (engine, recorder) = engine();
        engine.mark_operator_active("a").await;
        engine.on_operator_signal("a", &OperatorAction::Disconnect).await;
        engine.mark_operator_active("b").await;
        engine.force_bot_mode("b").await;
        assert_eq!(engine.on_transport_disconnected().await, 0);
        assert!(engine.scheduled_kind("a").await.is_none());
        assert!(engine.scheduled_kind("b").await.is_none());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(recorder.triggers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_every_scheduled_task() {
        let (engine, recorder) = engine();
        engine.mark_operator_active("takeover").await;
        engine.mark_operator_active("left").await;
        engine.on_operator_signal("left", &OperatorAction::Disconnect).await;
        engine.force_bot_mode("forced").await;
        engine.get_state("idle").await;
        assert_eq!(engine.shutdown().await, 3);
        for id in ["takeover", "left", "forced"] {
            assert!(engine.scheduled_kind(id).await.is_none());
        }
        assert_eq!(engine.shutdown().await, 0);
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert!(recorder.triggers().is_empty());
        assert!(engine.get_state("takeover").await.operator_active);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_idle_sessions_and_their_timers() {
        let (engine, recorder) = engine();
        engine.mark_operator_active("quiet").await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        engine.update_config(ConfigUpdate {
            operator_timeout_minutes: Some(48.0 * 60.0),
            bot_delay_seconds: None,
        })
        .await;
        engine.mark_operator_active("quiet").await;
        tokio::time::advance(Duration::from_secs(25 * 60 * 60)).await;
        engine.record_inbound("busy").await;
        let removed = engine.reap_idle().await;
        assert_eq!(removed, vec!["quiet".to_string()]);
        assert_eq!(engine.session_count().await, 1);
        tokio::time::sleep(Duration::from_secs(48 * 60 * 60)).await;
        assert!(recorder.triggers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_restored_operator_is_handed_over() {
        let (engine, recorder) = engine();
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "a".to_string(),
            SessionRecord {
                operator_active: true,
                last_operator_activity: Some(engine.now() - chrono::Duration::minutes(10)),
                last_message_time: engine.now(),
            },
        );
        snapshot.insert(
            "b".to_string(),
            SessionRecord {
                operator_active: true,
                last_operator_activity: Some(engine.now()),
                last_message_time: engine.now(),
            },
        );
        engine.restore(snapshot).await;
        let expired = engine.expire_stale_operators().await;
        assert_eq!(expired, vec!["a".to_string()]);
        settle().await;
        assert_eq!(recorder.triggers(), vec![Trigger::OperatorTimeout]);
        assert!(engine.get_state("b").await.operator_active);
    }
}
