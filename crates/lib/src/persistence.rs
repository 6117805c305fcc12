//! Snapshot and restore of conversation ownership across restarts.
//!
//! The snapshot is one JSON document mapping conversation id to
//! `{operatorActive, lastOperatorActivity, lastMessageTime}` (timestamps in Unix ms). It is written
//! to a temporary file next to the target and renamed over it, so a crash mid-write leaves the
//! previous snapshot intact. Scheduled tasks and pending requests are never persisted.

use crate::ownership::OwnershipEngine;
use crate::session::{ConversationId, ConversationSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted ownership fields of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub operator_active: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_operator_activity: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_message_time: DateTime<Utc>,
}

impl From<&ConversationSession> for SessionRecord {
    fn from(session: &ConversationSession) -> Self {
        Self {
            operator_active: session.operator_active(),
            last_operator_activity: session.last_operator_activity(),
            last_message_time: session.last_message_time(),
        }
    }
}

pub type Snapshot = BTreeMap<ConversationId, SessionRecord>;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads and atomically replaces the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write `snapshot`, replacing the previous one.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Read the last snapshot. A missing file is `Ok(None)` (cold start).
    pub async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Rehydrate the engine from the snapshot, if any. Read errors are logged and treated as a cold start.
pub async fn restore_on_startup(engine: &OwnershipEngine, store: &SnapshotStore) -> usize {
    match store.load().await {
        Ok(Some(snapshot)) => {
            let n = engine.restore(snapshot).await;
            log::info!("backup: {} conversation(s) restored from {}", n, store.path().display());
            n
        }
        Ok(None) => {
            log::info!("backup: no snapshot at {}, cold start", store.path().display());
            0
        }
        Err(e) => {
            log::warn!("backup: reading {} failed, cold start: {}", store.path().display(), e);
            0
        }
    }
}

/// Save one snapshot of the engine. Failures are logged; the next cycle retries.
pub async fn save_once(engine: &OwnershipEngine, store: &SnapshotStore) -> bool {
    let snapshot = engine.snapshot().await;
    match store.save(&snapshot).await {
        Ok(()) => {
            log::info!("backup: {} conversation(s) saved", snapshot.len());
            true
        }
        Err(e) => {
            log::error!("backup: saving {} failed: {}", store.path().display(), e);
            false
        }
    }
}

/// Periodically snapshot the engine until the task is aborted.
pub async fn backup_loop(engine: OwnershipEngine, store: SnapshotStore, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately; skip it so the restored state is not rewritten at once
    ticker.tick().await;
    loop {
        ticker.tick().await;
        save_once(&engine, &store).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::dispatch::{
        AutomationEndpoint, DispatchError, Dispatcher, InboundForward, TakeoverRequest,
    };
    use crate::metrics::Metrics;
    use crate::ownership::OwnershipSettings;
    use crate::session::ScheduledKind;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Silent;

    #[async_trait]
    impl AutomationEndpoint for Silent {
        async fn forward_inbound(&self, _payload: &InboundForward) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn request_bot_takeover(&self, _payload: &TakeoverRequest) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn engine() -> OwnershipEngine {
        OwnershipEngine::new(
            OwnershipSettings::default(),
            Arc::new(TokioClock::new()),
            Dispatcher::new(Arc::new(Silent)),
            Arc::new(Metrics::new()),
        )
    }

    fn temp_store() -> (PathBuf, SnapshotStore) {
        let dir = std::env::temp_dir().join(format!("handover-backup-test-{}", uuid::Uuid::new_v4()));
        let store = SnapshotStore::new(dir.join("conversation_backup.json"));
        (dir, store)
    }

    fn ms(v: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(v).unwrap()
    }

    #[tokio::test]
    async fn missing_snapshot_is_cold_start() {
        let (_dir, store) = temp_store();
        assert!(store.load().await.unwrap().is_none());
        assert_eq!(restore_on_startup(&engine(), &store).await, 0);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_cold_start() {
        let (dir, store) = temp_store();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(matches!(store.load().await, Err(SnapshotError::Json(_))));
        assert_eq!(restore_on_startup(&engine(), &store).await, 0);
    }

    #[tokio::test]
    async fn save_replaces_previous_and_leaves_no_temp_file() {
        let (dir, store) = temp_store();
        let mut first = Snapshot::new();
        first.insert(
            "a".to_string(),
            SessionRecord {
                operator_active: false,
                last_operator_activity: None,
                last_message_time: ms(1_000),
            },
        );
        store.save(&first).await.unwrap();
        store.save(&Snapshot::new()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Snapshot::new()));
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn snapshot_file_format() {
        let (_dir, store) = temp_store();
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "336@c.us".to_string(),
            SessionRecord {
                operator_active: true,
                last_operator_activity: Some(ms(1_700_000_000_000)),
                last_message_time: ms(1_700_000_000_500),
            },
        );
        store.save(&snapshot).await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({
                "336@c.us": {
                    "operatorActive": true,
                    "lastOperatorActivity": 1_700_000_000_000i64,
                    "lastMessageTime": 1_700_000_000_500i64
                }
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_restores_fields_without_timers_or_pending() {
        let source = engine();
        source.mark_operator_active("op").await;
        source.record_inbound("op").await;
        source.record_inbound("bot").await;
        source
            .request_bot_response("bot", crate::session::Trigger::AutoResponse)
            .await;
        let (_dir, store) = temp_store();
        assert!(save_once(&source, &store).await);
        source.shutdown().await;

        let target = engine();
        assert_eq!(restore_on_startup(&target, &store).await, 2);
        assert_eq!(target.snapshot().await, source.snapshot().await);
        let op = target.get_state("op").await;
        assert!(op.operator_active);
        assert!(!op.pending_bot_response);
        assert!(!target.get_state("bot").await.pending_bot_response);
        assert_eq!(target.scheduled_kind("op").await, None::<ScheduledKind>);
    }

    #[tokio::test(start_paused = true)]
    async fn final_snapshot_after_shutdown_keeps_ownership() {
        let engine = engine();
        engine.mark_operator_active("op").await;
        engine.force_bot_mode("forced").await;
        engine.record_inbound("bot").await;
        assert_eq!(engine.shutdown().await, 2);
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;

        let (_dir, store) = temp_store();
        assert!(save_once(&engine, &store).await);
        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved, engine.snapshot().await);
        assert_eq!(saved.len(), 3);
        assert!(saved["op"].operator_active);
        assert!(saved["op"].last_operator_activity.is_some());
        assert!(!saved["forced"].operator_active);
        assert!(saved["forced"].last_operator_activity.is_none());
    }
}
