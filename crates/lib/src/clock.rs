//! Time source for session timestamps and pending-request deadlines.
//!
//! Clocks report millisecond precision, the precision timestamps are persisted and sent with.

use chrono::{DateTime, SubsecRound, Utc};

/// Wall-clock source injected into the ownership engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }
}

/// Wall time anchored to `tokio::time::Instant`, so it follows paused/advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            instant_anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.instant_anchor);
        let now = self.wall_anchor + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
        now.trunc_subsecs(3)
    }
}
