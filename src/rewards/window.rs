use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChildId, WindowId};

/// A span of unblocked reward-app time bought with points
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EarnedTimeWindow {
    pub id: WindowId,
    pub child_id: ChildId,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl EarnedTimeWindow {
    pub fn new(child_id: ChildId, start_time: DateTime<Utc>, duration_seconds: i64) -> Self {
        Self {
            id: WindowId::new(),
            child_id,
            start_time,
            duration_seconds: duration_seconds.max(0),
        }
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::seconds(self.duration_seconds)
    }

    /// Seconds left at `now`; a window that has not started yet has all of them
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        if now < self.start_time {
            return self.duration_seconds;
        }
        (self.end_time() - now).num_seconds().max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time()
    }
}

/// What to do with a new window while another one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackingPolicy {
    /// Cancel the active window and start the new one
    Replace,
    /// Add the new duration to what remains, up to `cap_seconds` remaining
    Extend { cap_seconds: i64 },
    /// Start the new window when the last one ends
    Queue,
    /// Reject the new window
    Block,
}

/// Persisted form of an active or queued window
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WindowRecord {
    #[serde(flatten)]
    pub window: EarnedTimeWindow,
    #[serde(default)]
    pub queued: bool,
}
