use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AppId, ChildId, SessionId};

/// Signal from the activity-monitoring collaborator
///
/// One JSON object per line on the `run` command's stdin. Events may be
/// delivered more than once; touches and ends name the session they belong
/// to, so a redelivered end can never close a later session.
///
/// ```text
/// {"type":"session_started","child_id":"kid1","app_id":"app:math","at":"2025-11-16T09:00:00Z"}
/// {"type":"activity_touch","session_id":"<uuid>","at":"2025-11-16T09:01:00Z"}
/// {"type":"session_ended","session_id":"<uuid>","at":"2025-11-16T09:06:30Z"}
/// ```
///
/// A start may carry its own `session_id`; otherwise one is assigned and
/// reported back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    SessionStarted {
        child_id: ChildId,
        app_id: AppId,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    ActivityTouch {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
    SessionEnded {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
}

impl ActivityEvent {
    /// Session named by the event, if any
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::SessionStarted { session_id, .. } => *session_id,
            Self::ActivityTouch { session_id, .. } | Self::SessionEnded { session_id, .. } => {
                Some(*session_id)
            }
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { at, .. }
            | Self::ActivityTouch { at, .. }
            | Self::SessionEnded { at, .. } => *at,
        }
    }
}
