//! Session accrual: turns foreground time in learning apps into points.
//!
//! ```text
//!   Idle ──start_session──► Active ──touch──► Active ──end_session──► Closed
//! ```
//!
//! Only gaps between activity signals no longer than the idle timeout are
//! credited. A longer gap means the child walked away, and the whole gap
//! counts for nothing. Timestamps come from the monitoring collaborator, never
//! from the local clock.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AccrualConfig, AccrualSettings, AppCategory};
use crate::error::LedgerError;
use crate::ids::{AppId, ChildId, SessionId};
use crate::rewards::ledger::Ledger;
use crate::sync::AppendOnly;

/// Foreground use of one learning app by one child
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageSession {
    pub id: SessionId,
    pub child_id: ChildId,
    pub app_id: AppId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity_time: DateTime<Utc>,
    /// Whole seconds of `credited_millis`
    pub credited_seconds: i64,
    #[serde(default)]
    pub credited_millis: i64,
    /// Points recorded when the session closed
    #[serde(default)]
    pub points_awarded: i64,
}

impl UsageSession {
    fn open(id: SessionId, child_id: &ChildId, app_id: &AppId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            child_id: child_id.clone(),
            app_id: app_id.clone(),
            start_time: at,
            end_time: None,
            last_activity_time: at,
            credited_seconds: 0,
            credited_millis: 0,
            points_awarded: 0,
        }
    }

    /// Wall time covered by the session, never negative
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).max(Duration::zero())
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Credit the gap up to `at` if it is within the idle timeout
    fn credit(&mut self, at: DateTime<Utc>, idle_timeout_seconds: i64) {
        if at <= self.last_activity_time {
            return;
        }
        let gap = (at - self.last_activity_time).num_milliseconds();
        if gap <= idle_timeout_seconds.saturating_mul(1000) {
            self.credited_millis += gap;
            self.credited_seconds = self.credited_millis / 1000;
        } else {
            debug!("Session {} idle for {}ms, gap not credited", self.id, gap);
        }
        self.last_activity_time = at;
    }
}

impl AppendOnly for UsageSession {
    type Id = SessionId;

    fn unique_id(&self) -> SessionId {
        self.id
    }
}

/// Points earned for a number of credited seconds, rounded down
pub fn points_for_seconds(credited_seconds: i64, config: &AccrualConfig) -> i64 {
    points_for_millis(credited_seconds.saturating_mul(1000), config)
}

/// Points earned for credited milliseconds, rounded down once at the end
pub fn points_for_millis(credited_millis: i64, config: &AccrualConfig) -> i64 {
    credited_millis.max(0) * config.points_per_minute / 60_000
}

/// Bounds of the UTC calendar day containing `at`
pub fn utc_day(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = at.date_naive().and_time(NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}

/// Tracks open sessions and credits closed ones to the ledger
pub struct AccrualEngine {
    ledger: Arc<Ledger>,
    settings: RwLock<AccrualSettings>,
    categories: RwLock<HashMap<AppId, AppCategory>>,
    open: Mutex<HashMap<SessionId, UsageSession>>,
    closed: Mutex<Vec<UsageSession>>,
}

impl AccrualEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        settings: AccrualSettings,
        categories: HashMap<AppId, AppCategory>,
    ) -> Self {
        Self {
            ledger,
            settings: RwLock::new(settings),
            categories: RwLock::new(categories),
            open: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Replace the app classification
    pub fn set_classification(&self, categories: HashMap<AppId, AppCategory>) {
        *self.categories.write() = categories;
    }

    pub fn set_settings(&self, settings: AccrualSettings) {
        *self.settings.write() = settings;
    }

    pub fn category(&self, app_id: &AppId) -> AppCategory {
        self.categories
            .read()
            .get(app_id)
            .copied()
            .unwrap_or(AppCategory::Neutral)
    }

    /// Open a session for a learning app.
    ///
    /// Returns `None` when the app does not earn points or today's cap is
    /// already reached. A start for a (child, app) pair that already has an
    /// open session returns that session.
    pub fn start_session(
        &self,
        child_id: &ChildId,
        app_id: &AppId,
        at: DateTime<Utc>,
    ) -> Option<UsageSession> {
        self.start_session_with_id(SessionId::new(), child_id, app_id, at)
    }

    /// Open a session under an id chosen by the monitoring side.
    ///
    /// A redelivered start for an id that is open returns it; one for an id
    /// that already closed returns `None`.
    pub fn start_session_with_id(
        &self,
        session_id: SessionId,
        child_id: &ChildId,
        app_id: &AppId,
        at: DateTime<Utc>,
    ) -> Option<UsageSession> {
        if self.closed.lock().iter().any(|s| s.id == session_id) {
            debug!("Session {} already closed, ignoring start", session_id);
            return None;
        }
        if self.category(app_id) != AppCategory::Learning {
            debug!("{} is not a learning app, no session", app_id);
            return None;
        }

        let mut open = self.open.lock();
        if let Some(existing) = open.get(&session_id) {
            return Some(existing.clone());
        }
        if let Some(existing) = open
            .values()
            .find(|s| &s.child_id == child_id && &s.app_id == app_id)
        {
            debug!("Session already open for {} in {}", child_id, app_id);
            return Some(existing.clone());
        }

        let config = self.settings.read().for_app(app_id);
        let (day_start, day_end) = utc_day(at);
        let accrued = self
            .ledger
            .accrued_between(child_id, Some(app_id), day_start, day_end);
        if accrued >= config.daily_cap_points {
            info!(
                "{} already earned {} of {} points in {} today",
                child_id, accrued, config.daily_cap_points, app_id
            );
            return None;
        }

        let session = UsageSession::open(session_id, child_id, app_id, at);
        debug!("Started session {} for {} in {}", session.id, child_id, app_id);
        open.insert(session.id, session.clone());
        Some(session)
    }

    /// Record an activity signal; `None` when the session is not open
    pub fn touch(&self, session_id: SessionId, at: DateTime<Utc>) -> Option<UsageSession> {
        let mut open = self.open.lock();
        let session = open.get_mut(&session_id)?;
        let config = self.settings.read().for_app(&session.app_id);
        session.credit(at, config.idle_timeout_seconds);
        Some(session.clone())
    }

    /// Close a session and credit its points.
    ///
    /// Returns `Ok(None)` when the session is unknown or already closed. If
    /// the ledger write fails the session stays open so the end can be
    /// delivered again.
    pub fn end_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<Option<UsageSession>, LedgerError> {
        let mut open = self.open.lock();
        let Some(current) = open.get(&session_id) else {
            debug!("Session {} is not open, ignoring end", session_id);
            return Ok(None);
        };

        let config = self.settings.read().for_app(&current.app_id);
        let mut session = current.clone();
        session.credit(at, config.idle_timeout_seconds);
        session.end_time = Some(at.max(session.start_time));

        let earned = points_for_millis(session.credited_millis, &config);
        let (day_start, day_end) = utc_day(at);
        let accrued_today = self.ledger.accrued_between(
            &session.child_id,
            Some(&session.app_id),
            day_start,
            day_end,
        );
        let points = earned.min((config.daily_cap_points - accrued_today).max(0));
        if points < earned {
            info!(
                "Daily cap reached for {} in {}: {} of {} points credited",
                session.child_id, session.app_id, points, earned
            );
        }

        if points > 0 {
            self.ledger
                .record_accrual(&session.child_id, Some(&session.app_id), points, at)?;
        }
        session.points_awarded = points;

        open.remove(&session_id);
        drop(open);

        info!(
            "Session {} for {} closed: {}s credited, {} points",
            session.id, session.child_id, session.credited_seconds, points
        );
        self.closed.lock().push(session.clone());
        Ok(Some(session))
    }

    /// The open session for a (child, app) pair
    pub fn find_open(&self, child_id: &ChildId, app_id: &AppId) -> Option<UsageSession> {
        self.open
            .lock()
            .values()
            .find(|s| &s.child_id == child_id && &s.app_id == app_id)
            .cloned()
    }

    /// Open sessions for a child
    pub fn open_sessions(&self, child_id: &ChildId) -> Vec<UsageSession> {
        let mut sessions: Vec<UsageSession> = self
            .open
            .lock()
            .values()
            .filter(|s| &s.child_id == child_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_time);
        sessions
    }

    /// Closed sessions for a child, most recent first
    pub fn closed_sessions(&self, child_id: &ChildId) -> Vec<UsageSession> {
        let mut sessions: Vec<UsageSession> = self
            .closed
            .lock()
            .iter()
            .filter(|s| &s.child_id == child_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions
    }

    /// Every closed session, in close order
    pub fn all_closed_sessions(&self) -> Vec<UsageSession> {
        self.closed.lock().clone()
    }

    /// Union closed sessions from another device; returns how many were new
    pub fn merge_remote_sessions(&self, remote: &[UsageSession]) -> usize {
        let mut closed = self.closed.lock();
        let mut known: HashSet<SessionId> = closed.iter().map(|s| s.id).collect();
        let mut added = 0;
        for session in remote {
            if session.is_open() {
                warn!("Ignoring open remote session {}", session.id);
                continue;
            }
            if known.insert(session.id) {
                closed.push(session.clone());
                added += 1;
            }
        }
        if added > 0 {
            debug!("Merged {} remote sessions", added);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DeviceId;
    use crate::rewards::audit::AuditLog;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 16, 9, 0, 0).unwrap()
    }

    fn math() -> AppId {
        AppId::new("app:math")
    }

    fn kid() -> ChildId {
        ChildId::new("kid1")
    }

    fn make_engine(config: AccrualConfig) -> (Arc<MemoryStore>, Arc<Ledger>, AccrualEngine) {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditLog::new(store.clone(), DeviceId::new("child-tablet")));
        let ledger = Arc::new(Ledger::new(store.clone(), audit));
        let mut categories = HashMap::new();
        categories.insert(math(), AppCategory::Learning);
        categories.insert(AppId::new("app:game"), AppCategory::Reward);
        let settings = AccrualSettings {
            default: config,
            apps: Default::default(),
        };
        let engine = AccrualEngine::new(ledger.clone(), settings, categories);
        (store, ledger, engine)
    }

    fn default_engine() -> (Arc<MemoryStore>, Arc<Ledger>, AccrualEngine) {
        make_engine(AccrualConfig {
            points_per_minute: 10,
            daily_cap_points: 600,
            idle_timeout_seconds: 120,
        })
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    #[test]
    fn test_six_and_a_half_minutes_earn_65_points() {
        let (_, ledger, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();

        for minute in 1..=6 {
            engine.touch(session.id, t0() + secs(minute * 60)).unwrap();
        }
        let closed = engine
            .end_session(session.id, t0() + secs(390))
            .unwrap()
            .unwrap();

        assert_eq!(closed.credited_seconds, 390);
        assert_eq!(closed.points_awarded, 65);
        assert_eq!(ledger.balance(&kid(), Some(&math())), 65);
    }

    #[test]
    fn test_sub_second_touches_accumulate() {
        let (_, ledger, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();

        for tick in 1..720 {
            engine
                .touch(session.id, t0() + Duration::milliseconds(tick * 500))
                .unwrap();
        }
        let closed = engine
            .end_session(session.id, t0() + secs(360))
            .unwrap()
            .unwrap();

        assert_eq!(closed.credited_millis, 360_000);
        assert_eq!(closed.credited_seconds, 360);
        assert_eq!(closed.points_awarded, 60);
        assert_eq!(ledger.balance(&kid(), Some(&math())), 60);
    }

    #[test]
    fn test_caller_supplied_id_is_idempotent() {
        let (_, ledger, engine) = default_engine();
        let id = SessionId::new();

        let first = engine.start_session_with_id(id, &kid(), &math(), t0()).unwrap();
        assert_eq!(first.id, id);
        let again = engine
            .start_session_with_id(id, &kid(), &math(), t0() + secs(5))
            .unwrap();
        assert_eq!(again.start_time, t0());

        engine.end_session(id, t0() + secs(60)).unwrap();
        // A start redelivered after the end does not reopen the session
        assert!(
            engine
                .start_session_with_id(id, &kid(), &math(), t0())
                .is_none()
        );
        assert!(engine.open_sessions(&kid()).is_empty());
        assert_eq!(ledger.balance(&kid(), Some(&math())), 10);
    }

    #[test]
    fn test_idle_gap_is_not_credited() {
        let (_, _, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();

        engine.touch(session.id, t0() + secs(60)).unwrap();
        // 10 minutes without a signal
        engine.touch(session.id, t0() + secs(660)).unwrap();
        let closed = engine
            .end_session(session.id, t0() + secs(720))
            .unwrap()
            .unwrap();

        assert_eq!(closed.credited_seconds, 120);
        assert_eq!(closed.points_awarded, 20);
    }

    #[test]
    fn test_late_signals_ignored_and_end_before_start_clamped() {
        let (_, _, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();

        engine.touch(session.id, t0() + secs(60)).unwrap();
        let touched = engine.touch(session.id, t0() + secs(30)).unwrap();
        assert_eq!(touched.credited_seconds, 60);

        let other = engine
            .start_session(&kid(), &AppId::new("app:math"), t0())
            .unwrap();
        assert_eq!(other.id, session.id);

        engine.end_session(session.id, t0() + secs(60)).unwrap();
        let early = engine
            .start_session(&kid(), &math(), t0() + secs(600))
            .unwrap();
        let closed = engine
            .end_session(early.id, t0())
            .unwrap()
            .unwrap();
        assert_eq!(closed.duration(t0()), Duration::zero());
        assert_eq!(closed.points_awarded, 0);
    }

    #[test]
    fn test_only_learning_apps_open_sessions() {
        let (_, _, engine) = default_engine();
        assert!(engine
            .start_session(&kid(), &AppId::new("app:game"), t0())
            .is_none());
        assert!(engine
            .start_session(&kid(), &AppId::new("app:unknown"), t0())
            .is_none());
    }

    #[test]
    fn test_end_session_twice_is_noop() {
        let (_, ledger, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();
        engine.touch(session.id, t0() + secs(60)).unwrap();

        assert!(engine.end_session(session.id, t0() + secs(60)).unwrap().is_some());
        assert!(engine.end_session(session.id, t0() + secs(90)).unwrap().is_none());

        assert_eq!(ledger.entries(&kid(), None).len(), 1);
        assert_eq!(ledger.total_balance(&kid()), 10);
    }

    #[test]
    fn test_daily_cap_clamps_and_blocks_new_sessions() {
        let (_, ledger, engine) = make_engine(AccrualConfig {
            points_per_minute: 10,
            daily_cap_points: 50,
            idle_timeout_seconds: 120,
        });

        let session = engine.start_session(&kid(), &math(), t0()).unwrap();
        for minute in 1..=8 {
            engine.touch(session.id, t0() + secs(minute * 60)).unwrap();
        }
        let closed = engine
            .end_session(session.id, t0() + secs(480))
            .unwrap()
            .unwrap();

        assert_eq!(closed.points_awarded, 50);
        assert_eq!(ledger.balance(&kid(), Some(&math())), 50);
        assert!(engine
            .start_session(&kid(), &math(), t0() + secs(600))
            .is_none());

        // The cap is per UTC day
        assert!(engine
            .start_session(&kid(), &math(), t0() + Duration::days(1))
            .is_some());
    }

    #[test]
    fn test_failed_accrual_keeps_session_open() {
        let (store, ledger, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();
        engine.touch(session.id, t0() + secs(60)).unwrap();

        store.fail_next_writes(1);
        assert!(engine.end_session(session.id, t0() + secs(60)).is_err());
        assert_eq!(engine.open_sessions(&kid()).len(), 1);
        assert_eq!(ledger.total_balance(&kid()), 0);

        let closed = engine
            .end_session(session.id, t0() + secs(60))
            .unwrap()
            .unwrap();
        assert_eq!(closed.points_awarded, 10);
        assert_eq!(engine.closed_sessions(&kid()).len(), 1);
    }

    #[test]
    fn test_merge_remote_sessions_skips_duplicates_and_open() {
        let (_, _, engine) = default_engine();
        let session = engine.start_session(&kid(), &math(), t0()).unwrap();
        let closed = engine
            .end_session(session.id, t0() + secs(60))
            .unwrap()
            .unwrap();
        let remote_open = UsageSession::open(SessionId::new(), &kid(), &math(), t0());

        assert_eq!(engine.merge_remote_sessions(&[closed, remote_open]), 0);
        let mut other = UsageSession::open(SessionId::new(), &kid(), &math(), t0());
        other.end_time = Some(t0() + secs(30));
        assert_eq!(engine.merge_remote_sessions(&[other.clone(), other]), 1);
        assert_eq!(engine.all_closed_sessions().len(), 2);
    }
}
