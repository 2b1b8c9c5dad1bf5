//! Earned-time windows and the timers that end them.
//!
//! Every mutation is written to the store before it is applied in memory.
//! Each scheduled timer carries a generation number; a timer whose
//! generation is no longer the child's current one does nothing when it
//! wakes, which makes cancellation idempotent even after the sleep ended.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{ExemptionError, PersistenceError};
use crate::ids::{ChildId, WindowId};
use crate::rewards::audit::{AuditAction, AuditLog, metadata};
use crate::rewards::enforcement::{AppSet, BlockingEnforcer};
use crate::rewards::window::{EarnedTimeWindow, StackingPolicy, WindowRecord};
use crate::store::Store;

const EVENT_CAPACITY: usize = 64;

/// Delay before a timer retries an expiry it could not persist
const PERSIST_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Called once when a window ends on its own
pub type ExpireCallback = Box<dyn FnOnce(EarnedTimeWindow) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExemptionEvent {
    Started(EarnedTimeWindow),
    Extended(EarnedTimeWindow),
    Queued(EarnedTimeWindow),
    Expired(EarnedTimeWindow),
    Cancelled(ChildId),
    /// A timer could not persist an expiry; it will retry
    PersistenceFailed {
        child_id: ChildId,
        error: PersistenceError,
    },
}

struct Timer {
    generation: u64,
    abort: AbortHandle,
}

struct ChildWindows {
    active: EarnedTimeWindow,
    queued: VecDeque<EarnedTimeWindow>,
    timer: Option<Timer>,
}

impl ChildWindows {
    fn window_ids(&self) -> Vec<WindowId> {
        std::iter::once(self.active.id)
            .chain(self.queued.iter().map(|w| w.id))
            .collect()
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort.abort();
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    enforcer: Arc<dyn BlockingEnforcer>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    policy: RwLock<StackingPolicy>,
    reward_apps: RwLock<AppSet>,
    children: Mutex<HashMap<ChildId, ChildWindows>>,
    callbacks: Mutex<HashMap<WindowId, Vec<ExpireCallback>>>,
    generation: AtomicU64,
    events: broadcast::Sender<ExemptionEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for state in self.children.get_mut().values_mut() {
            state.abort_timer();
        }
    }
}

/// Tracks active and queued windows per child
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ExemptionManager {
    inner: Arc<Inner>,
}

impl ExemptionManager {
    pub fn new(
        store: Arc<dyn Store>,
        enforcer: Arc<dyn BlockingEnforcer>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        policy: StackingPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                enforcer,
                audit,
                clock,
                policy: RwLock::new(policy),
                reward_apps: RwLock::new(AppSet::new()),
                children: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExemptionEvent> {
        self.inner.events.subscribe()
    }

    pub fn policy(&self) -> StackingPolicy {
        *self.inner.policy.read()
    }

    pub fn set_policy(&self, policy: StackingPolicy) {
        *self.inner.policy.write() = policy;
    }

    fn policy_with_cap(&self, cap_seconds: Option<i64>) -> StackingPolicy {
        match (self.policy(), cap_seconds) {
            (StackingPolicy::Extend { .. }, Some(cap_seconds)) => {
                StackingPolicy::Extend { cap_seconds }
            }
            (policy, _) => policy,
        }
    }

    /// Apps unblocked while a window is active
    pub fn set_reward_apps(&self, apps: AppSet) {
        *self.inner.reward_apps.write() = apps;
    }

    pub fn reward_apps(&self) -> AppSet {
        self.inner.reward_apps.read().clone()
    }

    /// Start a window under the current stacking policy.
    ///
    /// Returns the window as it now stands: the new window, the extended
    /// active window, or the queued window with its adjusted start.
    pub fn start_exemption(
        &self,
        child_id: &ChildId,
        window: EarnedTimeWindow,
        on_expire: Option<ExpireCallback>,
    ) -> Result<EarnedTimeWindow, ExemptionError> {
        self.start_exemption_capped(child_id, window, on_expire, None)
    }

    /// Like [`start_exemption`](Self::start_exemption), with the extend cap
    /// replaced by `cap_seconds` when given
    pub fn start_exemption_capped(
        &self,
        child_id: &ChildId,
        window: EarnedTimeWindow,
        on_expire: Option<ExpireCallback>,
        cap_seconds: Option<i64>,
    ) -> Result<EarnedTimeWindow, ExemptionError> {
        let now = self.inner.clock.now();
        let policy = self.policy_with_cap(cap_seconds);
        let mut children = self.inner.children.lock();
        if policy == StackingPolicy::Block && children.contains_key(child_id) {
            debug!("Rejected window for {}: stacking is blocked", child_id);
            return Err(ExemptionError::StackingPolicyViolation);
        }
        let existing = children.remove(child_id);

        let (mut next, event, reschedule) = match (&existing, policy) {
            (None, StackingPolicy::Extend { cap_seconds }) => {
                let mut window = window;
                window.duration_seconds = window.duration_seconds.min(cap_seconds.max(0));
                let state = Self::fresh(window.clone());
                (state, ExemptionEvent::Started(window), true)
            }
            (None, _) | (Some(_), StackingPolicy::Replace | StackingPolicy::Block) => {
                let state = Self::fresh(window.clone());
                (state, ExemptionEvent::Started(window), true)
            }
            (Some(current), StackingPolicy::Extend { cap_seconds }) => {
                let remaining = current.active.remaining_seconds(now);
                let new_remaining = (remaining + window.duration_seconds).min(cap_seconds.max(0));
                let mut extended = current.active.clone();
                extended.duration_seconds =
                    (now - extended.start_time).num_seconds().max(0) + new_remaining;
                let state = ChildWindows {
                    active: extended.clone(),
                    queued: current.queued.clone(),
                    timer: None,
                };
                (state, ExemptionEvent::Extended(extended), true)
            }
            (Some(current), StackingPolicy::Queue) => {
                let last_end = current
                    .queued
                    .back()
                    .unwrap_or(&current.active)
                    .end_time();
                let mut queued = window;
                queued.start_time = last_end.max(now);
                let mut pending = current.queued.clone();
                pending.push_back(queued.clone());
                let state = ChildWindows {
                    active: current.active.clone(),
                    queued: pending,
                    timer: None,
                };
                (state, ExemptionEvent::Queued(queued), false)
            }
        };

        if let Err(e) = self.persist_with(&children, Some(&next)) {
            if let Some(existing) = existing {
                children.insert(child_id.clone(), existing);
            }
            return Err(e.into());
        }

        let was_idle = existing.is_none();
        let mut dropped_windows = Vec::new();
        match existing {
            Some(mut current) if reschedule => {
                current.abort_timer();
                if policy == StackingPolicy::Replace {
                    dropped_windows = current.window_ids();
                }
            }
            Some(mut current) => next.timer = current.timer.take(),
            None => {}
        }
        if reschedule {
            next.timer = Some(self.schedule(child_id, &next.active, now));
        }

        let result = match &event {
            ExemptionEvent::Queued(w) | ExemptionEvent::Extended(w) | ExemptionEvent::Started(w) => {
                w.clone()
            }
            _ => next.active.clone(),
        };
        children.insert(child_id.clone(), next);
        drop(children);

        {
            let mut callbacks = self.inner.callbacks.lock();
            for id in dropped_windows {
                callbacks.remove(&id);
            }
            if let Some(on_expire) = on_expire {
                callbacks.entry(result.id).or_default().push(on_expire);
            }
        }

        if was_idle {
            let apps = self.reward_apps();
            self.inner.enforcer.lift_enforcement(child_id, &apps);
        }

        info!(
            "Earned time for {}: {:?} ({}s, ends {})",
            child_id,
            policy,
            result.duration_seconds,
            result.end_time().format("%H:%M:%S")
        );
        let _ = self.inner.events.send(event);
        Ok(result)
    }

    /// Revoke the child's active and queued windows; `false` when there were none
    pub fn cancel(&self, child_id: &ChildId) -> Result<bool, ExemptionError> {
        let now = self.inner.clock.now();
        let mut children = self.inner.children.lock();
        let Some(mut state) = children.remove(child_id) else {
            debug!("No window to cancel for {}", child_id);
            return Ok(false);
        };

        let details = metadata([
            ("window_id", state.active.id.to_string()),
            ("remaining_seconds", state.active.remaining_seconds(now).to_string()),
            ("queued", state.queued.len().to_string()),
        ]);
        if let Err(e) = self.persist_with(&children, None) {
            children.insert(child_id.clone(), state);
            return Err(e.into());
        }

        // Only a cancellation that reached the store is audited
        if let Err(e) =
            self.inner
                .audit
                .record(Some(child_id), AuditAction::ExemptionCancelled, details, now)
        {
            children.insert(child_id.clone(), state);
            if let Err(restore) = self.persist_with(&children, None) {
                error!("Failed to restore windows for {}: {}", child_id, restore);
            }
            return Err(e.into());
        }
        drop(children);

        state.abort_timer();
        {
            let mut callbacks = self.inner.callbacks.lock();
            for id in state.window_ids() {
                callbacks.remove(&id);
            }
        }

        let apps = self.reward_apps();
        self.inner.enforcer.reapply_enforcement(child_id, &apps);
        info!("Cancelled earned time for {}", child_id);
        let _ = self
            .inner
            .events
            .send(ExemptionEvent::Cancelled(child_id.clone()));
        Ok(true)
    }

    /// Active window for the child
    pub fn active_window(&self, child_id: &ChildId) -> Option<EarnedTimeWindow> {
        self.inner
            .children
            .lock()
            .get(child_id)
            .map(|state| state.active.clone())
    }

    /// Windows waiting behind the active one, in start order
    pub fn queued_windows(&self, child_id: &ChildId) -> Vec<EarnedTimeWindow> {
        self.inner
            .children
            .lock()
            .get(child_id)
            .map(|state| state.queued.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Children with an active window
    pub fn children(&self) -> Vec<ChildId> {
        let mut children: Vec<ChildId> = self.inner.children.lock().keys().cloned().collect();
        children.sort();
        children
    }

    /// Seconds that can still be added before hitting the extend cap.
    ///
    /// `None` when the policy does not cap stacked time.
    pub fn stacking_headroom_seconds(&self, child_id: &ChildId) -> Option<i64> {
        self.stacking_headroom_with_cap(child_id, None)
    }

    /// Headroom under an extend cap of `cap_seconds` instead of the policy's
    pub fn stacking_headroom_with_cap(
        &self,
        child_id: &ChildId,
        cap_seconds: Option<i64>,
    ) -> Option<i64> {
        let StackingPolicy::Extend { cap_seconds } = self.policy_with_cap(cap_seconds) else {
            return None;
        };
        let now = self.inner.clock.now();
        let remaining = self
            .inner
            .children
            .lock()
            .get(child_id)
            .map(|state| state.active.remaining_seconds(now))
            .unwrap_or(0);
        Some((cap_seconds - remaining).max(0))
    }

    /// Reload persisted windows after a restart.
    ///
    /// Live windows get a fresh timer and enforcement lifted; children whose
    /// windows all ended while the process was down get enforcement back.
    /// Returns the number of children with a live window.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let records = self
            .inner
            .store
            .load_windows()
            .context("Failed to load earned-time windows")?;
        let now = self.inner.clock.now();

        let mut grouped: BTreeMap<ChildId, Vec<WindowRecord>> = BTreeMap::new();
        for record in records {
            grouped
                .entry(record.window.child_id.clone())
                .or_default()
                .push(record);
        }

        let mut lifted = Vec::new();
        let mut reapplied = Vec::new();
        let mut pruned = false;
        let mut children = self.inner.children.lock();
        for state in children.values_mut() {
            state.abort_timer();
        }
        children.clear();

        for (child_id, mut records) in grouped {
            records.sort_by_key(|r| (r.queued, r.window.start_time));
            let mut live: VecDeque<EarnedTimeWindow> = VecDeque::new();
            for record in records {
                if record.window.is_expired(now) {
                    debug!("Window {} for {} ended while stopped", record.window.id, child_id);
                    pruned = true;
                } else {
                    live.push_back(record.window);
                }
            }

            match live.pop_front() {
                Some(active) => {
                    let timer = self.schedule(&child_id, &active, now);
                    children.insert(
                        child_id.clone(),
                        ChildWindows {
                            active,
                            queued: live,
                            timer: Some(timer),
                        },
                    );
                    lifted.push(child_id);
                }
                None => reapplied.push(child_id),
            }
        }

        if pruned {
            if let Err(e) = self.persist_with(&children, None) {
                warn!("Failed to prune ended windows: {}", e);
            }
        }
        drop(children);

        let apps = self.reward_apps();
        for child_id in &lifted {
            self.inner.enforcer.lift_enforcement(child_id, &apps);
        }
        for child_id in &reapplied {
            self.inner.enforcer.reapply_enforcement(child_id, &apps);
        }

        info!(
            "Restored {} live windows, {} ended while stopped",
            lifted.len(),
            reapplied.len()
        );
        Ok(lifted.len())
    }

    fn fresh(window: EarnedTimeWindow) -> ChildWindows {
        ChildWindows {
            active: window,
            queued: VecDeque::new(),
            timer: None,
        }
    }

    fn schedule(&self, child_id: &ChildId, window: &EarnedTimeWindow, now: DateTime<Utc>) -> Timer {
        let delay_ms = (window.end_time() - now).num_milliseconds().max(0);
        self.schedule_after(child_id, Duration::from_millis(delay_ms as u64))
    }

    fn schedule_after(&self, child_id: &ChildId, delay: Duration) -> Timer {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::downgrade(&self.inner);
        let child_id = child_id.clone();
        let deadline = Instant::now() + delay;
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                ExemptionManager { inner }.on_timer(&child_id, generation);
            }
        });
        debug!("Timer {} armed for {:?}", generation, delay);
        Timer {
            generation,
            abort: task.abort_handle(),
        }
    }

    fn on_timer(&self, child_id: &ChildId, generation: u64) {
        let now = self.inner.clock.now();
        let mut children = self.inner.children.lock();
        let Some(mut state) = children.remove(child_id) else {
            debug!("Timer {} for {} found no window", generation, child_id);
            return;
        };
        if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
            debug!("Ignoring stale timer {} for {}", generation, child_id);
            children.insert(child_id.clone(), state);
            return;
        }

        let mut finished = vec![state.active.clone()];
        let mut queued = state.queued.clone();
        let mut promoted = None;
        while let Some(candidate) = queued.pop_front() {
            if candidate.is_expired(now) {
                finished.push(candidate);
            } else {
                promoted = Some(candidate);
                break;
            }
        }

        let next = promoted.map(|active| ChildWindows {
            active,
            queued,
            timer: None,
        });
        if let Err(e) = self.persist_with(&children, next.as_ref()) {
            error!("Failed to persist expiry for {}: {}", child_id, e);
            state.timer = Some(self.schedule_after(child_id, PERSIST_RETRY_DELAY));
            children.insert(child_id.clone(), state);
            let _ = self.inner.events.send(ExemptionEvent::PersistenceFailed {
                child_id: child_id.clone(),
                error: e,
            });
            return;
        }

        let promoted = match next {
            Some(mut next) => {
                next.timer = Some(self.schedule(child_id, &next.active, now));
                let active = next.active.clone();
                children.insert(child_id.clone(), next);
                Some(active)
            }
            None => None,
        };
        drop(children);

        if promoted.is_none() {
            let apps = self.reward_apps();
            self.inner.enforcer.reapply_enforcement(child_id, &apps);
            info!("Earned time ended for {}", child_id);
        }

        for window in finished {
            let callbacks = self.inner.callbacks.lock().remove(&window.id);
            for callback in callbacks.into_iter().flatten() {
                callback(window.clone());
            }
            let _ = self.inner.events.send(ExemptionEvent::Expired(window));
        }
        if let Some(active) = promoted {
            info!("Queued earned time started for {}", child_id);
            let _ = self.inner.events.send(ExemptionEvent::Started(active));
        }
    }

    /// Write every window in `children` plus `replacement`, whose child must
    /// not also be in `children`
    fn persist_with(
        &self,
        children: &HashMap<ChildId, ChildWindows>,
        replacement: Option<&ChildWindows>,
    ) -> Result<(), PersistenceError> {
        let mut states: Vec<&ChildWindows> = children.values().chain(replacement).collect();
        states.sort_by(|a, b| a.active.child_id.cmp(&b.active.child_id));

        let mut records = Vec::new();
        for state in states {
            records.push(WindowRecord {
                window: state.active.clone(),
                queued: false,
            });
            records.extend(state.queued.iter().map(|w| WindowRecord {
                window: w.clone(),
                queued: true,
            }));
        }

        self.inner.store.save_windows(&records).map_err(|e| {
            error!("Failed to persist earned-time windows: {:#}", e);
            PersistenceError::new("earned-time windows", &e)
        })
    }
}
