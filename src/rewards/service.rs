use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{
    AccrualConfig, AppCategory, RedemptionConfig, RewardsConfig, validate_config,
};
use crate::error::{ExemptionError, LedgerError, RedemptionError};
use crate::ids::{AppId, ChildId, DeviceId, SessionId};
use crate::rewards::accrual::{AccrualEngine, UsageSession};
use crate::rewards::audit::{AuditAction, AuditEntry, AuditLog, metadata};
use crate::rewards::enforcement::{
    AppSet, BlockingEnforcer, CapabilityHandle, LocalCapability, MirroredCapability,
};
use crate::rewards::events::ActivityEvent;
use crate::rewards::exemption::{ExemptionEvent, ExemptionManager};
use crate::rewards::ledger::{Ledger, LedgerEntry, LedgerEvent};
use crate::rewards::redemption::{Redemption, RedemptionService};
use crate::rewards::window::EarnedTimeWindow;
use crate::store::Store;
use crate::sync::{
    CloudTransport, RecordSet, SyncCoordinator, SyncReport, SyncTargets, SyncableRecord,
};

/// Errors that may succeed if the same operation is tried again
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for LedgerError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl Retryable for ExemptionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl Retryable for RedemptionError {
    /// Only failures that left the balance untouched
    fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

/// Reward-app capabilities derived from classification rules
///
/// Rules that were never seen on this device only yield mirrored handles.
pub fn capability_handles(records: &RecordSet, device_id: &DeviceId) -> Vec<CapabilityHandle> {
    records
        .classifications
        .values()
        .filter(|rule| rule.category == AppCategory::Reward)
        .map(|rule| {
            if rule.device_ids.contains(device_id) {
                CapabilityHandle::Local(LocalCapability::new(rule.app_id.clone()))
            } else {
                CapabilityHandle::Mirrored(MirroredCapability {
                    app_id: rule.app_id.clone(),
                    origin_device: rule.origin_device.clone(),
                })
            }
        })
        .collect()
}

/// Owns every rewards component for one device
///
/// All mutating operations run one at a time behind a single async lock.
pub struct RewardsService {
    config: RewardsConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    ledger: Arc<Ledger>,
    accrual: AccrualEngine,
    exemptions: ExemptionManager,
    redemption: RedemptionService,
    sync: SyncCoordinator,
    transport: Option<Arc<dyn CloudTransport>>,
    guard: Mutex<()>,
}

impl RewardsService {
    /// Build every component from config and the store's current contents
    pub fn open(
        config: RewardsConfig,
        store: Arc<dyn Store>,
        enforcer: Arc<dyn BlockingEnforcer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_config(&config)?;
        let device_id = config.device.id.clone();

        let audit = Arc::new(
            AuditLog::load(store.clone(), device_id.clone()).context("Failed to load audit log")?,
        );
        let ledger = Arc::new(
            Ledger::load(store.clone(), audit.clone()).context("Failed to load ledger")?,
        );
        let sync = SyncCoordinator::load(store.clone(), &config)?;
        let records = sync.records();

        let accrual = AccrualEngine::new(
            ledger.clone(),
            records.accrual_settings(&config.accrual),
            records.categories(),
        );
        let exemptions = ExemptionManager::new(
            store,
            enforcer,
            audit.clone(),
            clock.clone(),
            config.stacking_policy(),
        );
        let redemption = RedemptionService::new(
            ledger.clone(),
            exemptions.clone(),
            audit.clone(),
            records.redemption_settings(&config.redemption),
        );

        let service = Self {
            config,
            clock,
            audit,
            ledger,
            accrual,
            exemptions,
            redemption,
            sync,
            transport: None,
            guard: Mutex::new(()),
        };
        service.apply_records(&records);

        info!(
            "Rewards service ready on {} ({} children)",
            device_id,
            service.ledger.children().len()
        );
        Ok(service)
    }

    /// Attach a cloud transport for `sync_now`
    pub fn with_transport(mut self, transport: Arc<dyn CloudTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &RewardsConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device.id
    }

    /// Reload persisted windows and reconcile enforcement
    pub async fn restore(&self) -> Result<usize> {
        let _guard = self.guard.lock().await;
        self.exemptions.restore()
    }

    /// Dispatch one event from the monitoring collaborator
    ///
    /// Returns the session the event applied to, if any.
    pub async fn handle_event(&self, event: ActivityEvent) -> Result<Option<UsageSession>> {
        debug!("Activity event: {:?}", event);
        let session = match event {
            ActivityEvent::SessionStarted {
                child_id,
                app_id,
                at,
                session_id,
            } => self.start_session(&child_id, &app_id, at, session_id).await,
            ActivityEvent::ActivityTouch { session_id, at } => self.touch(session_id, at).await,
            ActivityEvent::SessionEnded { session_id, at } => self
                .end_session(session_id, at)
                .await
                .with_context(|| format!("Failed to end session {}", session_id))?,
        };
        Ok(session)
    }

    /// Open a learning session, under `session_id` when the monitor supplies one
    pub async fn start_session(
        &self,
        child_id: &ChildId,
        app_id: &AppId,
        at: DateTime<Utc>,
        session_id: Option<SessionId>,
    ) -> Option<UsageSession> {
        let _guard = self.guard.lock().await;
        match session_id {
            Some(id) => self.accrual.start_session_with_id(id, child_id, app_id, at),
            None => self.accrual.start_session(child_id, app_id, at),
        }
    }

    pub async fn touch(&self, session_id: SessionId, at: DateTime<Utc>) -> Option<UsageSession> {
        let _guard = self.guard.lock().await;
        let session = self.accrual.touch(session_id, at);
        if session.is_none() {
            debug!("Touch for session {} which is not open", session_id);
        }
        session
    }

    /// Close a session and credit its points; unknown or closed ids are a no-op
    pub async fn end_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<Option<UsageSession>, LedgerError> {
        self.with_retry("end session", || self.accrual.end_session(session_id, at))
            .await
    }

    pub fn can_redeem(
        &self,
        child_id: &ChildId,
        points: i64,
        reward_app: Option<&AppId>,
    ) -> Result<(), RedemptionError> {
        self.redemption
            .can_redeem_for_app(child_id, points, reward_app)
    }

    /// Spend points on earned time starting now
    pub async fn redeem(
        &self,
        child_id: &ChildId,
        points: i64,
        reward_app: Option<&AppId>,
    ) -> Result<Redemption, RedemptionError> {
        let at = self.clock.now();
        self.with_retry("redeem", || {
            self.redemption
                .redeem_for_app(child_id, points, reward_app, at)
        })
        .await
    }

    /// Manual point correction
    pub async fn adjust(
        &self,
        child_id: &ChildId,
        app_id: Option<&AppId>,
        points: i64,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let at = self.clock.now();
        self.with_retry("adjust", || {
            self.ledger
                .record_adjustment(child_id, app_id, points, reason, at)
        })
        .await
    }

    /// Revoke the child's earned time
    pub async fn cancel(&self, child_id: &ChildId) -> Result<bool, ExemptionError> {
        self.with_retry("cancel", || self.exemptions.cancel(child_id))
            .await
    }

    /// Classify an app on this device
    pub async fn classify_app(
        &self,
        app_id: &AppId,
        category: AppCategory,
        display_name: Option<String>,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let now = self.clock.now();
        let rule = self
            .sync
            .set_classification(app_id, category, display_name, now)?;
        self.audit_config_change(
            metadata([
                ("app_id", rule.app_id.to_string()),
                ("category", format!("{:?}", rule.category).to_lowercase()),
            ]),
            now,
        )?;
        self.apply_records(&self.sync.records());
        info!("Classified {} as {:?}", app_id, category);
        Ok(())
    }

    /// Set the accrual and redemption policy for an app, or the global default
    pub async fn set_policy(
        &self,
        scope: Option<&AppId>,
        accrual: AccrualConfig,
        redemption: RedemptionConfig,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let now = self.clock.now();
        let record = self.sync.set_policy(scope, accrual, redemption, now)?;
        self.audit_config_change(metadata([("scope", record.record_key())]), now)?;
        self.apply_records(&self.sync.records());
        Ok(())
    }

    /// Run one sync pass against the attached transport
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let Some(transport) = self.transport.clone() else {
            anyhow::bail!("No cloud transport configured");
        };
        let _guard = self.guard.lock().await;
        let report = self.sync.run_cycle(
            transport.as_ref(),
            SyncTargets {
                ledger: &self.ledger,
                audit: &self.audit,
                accrual: &self.accrual,
            },
            self.clock.now(),
        )?;
        self.apply_records(&self.sync.records());
        Ok(report)
    }

    pub fn balance(&self, child_id: &ChildId, app_id: Option<&AppId>) -> i64 {
        self.ledger.balance(child_id, app_id)
    }

    pub fn total_balance(&self, child_id: &ChildId) -> i64 {
        self.ledger.total_balance(child_id)
    }

    pub fn balances(&self, child_id: &ChildId) -> BTreeMap<Option<AppId>, i64> {
        self.ledger.balances(child_id)
    }

    pub fn history(&self, child_id: &ChildId, limit: Option<usize>) -> Vec<LedgerEntry> {
        self.ledger.entries(child_id, limit)
    }

    pub fn children(&self) -> Vec<ChildId> {
        let mut children = self.ledger.children();
        for child_id in self.exemptions.children() {
            if !children.contains(&child_id) {
                children.push(child_id);
            }
        }
        children.sort();
        children
    }

    pub fn audit_entries(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        self.audit.entries(limit)
    }

    pub fn active_window(&self, child_id: &ChildId) -> Option<EarnedTimeWindow> {
        self.exemptions.active_window(child_id)
    }

    pub fn queued_windows(&self, child_id: &ChildId) -> Vec<EarnedTimeWindow> {
        self.exemptions.queued_windows(child_id)
    }

    pub fn closed_sessions(&self, child_id: &ChildId) -> Vec<UsageSession> {
        self.accrual.closed_sessions(child_id)
    }

    pub fn records(&self) -> RecordSet {
        self.sync.records()
    }

    pub fn reward_apps(&self) -> AppSet {
        self.exemptions.reward_apps()
    }

    pub fn subscribe_ledger(&self) -> broadcast::Receiver<LedgerEvent> {
        self.ledger.subscribe()
    }

    pub fn subscribe_exemptions(&self) -> broadcast::Receiver<ExemptionEvent> {
        self.exemptions.subscribe()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn audit_config_change(
        &self,
        details: BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.audit
            .record(None, AuditAction::ConfigChanged, details, at)
            .context("Failed to audit configuration change")?;
        Ok(())
    }

    /// Push synced records into the components
    fn apply_records(&self, records: &RecordSet) {
        let redemption = records.redemption_settings(&self.config.redemption);
        let mut effective = self.config.clone();
        effective.redemption = redemption.clone();

        self.accrual.set_classification(records.categories());
        self.accrual
            .set_settings(records.accrual_settings(&self.config.accrual));
        self.redemption.set_settings(redemption);
        self.exemptions.set_policy(effective.stacking_policy());

        let handles = capability_handles(records, self.device_id());
        let mirrored = handles.iter().filter(|h| !h.is_local()).count();
        if mirrored > 0 {
            debug!("{} reward apps are only known from other devices", mirrored);
        }
        self.exemptions.set_reward_apps(AppSet::from_handles(&handles));
    }

    /// Run `attempt` until it succeeds, fails permanently, or the retry
    /// budget is spent; the delay doubles each time with added jitter.
    ///
    /// Each attempt holds the operation guard; the backoff does not, so other
    /// children's sessions keep accruing while a write is retried.
    async fn with_retry<T, E, F>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Retryable + Display,
    {
        let max_retries = self.config.persistence.max_retries;
        let mut retries = 0;

        loop {
            let result = {
                let _guard = self.guard.lock().await;
                attempt()
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < max_retries => {
                    retries += 1;
                    let backoff = self.backoff(retries);
                    warn!(
                        "Failed to {} (attempt {}/{}): {}",
                        operation, retries, max_retries, e
                    );
                    debug!("Retrying in {} ms", backoff.as_millis());
                    sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("Failed to {} after {} retries: {}", operation, retries, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.persistence.retry_interval_ms;
        let exponential = base.saturating_mul(2_u64.saturating_pow(retry.saturating_sub(1)));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(exponential.saturating_add(jitter))
    }
}
