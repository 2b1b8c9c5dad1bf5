//! Spending points on earned time.
//!
//! A redemption either completes in full (ledger debited, window started)
//! or leaves the balance as it was. If the window cannot be started after
//! the ledger was debited, each debit is compensated with an adjustment.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{AllocationOrder, RedemptionConfig, RedemptionSettings};
use crate::error::{LedgerError, PersistenceError, RedemptionError};
use crate::ids::{AppId, ChildId};
use crate::rewards::audit::{AuditAction, AuditLog, metadata};
use crate::rewards::exemption::ExemptionManager;
use crate::rewards::ledger::{Ledger, LedgerEntry};
use crate::rewards::window::EarnedTimeWindow;

/// A completed redemption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub points: i64,
    pub seconds: i64,
    /// One debit per drawn scope
    pub entries: Vec<LedgerEntry>,
    pub window: EarnedTimeWindow,
}

/// Split `points` across positive balances in allocation order
pub fn allocate(
    balances: &BTreeMap<Option<AppId>, i64>,
    points: i64,
    order: AllocationOrder,
) -> Vec<(Option<AppId>, i64)> {
    let mut candidates: Vec<(&Option<AppId>, i64)> = balances
        .iter()
        .filter(|(_, balance)| **balance > 0)
        .map(|(scope, balance)| (scope, *balance))
        .collect();

    match order {
        AllocationOrder::LargestBalanceFirst => {
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        }
        AllocationOrder::GlobalPoolFirst => {
            candidates.sort_by(|a, b| {
                a.0.is_some()
                    .cmp(&b.0.is_some())
                    .then_with(|| b.1.cmp(&a.1))
                    .then_with(|| a.0.cmp(b.0))
            });
        }
    }

    let mut left = points;
    let mut drawn = Vec::new();
    for (scope, balance) in candidates {
        if left <= 0 {
            break;
        }
        let take = balance.min(left);
        drawn.push((scope.clone(), take));
        left -= take;
    }
    drawn
}

pub struct RedemptionService {
    ledger: Arc<Ledger>,
    exemptions: ExemptionManager,
    audit: Arc<AuditLog>,
    settings: RwLock<RedemptionSettings>,
}

impl RedemptionService {
    pub fn new(
        ledger: Arc<Ledger>,
        exemptions: ExemptionManager,
        audit: Arc<AuditLog>,
        settings: RedemptionSettings,
    ) -> Self {
        Self {
            ledger,
            exemptions,
            audit,
            settings: RwLock::new(settings),
        }
    }

    pub fn set_settings(&self, settings: RedemptionSettings) {
        *self.settings.write() = settings;
    }

    pub fn config_for(&self, reward_app: Option<&AppId>) -> RedemptionConfig {
        self.settings.read().for_app(reward_app)
    }

    /// Points the child can spend.
    ///
    /// Only positive scopes can be drawn from, and a negative scope still
    /// counts against the total, so this is the smaller of the two sums.
    pub fn available_points(&self, child_id: &ChildId) -> i64 {
        let balances = self.ledger.balances(child_id);
        let drawable: i64 = balances.values().filter(|b| **b > 0).sum();
        let total: i64 = balances.values().sum();
        drawable.min(total).max(0)
    }

    /// Check a redemption against the global redemption config
    pub fn can_redeem(&self, child_id: &ChildId, points: i64) -> Result<(), RedemptionError> {
        self.can_redeem_for_app(child_id, points, None)
    }

    /// Check a redemption against the config for a reward app
    pub fn can_redeem_for_app(
        &self,
        child_id: &ChildId,
        points: i64,
        reward_app: Option<&AppId>,
    ) -> Result<(), RedemptionError> {
        let config = self.config_for(reward_app);
        self.validate(child_id, points, &config)
    }

    /// Spend points on earned time under the global redemption config
    pub fn redeem(
        &self,
        child_id: &ChildId,
        points: i64,
        at: DateTime<Utc>,
    ) -> Result<Redemption, RedemptionError> {
        self.redeem_for_app(child_id, points, None, at)
    }

    /// Spend points on earned time, converted with the reward app's config
    pub fn redeem_for_app(
        &self,
        child_id: &ChildId,
        points: i64,
        reward_app: Option<&AppId>,
        at: DateTime<Utc>,
    ) -> Result<Redemption, RedemptionError> {
        // A reward app with its own config also brings its own extend cap
        let (config, order, stacking_cap) = {
            let settings = self.settings.read();
            let stacking_cap = reward_app
                .and_then(|id| settings.apps.get(id))
                .map(|app| app.max_stacked_minutes * 60);
            (
                settings.for_app(reward_app),
                settings.allocation_order,
                stacking_cap,
            )
        };
        self.validate(child_id, points, &config)?;

        let seconds = config.seconds_for_points(points);
        if seconds <= 0 {
            return Err(RedemptionError::NoEarnedTime { points });
        }

        if let Some(headroom) = self
            .exemptions
            .stacking_headroom_with_cap(child_id, stacking_cap)
        {
            if seconds > headroom {
                let max_redeemable_points = config.points_for_seconds(headroom);
                debug!(
                    "Redemption of {} points for {} exceeds stacking headroom of {}s",
                    points, child_id, headroom
                );
                return Err(RedemptionError::StackingCapExceeded {
                    max_redeemable_points,
                });
            }
        }

        let allocation = allocate(&self.ledger.balances(child_id), points, order);
        let mut entries = Vec::with_capacity(allocation.len());
        for (scope, amount) in &allocation {
            match self
                .ledger
                .record_redemption(child_id, scope.as_ref(), *amount, at)
            {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("Redemption debit failed for {}: {}", child_id, e);
                    return Err(self.roll_back(child_id, &entries, at, &e.to_string(), e.into()));
                }
            }
        }

        let window = EarnedTimeWindow::new(child_id.clone(), at, seconds);
        let window = match self
            .exemptions
            .start_exemption_capped(child_id, window, None, stacking_cap)
        {
            Ok(window) => window,
            Err(e) => {
                warn!("Could not start earned time for {}: {}", child_id, e);
                return Err(self.roll_back(child_id, &entries, at, &e.to_string(), e.into()));
            }
        };

        info!(
            "{} redeemed {} points for {}s across {} scopes",
            child_id,
            points,
            seconds,
            entries.len()
        );
        Ok(Redemption {
            points,
            seconds,
            entries,
            window,
        })
    }

    fn validate(
        &self,
        child_id: &ChildId,
        points: i64,
        config: &RedemptionConfig,
    ) -> Result<(), RedemptionError> {
        if points <= 0 {
            return Err(RedemptionError::InvalidAmount(points));
        }
        if points < config.min_redemption_points {
            return Err(RedemptionError::BelowMinimum {
                points,
                min: config.min_redemption_points,
            });
        }
        if points > config.max_redemption_points {
            return Err(RedemptionError::AboveMaximum {
                points,
                max: config.max_redemption_points,
            });
        }
        let available = self.available_points(child_id);
        if points > available {
            return Err(RedemptionError::InsufficientBalance {
                requested: points,
                available,
            });
        }
        Ok(())
    }

    /// Compensate `debits` and return the error to report
    fn roll_back(
        &self,
        child_id: &ChildId,
        debits: &[LedgerEntry],
        at: DateTime<Utc>,
        cause: &str,
        failure: RedemptionError,
    ) -> RedemptionError {
        if debits.is_empty() {
            return failure;
        }

        for debit in debits {
            let reason = format!("rollback of redemption {}", debit.id);
            if let Err(e) =
                self.ledger
                    .record_adjustment(child_id, debit.app_id.as_ref(), -debit.amount, &reason, at)
            {
                error!(
                    "Failed to compensate redemption {} for {}: {}",
                    debit.id, child_id, e
                );
                let error = match e {
                    LedgerError::Persistence(e) => e,
                    other => PersistenceError {
                        target: format!("ledger for {}", child_id),
                        message: other.to_string(),
                    },
                };
                return RedemptionError::RollbackFailed(error);
            }
        }

        let points: i64 = debits.iter().map(|d| -d.amount).sum();
        let details = metadata([
            ("points", points.to_string()),
            ("cause", cause.to_string()),
        ]);
        if let Err(e) =
            self.audit
                .record(Some(child_id), AuditAction::RedemptionRolledBack, details, at)
        {
            error!("Failed to audit redemption rollback for {}: {}", child_id, e);
        }

        info!("Rolled back redemption of {} points for {}", points, child_id);
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::FailureKind;
    use crate::ids::DeviceId;
    use crate::rewards::enforcement::RecordingEnforcer;
    use crate::rewards::ledger::EntryKind;
    use crate::rewards::window::StackingPolicy;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    struct Harness {
        store: Arc<MemoryStore>,
        audit: Arc<AuditLog>,
        ledger: Arc<Ledger>,
        exemptions: ExemptionManager,
        clock: Arc<ManualClock>,
        service: RedemptionService,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 16, 15, 0, 0).unwrap()
    }

    fn kid() -> ChildId {
        ChildId::new("kid1")
    }

    fn math() -> AppId {
        AppId::new("app:math")
    }

    fn reading() -> AppId {
        AppId::new("app:reading")
    }

    fn harness(policy: StackingPolicy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditLog::new(store.clone(), DeviceId::new("child-tablet")));
        let ledger = Arc::new(Ledger::new(store.clone(), audit.clone()));
        let clock = Arc::new(ManualClock::new(t0()));
        let exemptions = ExemptionManager::new(
            store.clone(),
            Arc::new(RecordingEnforcer::new()),
            audit.clone(),
            clock.clone(),
            policy,
        );
        let service = RedemptionService::new(
            ledger.clone(),
            exemptions.clone(),
            audit.clone(),
            RedemptionSettings::default(),
        );
        Harness {
            store,
            audit,
            ledger,
            exemptions,
            clock,
            service,
        }
    }

    fn extend() -> StackingPolicy {
        StackingPolicy::Extend { cap_seconds: 7200 }
    }

    #[tokio::test]
    async fn test_redeem_60_of_65_points() {
        let h = harness(extend());
        h.ledger.record_accrual(&kid(), Some(&math()), 65, t0()).unwrap();

        let redemption = h.service.redeem(&kid(), 60, h.clock.now()).unwrap();

        assert_eq!(redemption.seconds, 360);
        assert_eq!(redemption.window.duration_seconds, 360);
        assert_eq!(h.ledger.total_balance(&kid()), 5);
        assert_eq!(
            h.exemptions.active_window(&kid()).map(|w| w.id),
            Some(redemption.window.id)
        );
    }

    #[test]
    fn test_validation_order() {
        let h = harness(extend());
        h.ledger.record_accrual(&kid(), None, 5, t0()).unwrap();

        assert_eq!(
            h.service.can_redeem(&kid(), 5),
            Err(RedemptionError::BelowMinimum { points: 5, min: 10 })
        );
        assert_eq!(
            h.service.can_redeem(&kid(), 601),
            Err(RedemptionError::AboveMaximum {
                points: 601,
                max: 600
            })
        );
        assert_eq!(
            h.service.can_redeem(&kid(), 60),
            Err(RedemptionError::InsufficientBalance {
                requested: 60,
                available: 5
            })
        );
        assert_eq!(
            h.service.can_redeem(&kid(), 60).unwrap_err().outcome(),
            FailureKind::TryAgain
        );
    }

    #[test]
    fn test_negative_balances_are_not_available() {
        let h = harness(extend());
        h.ledger.record_accrual(&kid(), Some(&math()), 40, t0()).unwrap();
        h.ledger
            .record_adjustment(&kid(), None, -30, "penalty", t0())
            .unwrap();

        assert_eq!(h.service.available_points(&kid()), 10);
        assert_eq!(
            h.service.can_redeem(&kid(), 40),
            Err(RedemptionError::InsufficientBalance {
                requested: 40,
                available: 10
            })
        );
    }

    #[test]
    fn test_overdrawn_total_has_nothing_available() {
        let h = harness(extend());
        h.ledger.record_accrual(&kid(), Some(&math()), 20, t0()).unwrap();
        h.ledger
            .record_adjustment(&kid(), None, -50, "penalty", t0())
            .unwrap();

        assert_eq!(h.service.available_points(&kid()), 0);
    }

    #[test]
    fn test_allocation_largest_first_with_ties() {
        let mut balances = BTreeMap::new();
        balances.insert(None, 10);
        balances.insert(Some(reading()), 30);
        balances.insert(Some(math()), 30);
        balances.insert(Some(AppId::new("app:empty")), -4);

        let drawn = allocate(&balances, 50, AllocationOrder::LargestBalanceFirst);
        assert_eq!(drawn, vec![(Some(math()), 30), (Some(reading()), 20)]);

        let drawn = allocate(&balances, 50, AllocationOrder::GlobalPoolFirst);
        assert_eq!(
            drawn,
            vec![(None, 10), (Some(math()), 30), (Some(reading()), 10)]
        );
    }

    #[test]
    fn test_allocation_tie_prefers_global_pool() {
        let mut balances = BTreeMap::new();
        balances.insert(Some(math()), 20);
        balances.insert(None, 20);

        let drawn = allocate(&balances, 25, AllocationOrder::LargestBalanceFirst);
        assert_eq!(drawn, vec![(None, 20), (Some(math()), 5)]);
    }

    #[tokio::test]
    async fn test_redeem_draws_each_scope() {
        let h = harness(extend());
        h.ledger.record_accrual(&kid(), Some(&math()), 30, t0()).unwrap();
        h.ledger.record_accrual(&kid(), Some(&reading()), 20, t0()).unwrap();

        let redemption = h.service.redeem(&kid(), 40, t0()).unwrap();

        assert_eq!(redemption.entries.len(), 2);
        assert_eq!(h.ledger.balance(&kid(), Some(&math())), 0);
        assert_eq!(h.ledger.balance(&kid(), Some(&reading())), 10);
        assert!(redemption
            .entries
            .iter()
            .all(|e| e.kind == EntryKind::Redemption && e.amount < 0));
    }

    #[tokio::test]
    async fn test_stacking_cap_rejects_without_deducting() {
        let h = harness(StackingPolicy::Extend { cap_seconds: 600 });
        h.ledger.record_accrual(&kid(), None, 200, t0()).unwrap();
        h.service.redeem(&kid(), 80, t0()).unwrap();

        // 480s remain, so only 120s (20 points) fit
        let result = h.service.redeem(&kid(), 30, t0());

        assert_eq!(
            result,
            Err(RedemptionError::StackingCapExceeded {
                max_redeemable_points: 20
            })
        );
        assert_eq!(h.ledger.total_balance(&kid()), 120);
        assert!(h.service.redeem(&kid(), 20, t0()).is_ok());
    }

    #[tokio::test]
    async fn test_blocked_window_is_rolled_back() {
        let h = harness(StackingPolicy::Block);
        h.ledger.record_accrual(&kid(), Some(&math()), 100, t0()).unwrap();
        h.service.redeem(&kid(), 30, t0()).unwrap();

        let result = h.service.redeem(&kid(), 30, t0());

        assert_eq!(result, Err(RedemptionError::StackingPolicyViolation));
        assert_eq!(h.ledger.total_balance(&kid()), 70);
        let kinds: Vec<EntryKind> = h
            .ledger
            .entries(&kid(), Some(2))
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&EntryKind::Adjustment));
        assert!(h
            .audit
            .entries(None)
            .iter()
            .any(|e| e.action == AuditAction::RedemptionRolledBack));
    }

    #[tokio::test]
    async fn test_window_persist_failure_restores_balance() {
        let h = harness(extend());
        h.ledger.record_accrual(&kid(), None, 100, t0()).unwrap();
        h.store.fail_writes_to(Some("windows"));

        let err = h.service.redeem(&kid(), 60, t0()).unwrap_err();

        assert!(matches!(err, RedemptionError::Persistence(_)));
        assert_eq!(err.outcome(), FailureKind::PointsSafe);
        assert_eq!(h.ledger.total_balance(&kid()), 100);
        assert!(h.exemptions.active_window(&kid()).is_none());
    }

    #[tokio::test]
    async fn test_per_app_conversion() {
        let h = harness(extend());
        let game = AppId::new("app:game");
        let mut settings = RedemptionSettings::default();
        settings.apps.insert(
            game.clone(),
            RedemptionConfig {
                points_per_minute: 20,
                ..RedemptionConfig::default()
            },
        );
        h.service.set_settings(settings);
        h.ledger.record_accrual(&kid(), None, 100, t0()).unwrap();

        let redemption = h
            .service
            .redeem_for_app(&kid(), 60, Some(&game), t0())
            .unwrap();

        assert_eq!(redemption.seconds, 180);
    }

    #[tokio::test]
    async fn test_per_app_stacking_cap() {
        let h = harness(extend());
        let game = AppId::new("app:game");
        let mut settings = RedemptionSettings::default();
        settings.apps.insert(
            game.clone(),
            RedemptionConfig {
                max_stacked_minutes: 10,
                ..RedemptionConfig::default()
            },
        );
        h.service.set_settings(settings);
        h.ledger.record_accrual(&kid(), None, 300, t0()).unwrap();
        h.service.redeem_for_app(&kid(), 60, Some(&game), t0()).unwrap();

        // 360s remain under a 600s cap, so 240s (40 points) fit
        let result = h.service.redeem_for_app(&kid(), 50, Some(&game), t0());
        assert_eq!(
            result,
            Err(RedemptionError::StackingCapExceeded {
                max_redeemable_points: 40
            })
        );
        assert_eq!(h.ledger.total_balance(&kid()), 240);

        let redemption = h
            .service
            .redeem_for_app(&kid(), 40, Some(&game), t0())
            .unwrap();
        assert_eq!(redemption.window.duration_seconds, 600);

        // The global default keeps the wider policy cap
        assert!(h.service.redeem(&kid(), 50, t0()).is_ok());
    }
}
