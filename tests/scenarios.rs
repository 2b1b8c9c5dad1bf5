//! End-to-end scenarios across accrual, redemption, exemptions and sync.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use screen_rewards::config::{AppCategory, AppRule, StackingMode};
use screen_rewards::rewards::RecordingEnforcer;
use screen_rewards::sync::MemoryTransport;
use screen_rewards::{
    AppId, ChildId, Clock, DeviceId, JsonFileStore, ManualClock, MemoryStore, RedemptionError,
    RewardsConfig, RewardsService, SessionId, Store,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 16, 9, 0, 0).unwrap()
}

fn kid() -> ChildId {
    ChildId::new("kid1")
}

fn math() -> AppId {
    AppId::new("app:math")
}

fn game() -> AppId {
    AppId::new("app:game")
}

fn config(device: &str) -> RewardsConfig {
    let mut config = RewardsConfig::for_device(DeviceId::new(device));
    config.persistence.retry_interval_ms = 10;
    config.apps = vec![
        AppRule {
            app_id: math(),
            category: AppCategory::Learning,
            display_name: Some("Math".to_string()),
        },
        AppRule {
            app_id: game(),
            category: AppCategory::Reward,
            display_name: Some("Game".to_string()),
        },
    ];
    config
}

struct Device {
    clock: Arc<ManualClock>,
    enforcer: Arc<RecordingEnforcer>,
    service: RewardsService,
}

impl Device {
    fn open(config: RewardsConfig, store: Arc<dyn Store>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let enforcer = Arc::new(RecordingEnforcer::new());
        let service =
            RewardsService::open(config, store, enforcer.clone(), clock.clone()).unwrap();
        Self {
            clock,
            enforcer,
            service,
        }
    }

    fn in_memory(device: &str) -> Self {
        Self::open(config(device), Arc::new(MemoryStore::new()))
    }

    async fn advance(&self, seconds: i64) {
        self.clock.advance(Duration::seconds(seconds));
        tokio::time::advance(std::time::Duration::from_secs(seconds as u64)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    /// Learning session with a touch every minute; `None` when none opened
    async fn learn(&self, app: &AppId, seconds: i64) -> Option<SessionId> {
        let start = self.clock.now();
        let end = start + Duration::seconds(seconds);
        self.clock.set(end);
        let Some(session) = self.service.start_session(&kid(), app, start, None).await else {
            return None;
        };
        let mut offset = 60;
        while offset < seconds {
            self.service
                .touch(session.id, start + Duration::seconds(offset))
                .await;
            offset += 60;
        }
        self.service.end_session(session.id, end).await.unwrap();
        Some(session.id)
    }
}

#[tokio::test(start_paused = true)]
async fn earn_redeem_and_expire() {
    let device = Device::in_memory("tablet");

    device.learn(&math(), 390).await;
    assert_eq!(device.service.total_balance(&kid()), 65);

    let redemption = device.service.redeem(&kid(), 60, None).await.unwrap();
    assert_eq!(redemption.window.duration_seconds, 360);
    assert_eq!(device.service.total_balance(&kid()), 5);
    assert!(device.enforcer.is_lifted(&kid()));

    device.advance(360).await;
    assert!(redemption.window.is_expired(device.clock.now()));
    assert!(device.service.active_window(&kid()).is_none());
    assert!(!device.enforcer.is_lifted(&kid()));
}

#[tokio::test(start_paused = true)]
async fn balance_matches_history_after_mixed_operations() {
    let device = Device::in_memory("tablet");

    device.learn(&math(), 600).await;
    device
        .service
        .adjust(&kid(), None, 40, "chores")
        .await
        .unwrap();
    device.service.redeem(&kid(), 30, None).await.unwrap();
    device
        .service
        .adjust(&kid(), Some(&math()), -5, "correction")
        .await
        .unwrap();

    let sum: i64 = device
        .service
        .history(&kid(), None)
        .iter()
        .map(|e| e.amount)
        .sum();
    assert_eq!(device.service.total_balance(&kid()), sum);
    assert_eq!(sum, 100 + 40 - 30 - 5);
}

#[tokio::test(start_paused = true)]
async fn failed_redemption_changes_nothing() {
    let device = Device::in_memory("tablet");
    device
        .service
        .adjust(&kid(), None, 50, "gift")
        .await
        .unwrap();

    let err = device.service.redeem(&kid(), 80, None).await.unwrap_err();
    assert!(matches!(err, RedemptionError::InsufficientBalance { .. }));
    let err = device.service.redeem(&kid(), 5, None).await.unwrap_err();
    assert!(matches!(err, RedemptionError::BelowMinimum { .. }));

    assert_eq!(device.service.total_balance(&kid()), 50);
    assert!(device.service.active_window(&kid()).is_none());
    assert!(!device.enforcer.is_lifted(&kid()));
}

#[tokio::test(start_paused = true)]
async fn ending_a_session_twice_credits_once() {
    let device = Device::in_memory("tablet");
    let session_id = device.learn(&math(), 120).await.unwrap();

    let again = device
        .service
        .end_session(session_id, device.clock.now())
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(device.service.history(&kid(), None).len(), 1);
    assert_eq!(device.service.total_balance(&kid()), 20);
}

#[tokio::test(start_paused = true)]
async fn daily_cap_clamps_last_accrual() {
    let mut config = config("tablet");
    config.accrual.default.daily_cap_points = 100;
    let device = Device::open(config, Arc::new(MemoryStore::new()));

    device.learn(&math(), 480).await;
    assert_eq!(device.service.total_balance(&kid()), 80);

    device.learn(&math(), 300).await;
    let entries = device.service.history(&kid(), None);
    assert_eq!(entries[0].amount, 20);
    assert_eq!(device.service.total_balance(&kid()), 100);

    device.learn(&math(), 300).await;
    assert_eq!(device.service.total_balance(&kid()), 100);
}

#[tokio::test(start_paused = true)]
async fn second_redemption_extends_up_to_cap() {
    let mut config = config("tablet");
    config.stacking = StackingMode::Extend;
    config.redemption.default.max_stacked_minutes = 15;
    let device = Device::open(config, Arc::new(MemoryStore::new()));
    device
        .service
        .adjust(&kid(), None, 500, "gift")
        .await
        .unwrap();

    let first = device.service.redeem(&kid(), 60, None).await.unwrap();
    device.advance(120).await;
    let remaining = first.window.remaining_seconds(device.clock.now());
    assert_eq!(remaining, 240);

    let second = device.service.redeem(&kid(), 60, None).await.unwrap();
    assert_eq!(second.window.id, first.window.id);
    assert_eq!(
        second.window.remaining_seconds(device.clock.now()),
        (remaining + 360).min(15 * 60)
    );

    // 600s remaining, 300s of headroom; 60 points would add 360s
    let err = device.service.redeem(&kid(), 60, None).await.unwrap_err();
    assert!(matches!(err, RedemptionError::StackingCapExceeded { .. }));
    assert_eq!(device.service.total_balance(&kid()), 380);
}

#[tokio::test(start_paused = true)]
async fn later_classification_wins_on_both_devices() {
    let transport = Arc::new(MemoryTransport::new());
    let a = Device::in_memory("device-a");
    let b = Device::in_memory("device-b");
    let a = Device {
        service: a.service.with_transport(transport.clone()),
        ..a
    };
    let b = Device {
        service: b.service.with_transport(transport.clone()),
        ..b
    };
    let chess = AppId::new("app:chess");

    a.service
        .classify_app(&chess, AppCategory::Learning, None)
        .await
        .unwrap();
    b.advance(1).await;
    b.service
        .classify_app(&chess, AppCategory::Reward, Some("Chess".to_string()))
        .await
        .unwrap();

    a.service.sync_now().await.unwrap();
    b.service.sync_now().await.unwrap();
    a.service.sync_now().await.unwrap();

    for device in [&a, &b] {
        let records = device.service.records();
        let rule = &records.classifications["app:chess"];
        assert_eq!(rule.category, AppCategory::Reward);
        assert_eq!(rule.origin_device, DeviceId::new("device-b"));
        assert!(device.service.reward_apps().contains(&chess));
    }
}

#[tokio::test(start_paused = true)]
async fn points_earned_on_one_device_appear_on_the_other() {
    let transport = Arc::new(MemoryTransport::new());
    let a = Device::in_memory("device-a");
    let b = Device::in_memory("device-b");
    let a = Device {
        service: a.service.with_transport(transport.clone()),
        ..a
    };
    let b = Device {
        service: b.service.with_transport(transport.clone()),
        ..b
    };

    a.learn(&math(), 300).await;
    b.service
        .adjust(&kid(), None, 10, "bonus")
        .await
        .unwrap();

    a.service.sync_now().await.unwrap();
    b.service.sync_now().await.unwrap();
    a.service.sync_now().await.unwrap();

    assert_eq!(a.service.total_balance(&kid()), 60);
    assert_eq!(b.service.total_balance(&kid()), 60);
    assert_eq!(b.service.closed_sessions(&kid()).len(), 1);

    // A second pass has nothing new to merge
    let report = b.service.sync_now().await.unwrap();
    assert_eq!(report.ledger_entries_merged, 0);
    assert_eq!(b.service.total_balance(&kid()), 60);
}

#[tokio::test(start_paused = true)]
async fn windows_and_balances_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        let store = JsonFileStore::open(dir.path()).unwrap();
        Device::open(config("tablet"), Arc::new(store))
    };

    let window_id = {
        let device = open();
        device
            .service
            .adjust(&kid(), None, 100, "gift")
            .await
            .unwrap();
        let redemption = device.service.redeem(&kid(), 60, None).await.unwrap();
        redemption.window.id
    };

    let device = open();
    assert_eq!(device.service.total_balance(&kid()), 40);
    assert_eq!(device.service.restore().await.unwrap(), 1);
    assert_eq!(
        device.service.active_window(&kid()).map(|w| w.id),
        Some(window_id)
    );
    assert!(device.enforcer.is_lifted(&kid()));
    assert_eq!(device.service.audit_entries(None).len(), 2);

    device.advance(360).await;
    assert!(device.service.active_window(&kid()).is_none());
    assert!(!device.enforcer.is_lifted(&kid()));
}
