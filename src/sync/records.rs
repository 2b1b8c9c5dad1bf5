//! Mutable records shared between devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::config::{
    AccrualConfig, AccrualSettings, AppCategory, RedemptionConfig, RedemptionSettings,
    RewardsConfig,
};
use crate::ids::{AppId, DeviceId};
use crate::sync::resolver::{Resolution, Side, SyncableRecord, resolve, union_sorted};

/// Record families exchanged with the cloud transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    LedgerEntry,
    AuditEntry,
    UsageSession,
    AppClassification,
    RewardPolicy,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::LedgerEntry,
        RecordKind::AuditEntry,
        RecordKind::UsageSession,
        RecordKind::AppClassification,
        RecordKind::RewardPolicy,
    ];

    /// Append-only kinds are merged by id, never resolved
    pub fn is_append_only(self) -> bool {
        matches!(
            self,
            RecordKind::LedgerEntry | RecordKind::AuditEntry | RecordKind::UsageSession
        )
    }
}

/// Classification of an app as learning, reward or neutral
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppClassificationRule {
    pub app_id: AppId,
    pub category: AppCategory,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Devices on which the app has been seen
    #[serde(default)]
    pub device_ids: Vec<DeviceId>,
    pub modified_at: DateTime<Utc>,
    pub origin_device: DeviceId,
}

impl SyncableRecord for AppClassificationRule {
    fn record_key(&self) -> String {
        self.app_id.to_string()
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn origin_device(&self) -> &DeviceId {
        &self.origin_device
    }

    fn union_list_fields(&mut self, other: &Self) {
        self.device_ids = union_sorted(&self.device_ids, &other.device_ids);
    }
}

/// Accrual and redemption policy for one app, or the global default
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RewardPolicyRecord {
    /// `None` is the global default
    pub scope: Option<AppId>,
    pub accrual: AccrualConfig,
    pub redemption: RedemptionConfig,
    pub modified_at: DateTime<Utc>,
    pub origin_device: DeviceId,
}

impl RewardPolicyRecord {
    pub fn scope_key(scope: Option<&AppId>) -> String {
        match scope {
            Some(app_id) => app_id.to_string(),
            None => "*".to_string(),
        }
    }
}

impl SyncableRecord for RewardPolicyRecord {
    fn record_key(&self) -> String {
        Self::scope_key(self.scope.as_ref())
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn origin_device(&self) -> &DeviceId {
        &self.origin_device
    }
}

/// Local copy of every mutable record
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RecordSet {
    #[serde(default)]
    pub classifications: BTreeMap<String, AppClassificationRule>,
    #[serde(default)]
    pub policies: BTreeMap<String, RewardPolicyRecord>,
}

impl RecordSet {
    /// Records equivalent to a config file, stamped at the Unix epoch so any
    /// real edit on another device wins
    pub fn from_config(config: &RewardsConfig) -> Self {
        let seeded_at = DateTime::<Utc>::UNIX_EPOCH;
        let device = config.device.id.clone();
        let mut records = Self::default();

        for rule in &config.apps {
            let record = AppClassificationRule {
                app_id: rule.app_id.clone(),
                category: rule.category,
                display_name: rule.display_name.clone(),
                device_ids: vec![device.clone()],
                modified_at: seeded_at,
                origin_device: device.clone(),
            };
            records.classifications.insert(record.record_key(), record);
        }

        let global = RewardPolicyRecord {
            scope: None,
            accrual: config.accrual.default,
            redemption: config.redemption.default,
            modified_at: seeded_at,
            origin_device: device.clone(),
        };
        records.policies.insert(global.record_key(), global);

        for (app_id, accrual) in &config.accrual.apps {
            let record = RewardPolicyRecord {
                scope: Some(app_id.clone()),
                accrual: *accrual,
                redemption: config.redemption.for_app(Some(app_id)),
                modified_at: seeded_at,
                origin_device: device.clone(),
            };
            records.policies.insert(record.record_key(), record);
        }
        for (app_id, redemption) in &config.redemption.apps {
            let key = RewardPolicyRecord::scope_key(Some(app_id));
            records
                .policies
                .entry(key)
                .or_insert_with(|| RewardPolicyRecord {
                    scope: Some(app_id.clone()),
                    accrual: config.accrual.for_app(app_id),
                    redemption: *redemption,
                    modified_at: seeded_at,
                    origin_device: device.clone(),
                });
        }

        records
    }

    /// Category per app
    pub fn categories(&self) -> HashMap<AppId, AppCategory> {
        self.classifications
            .values()
            .map(|r| (r.app_id.clone(), r.category))
            .collect()
    }

    /// Accrual settings with synced policies applied over `base`
    pub fn accrual_settings(&self, base: &AccrualSettings) -> AccrualSettings {
        let mut settings = base.clone();
        for policy in self.policies.values() {
            match &policy.scope {
                Some(app_id) => {
                    settings.apps.insert(app_id.clone(), policy.accrual);
                }
                None => settings.default = policy.accrual,
            }
        }
        settings
    }

    /// Redemption settings with synced policies applied over `base`
    pub fn redemption_settings(&self, base: &RedemptionSettings) -> RedemptionSettings {
        let mut settings = base.clone();
        for policy in self.policies.values() {
            match &policy.scope {
                Some(app_id) => {
                    settings.apps.insert(app_id.clone(), policy.redemption);
                }
                None => settings.default = policy.redemption,
            }
        }
        settings
    }

    /// Fold a remote copy into the set; returns which side won
    pub fn merge_classification(&mut self, remote: AppClassificationRule) -> Side {
        merge_into(&mut self.classifications, remote)
    }

    /// Fold a remote copy into the set; returns which side won
    pub fn merge_policy(&mut self, remote: RewardPolicyRecord) -> Side {
        merge_into(&mut self.policies, remote)
    }
}

pub(crate) fn merge_into<T: SyncableRecord>(records: &mut BTreeMap<String, T>, remote: T) -> Side {
    let key = remote.record_key();
    match records.get(&key) {
        Some(local) => {
            let Resolution { record, winner } = resolve(local, &remote);
            records.insert(key, record);
            winner
        }
        None => {
            records.insert(key, remote);
            Side::Remote
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppRule;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 16, 9, 0, 0).unwrap()
    }

    fn rule(category: AppCategory, at: DateTime<Utc>, device: &str) -> AppClassificationRule {
        AppClassificationRule {
            app_id: AppId::new("app:video"),
            category,
            display_name: None,
            device_ids: vec![DeviceId::new(device)],
            modified_at: at,
            origin_device: DeviceId::new(device),
        }
    }

    #[test]
    fn test_from_config_seeds_rules_and_global_policy() {
        let mut config = RewardsConfig::for_device(DeviceId::new("parent-a"));
        config.apps.push(AppRule {
            app_id: AppId::new("app:math"),
            category: AppCategory::Learning,
            display_name: None,
        });

        let records = RecordSet::from_config(&config);

        assert_eq!(
            records.categories().get(&AppId::new("app:math")),
            Some(&AppCategory::Learning)
        );
        assert!(records.policies.contains_key("*"));
    }

    #[test]
    fn test_remote_later_classification_wins() {
        let mut records = RecordSet::default();
        records.merge_classification(rule(AppCategory::Learning, t0(), "parent-a"));

        let side = records.merge_classification(rule(
            AppCategory::Reward,
            t0() + Duration::seconds(1),
            "parent-b",
        ));

        assert_eq!(side, Side::Remote);
        let merged = &records.classifications["app:video"];
        assert_eq!(merged.category, AppCategory::Reward);
        assert_eq!(
            merged.device_ids,
            vec![DeviceId::new("parent-a"), DeviceId::new("parent-b")]
        );
    }

    #[test]
    fn test_policy_overrides_base_settings() {
        let mut records = RecordSet::default();
        let app_id = AppId::new("app:math");
        records.merge_policy(RewardPolicyRecord {
            scope: Some(app_id.clone()),
            accrual: AccrualConfig {
                points_per_minute: 2,
                daily_cap_points: 50,
                idle_timeout_seconds: 30,
            },
            redemption: RedemptionConfig::default(),
            modified_at: t0(),
            origin_device: DeviceId::new("parent-a"),
        });

        let settings = records.accrual_settings(&AccrualSettings::default());
        assert_eq!(settings.for_app(&app_id).points_per_minute, 2);
        assert_eq!(settings.default.points_per_minute, 10);
    }

    #[test]
    fn test_append_only_kinds() {
        assert!(RecordKind::LedgerEntry.is_append_only());
        assert!(RecordKind::UsageSession.is_append_only());
        assert!(!RecordKind::AppClassification.is_append_only());
    }
}
