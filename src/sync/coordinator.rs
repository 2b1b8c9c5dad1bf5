//! One synchronization pass against the cloud transport.
//!
//! For every record kind: fetch what changed since the stored token, fold
//! it into the local components, then upload whatever the remote side does
//! not have yet. Append-only kinds go through the components' merge
//! operations; mutable kinds are resolved last-writer-wins.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AccrualConfig, AppCategory, RedemptionConfig, RewardsConfig};
use crate::ids::{AppId, DeviceId};
use crate::rewards::accrual::AccrualEngine;
use crate::rewards::audit::{AuditEntry, AuditLog};
use crate::rewards::ledger::{Ledger, LedgerEntry};
use crate::store::Store;
use crate::sync::records::{
    AppClassificationRule, RecordKind, RecordSet, RewardPolicyRecord, merge_into,
};
use crate::sync::resolver::{AppendOnly, Side, SyncableRecord, union_sorted};
use crate::sync::transport::{ChangeToken, CloudTransport};

/// Persisted synchronization state
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncState {
    /// Last change token seen per record kind
    #[serde(default)]
    pub tokens: BTreeMap<RecordKind, ChangeToken>,

    /// Local copy of the mutable records
    #[serde(default)]
    pub records: RecordSet,

    /// Version of every record known to be on the remote side
    #[serde(default)]
    pub published: BTreeMap<RecordKind, BTreeMap<String, String>>,

    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

/// What a sync pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub ledger_entries_merged: usize,
    pub audit_entries_merged: usize,
    pub sessions_merged: usize,
    /// Mutable records where the remote copy won
    pub remote_wins: usize,
    pub pushed: usize,
    /// Remote records that could not be decoded
    pub skipped: usize,
}

/// Local components a sync pass merges into
pub struct SyncTargets<'a> {
    pub ledger: &'a Ledger,
    pub audit: &'a AuditLog,
    pub accrual: &'a AccrualEngine,
}

pub struct SyncCoordinator {
    store: Arc<dyn Store>,
    device_id: DeviceId,
    state: Mutex<SyncState>,
}

impl SyncCoordinator {
    /// Load the stored sync state, seeding records from config on first run
    pub fn load(store: Arc<dyn Store>, config: &RewardsConfig) -> Result<Self> {
        let state = match store.load_sync_state().context("Failed to load sync state")? {
            Some(state) => {
                debug!(
                    "Loaded sync state with {} classification rules",
                    state.records.classifications.len()
                );
                state
            }
            None => {
                info!("No sync state found, seeding records from config");
                SyncState {
                    records: RecordSet::from_config(config),
                    ..SyncState::default()
                }
            }
        };

        Ok(Self {
            store,
            device_id: config.device.id.clone(),
            state: Mutex::new(state),
        })
    }

    pub fn records(&self) -> RecordSet {
        self.state.lock().records.clone()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_sync
    }

    /// Classify an app on this device
    pub fn set_classification(
        &self,
        app_id: &AppId,
        category: AppCategory,
        display_name: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<AppClassificationRule> {
        self.update(|state| {
            let key = app_id.to_string();
            let previous = state.records.classifications.get(&key);
            let mut device_ids = previous.map(|r| r.device_ids.clone()).unwrap_or_default();
            device_ids = union_sorted(&device_ids, std::slice::from_ref(&self.device_id));
            let rule = AppClassificationRule {
                app_id: app_id.clone(),
                category,
                display_name: display_name.or_else(|| previous.and_then(|r| r.display_name.clone())),
                device_ids,
                modified_at: at,
                origin_device: self.device_id.clone(),
            };
            state.records.classifications.insert(key, rule.clone());
            rule
        })
    }

    /// Set the accrual and redemption policy for an app, or the global default
    pub fn set_policy(
        &self,
        scope: Option<&AppId>,
        accrual: AccrualConfig,
        redemption: RedemptionConfig,
        at: DateTime<Utc>,
    ) -> Result<RewardPolicyRecord> {
        self.update(|state| {
            let record = RewardPolicyRecord {
                scope: scope.cloned(),
                accrual,
                redemption,
                modified_at: at,
                origin_device: self.device_id.clone(),
            };
            state.records.policies.insert(record.record_key(), record.clone());
            record
        })
    }

    /// Run one full sync pass.
    ///
    /// Merges already applied to the components stay applied if a later
    /// kind fails; the stored tokens only move once the whole pass succeeds,
    /// so the next pass fetches the same changes again and merges them as
    /// duplicates.
    pub fn run_cycle(
        &self,
        transport: &dyn CloudTransport,
        targets: SyncTargets<'_>,
        now: DateTime<Utc>,
    ) -> Result<SyncReport> {
        let mut state = self.state.lock().clone();
        let mut report = SyncReport::default();

        report.ledger_entries_merged = self.sync_append_only(
            transport,
            RecordKind::LedgerEntry,
            &mut state,
            &mut report,
            |remote: &[LedgerEntry]| Ok(targets.ledger.merge_remote(remote)?),
            || {
                targets
                    .ledger
                    .children()
                    .iter()
                    .flat_map(|child| targets.ledger.entries(child, None))
                    .collect()
            },
        )?;

        report.audit_entries_merged = self.sync_append_only(
            transport,
            RecordKind::AuditEntry,
            &mut state,
            &mut report,
            |remote: &[AuditEntry]| Ok(targets.audit.merge_remote(remote)?),
            || targets.audit.snapshot(),
        )?;

        report.sessions_merged = self.sync_append_only(
            transport,
            RecordKind::UsageSession,
            &mut state,
            &mut report,
            |remote| Ok(targets.accrual.merge_remote_sessions(remote)),
            || targets.accrual.all_closed_sessions(),
        )?;

        self.sync_mutable(
            transport,
            RecordKind::AppClassification,
            &mut state,
            &mut report,
            |records| &mut records.classifications,
        )?;

        self.sync_mutable(
            transport,
            RecordKind::RewardPolicy,
            &mut state,
            &mut report,
            |records| &mut records.policies,
        )?;

        state.last_sync = Some(now);
        self.store
            .save_sync_state(&state)
            .context("Failed to save sync state")?;
        *self.state.lock() = state;

        info!(
            "Sync complete: fetched {}, pushed {}, {} remote wins",
            report.fetched, report.pushed, report.remote_wins
        );
        Ok(report)
    }

    fn update<T>(&self, change: impl FnOnce(&mut SyncState) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let result = change(&mut next);
        self.store
            .save_sync_state(&next)
            .context("Failed to save sync state")?;
        *state = next;
        Ok(result)
    }

    fn sync_append_only<T>(
        &self,
        transport: &dyn CloudTransport,
        kind: RecordKind,
        state: &mut SyncState,
        report: &mut SyncReport,
        merge: impl FnOnce(&[T]) -> Result<usize>,
        local: impl FnOnce() -> Vec<T>,
    ) -> Result<usize>
    where
        T: AppendOnly + Serialize + DeserializeOwned,
        T::Id: Display,
    {
        let batch = transport
            .fetch_changes(kind, state.tokens.get(&kind).copied())
            .with_context(|| format!("Failed to fetch {:?} changes", kind))?;
        let remote: Vec<T> = decode(kind, batch.records, report);

        let published = state.published.entry(kind).or_default();
        for record in &remote {
            published.insert(record.unique_id().to_string(), String::new());
        }
        let merged = merge(&remote).with_context(|| format!("Failed to merge {:?} records", kind))?;

        for record in local() {
            let key = record.unique_id().to_string();
            if published.contains_key(&key) {
                continue;
            }
            let value = serde_json::to_value(&record)
                .with_context(|| format!("Failed to encode {:?} {}", kind, key))?;
            transport
                .upsert(kind, &key, value)
                .with_context(|| format!("Failed to upload {:?} {}", kind, key))?;
            published.insert(key, String::new());
            report.pushed += 1;
        }

        state.tokens.insert(kind, batch.token);
        debug!("{:?}: merged {} remote records", kind, merged);
        Ok(merged)
    }

    fn sync_mutable<T>(
        &self,
        transport: &dyn CloudTransport,
        kind: RecordKind,
        state: &mut SyncState,
        report: &mut SyncReport,
        select: impl Fn(&mut RecordSet) -> &mut BTreeMap<String, T>,
    ) -> Result<()>
    where
        T: SyncableRecord + Serialize + DeserializeOwned,
    {
        let batch = transport
            .fetch_changes(kind, state.tokens.get(&kind).copied())
            .with_context(|| format!("Failed to fetch {:?} changes", kind))?;
        let remote: Vec<T> = decode(kind, batch.records, report);

        let published = state.published.entry(kind).or_default();
        let records = select(&mut state.records);
        for record in remote {
            published.insert(record.record_key(), version_of(&record));
            if merge_into(records, record) == Side::Remote {
                report.remote_wins += 1;
            }
        }

        for (key, record) in records.iter() {
            let version = version_of(record);
            if published.get(key) == Some(&version) {
                continue;
            }
            let value = serde_json::to_value(record)
                .with_context(|| format!("Failed to encode {:?} {}", kind, key))?;
            transport
                .upsert(kind, key, value)
                .with_context(|| format!("Failed to upload {:?} {}", kind, key))?;
            published.insert(key.clone(), version);
            report.pushed += 1;
        }

        state.tokens.insert(kind, batch.token);
        Ok(())
    }
}

fn version_of<T: SyncableRecord>(record: &T) -> String {
    format!("{}|{}", record.modified_at().to_rfc3339(), record.origin_device())
}

fn decode<T: DeserializeOwned>(
    kind: RecordKind,
    values: Vec<serde_json::Value>,
    report: &mut SyncReport,
) -> Vec<T> {
    report.fetched += values.len();
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping undecodable {:?} record: {}", kind, e);
                report.skipped += 1;
                None
            }
        })
        .collect()
}
