//! Append-only points ledger.
//!
//! The entries for a child are the only source of truth for balances:
//! every balance is recomputed by summation and no entry is ever changed
//! or removed. Corrections are new `Adjustment` entries.
//!
//! ```text
//!   accrual (+)  ──┐
//!   redemption (-) ├──► entries[child] ──► sum ──► balance(child, app?)
//!   adjustment (±) ┘
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{LedgerError, PersistenceError};
use crate::ids::{AppId, ChildId, EntryId};
use crate::rewards::audit::{AuditAction, AuditLog, metadata};
use crate::store::Store;
use crate::sync::{AppendOnly, merge_append_only};

const EVENT_CAPACITY: usize = 256;

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Accrual,
    Redemption,
    Adjustment,
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub child_id: ChildId,
    /// `None` is the global pool
    pub app_id: Option<AppId>,
    pub kind: EntryKind,
    /// Signed points; redemptions are negative
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AppendOnly for LedgerEntry {
    type Id = EntryId;

    fn unique_id(&self) -> EntryId {
        self.id
    }
}

/// Notification sent after every successful append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Appended(LedgerEntry),
}

/// Points ledger for every child on this device
pub struct Ledger {
    store: Arc<dyn Store>,
    audit: Arc<AuditLog>,
    entries: RwLock<HashMap<ChildId, Vec<LedgerEntry>>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl Ledger {
    /// Create an empty ledger
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLog>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            audit,
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create a ledger holding the entries already in the store
    pub fn load(store: Arc<dyn Store>, audit: Arc<AuditLog>) -> anyhow::Result<Self> {
        let ledger = Self::new(store, audit);
        {
            let mut entries = ledger.entries.write();
            for (child_id, child_entries) in ledger.store.load_ledgers()? {
                debug!("Loaded {} ledger entries for {}", child_entries.len(), child_id);
                entries.insert(child_id, child_entries);
            }
        }
        Ok(ledger)
    }

    /// Subscribe to append notifications
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Credit points earned from learning activity (not audited)
    pub fn record_accrual(
        &self,
        child_id: &ChildId,
        app_id: Option<&AppId>,
        points: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if points <= 0 {
            return Err(LedgerError::InvalidAmount(points));
        }
        let entry = Self::make_entry(child_id, app_id, EntryKind::Accrual, points, at, None);
        self.append(entry, None)
    }

    /// Debit points spent on earned time; stored as a negative amount
    pub fn record_redemption(
        &self,
        child_id: &ChildId,
        app_id: Option<&AppId>,
        points: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if points <= 0 {
            return Err(LedgerError::InvalidAmount(points));
        }
        let entry = Self::make_entry(child_id, app_id, EntryKind::Redemption, -points, at, None);
        self.append(entry, Some(AuditAction::Redemption))
    }

    /// Record a signed manual correction
    pub fn record_adjustment(
        &self,
        child_id: &ChildId,
        app_id: Option<&AppId>,
        points: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if points == 0 {
            return Err(LedgerError::InvalidAmount(points));
        }
        let entry = Self::make_entry(
            child_id,
            app_id,
            EntryKind::Adjustment,
            points,
            at,
            Some(reason.to_string()),
        );
        self.append(entry, Some(AuditAction::Adjustment))
    }

    /// Balance of one scope: an app's balance, or the global pool for `None`
    pub fn balance(&self, child_id: &ChildId, app_id: Option<&AppId>) -> i64 {
        self.entries
            .read()
            .get(child_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.app_id.as_ref() == app_id)
                    .map(|e| e.amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Sum of every entry for the child, across all scopes
    pub fn total_balance(&self, child_id: &ChildId) -> i64 {
        self.entries
            .read()
            .get(child_id)
            .map(|entries| entries.iter().map(|e| e.amount).sum())
            .unwrap_or(0)
    }

    /// Balance per scope; the `None` key is the global pool
    pub fn balances(&self, child_id: &ChildId) -> BTreeMap<Option<AppId>, i64> {
        let mut balances = BTreeMap::new();
        if let Some(entries) = self.entries.read().get(child_id) {
            for entry in entries {
                *balances.entry(entry.app_id.clone()).or_insert(0) += entry.amount;
            }
        }
        balances
    }

    /// Entries ordered by timestamp, most recent first
    pub fn entries(&self, child_id: &ChildId, limit: Option<usize>) -> Vec<LedgerEntry> {
        let mut entries = self.sorted_entries(child_id);
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    /// Entries with `from <= timestamp < to`, most recent first
    pub fn entries_in_range(
        &self,
        child_id: &ChildId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<LedgerEntry> {
        self.sorted_entries(child_id)
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp < to)
            .collect()
    }

    /// Points accrued for one scope with `from <= timestamp < to`
    pub fn accrued_between(
        &self,
        child_id: &ChildId,
        app_id: Option<&AppId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> i64 {
        self.entries
            .read()
            .get(child_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.kind == EntryKind::Accrual && e.app_id.as_ref() == app_id)
                    .filter(|e| e.timestamp >= from && e.timestamp < to)
                    .map(|e| e.amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Children with at least one entry
    pub fn children(&self) -> Vec<ChildId> {
        let mut children: Vec<ChildId> = self.entries.read().keys().cloned().collect();
        children.sort();
        children
    }

    /// Union entries fetched from another device; returns how many were new
    pub fn merge_remote(&self, remote: &[LedgerEntry]) -> Result<usize, LedgerError> {
        let mut by_child: BTreeMap<&ChildId, Vec<LedgerEntry>> = BTreeMap::new();
        for entry in remote {
            by_child.entry(&entry.child_id).or_default().push(entry.clone());
        }

        let mut added = Vec::new();
        {
            let mut entries = self.entries.write();
            for (child_id, remote_entries) in by_child {
                let local = entries.get(child_id).cloned().unwrap_or_default();
                let merged = merge_append_only(&local, &remote_entries);
                if merged.len() == local.len() {
                    continue;
                }

                if let Err(e) = self.store.save_ledger(child_id, &merged) {
                    error!("Failed to persist merged ledger for {}: {:#}", child_id, e);
                    return Err(PersistenceError::new(format!("ledger for {}", child_id), &e).into());
                }

                added.extend(merged[local.len()..].iter().cloned());
                entries.insert(child_id.clone(), merged);
            }
        }

        if !added.is_empty() {
            info!("Merged {} remote ledger entries", added.len());
        }
        let count = added.len();
        for entry in added {
            let _ = self.events.send(LedgerEvent::Appended(entry));
        }
        Ok(count)
    }

    fn make_entry(
        child_id: &ChildId,
        app_id: Option<&AppId>,
        kind: EntryKind,
        amount: i64,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::new(),
            child_id: child_id.clone(),
            app_id: app_id.cloned(),
            kind,
            amount,
            timestamp: at,
            reason,
        }
    }

    fn sorted_entries(&self, child_id: &ChildId) -> Vec<LedgerEntry> {
        let mut entries = self
            .entries
            .read()
            .get(child_id)
            .cloned()
            .unwrap_or_default();
        // Reverse first so that equal timestamps keep newest-appended first
        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    /// Append and persist, then audit when required.
    ///
    /// A failed audit write takes the entry back out, so an audited kind is
    /// never in the ledger without its audit entry and vice versa.
    fn append(
        &self,
        entry: LedgerEntry,
        audit_action: Option<AuditAction>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut entries = self.entries.write();
        let child_entries = entries.entry(entry.child_id.clone()).or_default();
        child_entries.push(entry.clone());

        if let Err(e) = self.store.save_ledger(&entry.child_id, child_entries.as_slice()) {
            child_entries.pop();
            error!(
                "Failed to persist {:?} entry for {}: {:#}",
                entry.kind, entry.child_id, e
            );

            if audit_action.is_some() {
                let details = metadata([
                    ("entry_id", entry.id.to_string()),
                    ("amount", entry.amount.to_string()),
                ]);
                if let Err(audit_err) = self.audit.record(
                    Some(&entry.child_id),
                    AuditAction::LedgerWriteFailed,
                    details,
                    entry.timestamp,
                ) {
                    error!("Failed to audit ledger write failure: {}", audit_err);
                }
            }

            return Err(PersistenceError::new(format!("ledger for {}", entry.child_id), &e).into());
        }

        if let Some(action) = audit_action {
            let mut details = metadata([
                ("entry_id", entry.id.to_string()),
                ("amount", entry.amount.to_string()),
            ]);
            if let Some(app_id) = &entry.app_id {
                details.insert("app_id".to_string(), app_id.to_string());
            }
            if let Some(reason) = &entry.reason {
                details.insert("reason".to_string(), reason.clone());
            }
            if let Err(audit_err) =
                self.audit
                    .record(Some(&entry.child_id), action, details, entry.timestamp)
            {
                child_entries.pop();
                if let Err(e) = self.store.save_ledger(&entry.child_id, child_entries.as_slice()) {
                    error!(
                        "Failed to take back unaudited entry {} for {}: {:#}",
                        entry.id, entry.child_id, e
                    );
                }
                return Err(audit_err.into());
            }
        }
        drop(entries);

        debug!(
            "Recorded {:?} of {} for {} ({:?})",
            entry.kind, entry.amount, entry.child_id, entry.app_id
        );
        let _ = self.events.send(LedgerEvent::Appended(entry.clone()));
        Ok(entry)
    }
}
