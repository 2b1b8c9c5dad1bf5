//! Append-only audit log of administrative and redemption actions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::PersistenceError;
use crate::ids::{AuditId, ChildId, DeviceId};
use crate::store::Store;
use crate::sync::{AppendOnly, merge_append_only};

/// Audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Points spent on earned time
    Redemption,
    /// Manual point correction
    Adjustment,
    /// A redemption was compensated after window creation failed
    RedemptionRolledBack,
    /// An earned-time window was revoked early
    ExemptionCancelled,
    /// A ledger write failed after its audit entry was recorded
    LedgerWriteFailed,
    /// Configuration or classification changed
    ConfigChanged,
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub child_id: Option<ChildId>,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    pub actor_device_id: Option<DeviceId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AppendOnly for AuditEntry {
    type Id = AuditId;

    fn unique_id(&self) -> AuditId {
        self.id
    }
}

/// Append-only audit log
pub struct AuditLog {
    store: Arc<dyn Store>,
    device_id: DeviceId,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Create an empty audit log
    pub fn new(store: Arc<dyn Store>, device_id: DeviceId) -> Self {
        Self {
            store,
            device_id,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Create an audit log holding the entries already in the store
    pub fn load(store: Arc<dyn Store>, device_id: DeviceId) -> anyhow::Result<Self> {
        let entries = store.load_audit()?;
        debug!("Loaded {} audit entries", entries.len());
        Ok(Self {
            store,
            device_id,
            entries: Mutex::new(entries),
        })
    }

    /// Append an entry attributed to this device
    pub fn record(
        &self,
        child_id: Option<&ChildId>,
        action: AuditAction,
        metadata: BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<AuditEntry, PersistenceError> {
        let entry = AuditEntry {
            id: AuditId::new(),
            child_id: child_id.cloned(),
            action,
            timestamp: at,
            actor_device_id: Some(self.device_id.clone()),
            metadata,
        };

        let mut entries = self.entries.lock();
        entries.push(entry.clone());

        if let Err(e) = self.store.save_audit(&entries) {
            entries.pop();
            error!("Failed to persist audit entry {:?}: {:#}", action, e);
            return Err(PersistenceError::new("audit log", &e));
        }

        debug!("Audit: {:?} for {:?}", action, entry.child_id);
        Ok(entry)
    }

    /// Entries, most recent first
    pub fn entries(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        let mut entries = self.entries.lock().clone();
        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    /// Entries for one child, most recent first
    pub fn entries_for_child(&self, child_id: &ChildId, limit: Option<usize>) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = self
            .entries(None)
            .into_iter()
            .filter(|e| e.child_id.as_ref() == Some(child_id))
            .collect();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    /// Every entry in append order
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Union entries from another device; returns how many were new
    pub fn merge_remote(&self, remote: &[AuditEntry]) -> Result<usize, PersistenceError> {
        let mut entries = self.entries.lock();
        let merged = merge_append_only(&entries, remote);
        let added = merged.len() - entries.len();
        if added == 0 {
            return Ok(0);
        }

        if let Err(e) = self.store.save_audit(&merged) {
            error!("Failed to persist merged audit log: {:#}", e);
            return Err(PersistenceError::new("audit log", &e));
        }

        *entries = merged;
        debug!("Merged {} remote audit entries", added);
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build audit metadata from key/value pairs
pub fn metadata<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
