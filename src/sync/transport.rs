//! Cloud transport seam.
//!
//! Storage, retries and authentication of the real cloud backend live
//! outside this crate. Records cross the seam as raw JSON snapshots keyed by
//! record kind and record key.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::sync::records::RecordKind;

/// Opaque position in a record kind's change feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ChangeToken(pub u64);

/// Changes since a token
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub records: Vec<serde_json::Value>,
    /// Token to pass to the next fetch
    pub token: ChangeToken,
}

pub trait CloudTransport: Send + Sync {
    /// Create or replace the record stored under `key`
    fn upsert(&self, kind: RecordKind, key: &str, record: serde_json::Value) -> Result<()>;

    /// Records of `kind` changed after `since`, or all of them when `since` is `None`
    fn fetch_changes(&self, kind: RecordKind, since: Option<ChangeToken>) -> Result<ChangeBatch>;
}

#[derive(Debug, Default)]
struct CloudData {
    sequence: u64,
    records: BTreeMap<(RecordKind, String), (u64, serde_json::Value)>,
}

/// In-process transport that several devices can share
///
/// Clones share the same backing data.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    data: Arc<Mutex<CloudData>>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of records stored for a kind
    pub fn record_count(&self, kind: RecordKind) -> usize {
        self.data
            .lock()
            .records
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("cloud transport is offline");
        }
        Ok(())
    }
}

impl CloudTransport for MemoryTransport {
    fn upsert(&self, kind: RecordKind, key: &str, record: serde_json::Value) -> Result<()> {
        self.check_online()?;
        let mut data = self.data.lock();
        data.sequence += 1;
        let sequence = data.sequence;
        data.records
            .insert((kind, key.to_string()), (sequence, record));
        debug!("Upserted {:?} record {} at {}", kind, key, sequence);
        Ok(())
    }

    fn fetch_changes(&self, kind: RecordKind, since: Option<ChangeToken>) -> Result<ChangeBatch> {
        self.check_online()?;
        let data = self.data.lock();
        let after = since.map(|t| t.0).unwrap_or(0);

        let mut changed: Vec<(u64, serde_json::Value)> = data
            .records
            .iter()
            .filter(|((k, _), (sequence, _))| *k == kind && *sequence > after)
            .map(|(_, (sequence, value))| (*sequence, value.clone()))
            .collect();
        changed.sort_by_key(|(sequence, _)| *sequence);

        Ok(ChangeBatch {
            records: changed.into_iter().map(|(_, value)| value).collect(),
            token: ChangeToken(data.sequence),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fetch_returns_only_newer_changes() {
        let transport = MemoryTransport::new();
        transport
            .upsert(RecordKind::LedgerEntry, "a", json!({"n": 1}))
            .unwrap();

        let first = transport
            .fetch_changes(RecordKind::LedgerEntry, None)
            .unwrap();
        assert_eq!(first.records, vec![json!({"n": 1})]);

        transport
            .upsert(RecordKind::LedgerEntry, "b", json!({"n": 2}))
            .unwrap();
        transport
            .upsert(RecordKind::AuditEntry, "c", json!({"n": 3}))
            .unwrap();

        let second = transport
            .fetch_changes(RecordKind::LedgerEntry, Some(first.token))
            .unwrap();
        assert_eq!(second.records, vec![json!({"n": 2})]);
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let transport = MemoryTransport::new();
        transport
            .upsert(RecordKind::AppClassification, "app:x", json!({"v": 1}))
            .unwrap();
        transport
            .upsert(RecordKind::AppClassification, "app:x", json!({"v": 2}))
            .unwrap();

        assert_eq!(transport.record_count(RecordKind::AppClassification), 1);
        let batch = transport
            .fetch_changes(RecordKind::AppClassification, None)
            .unwrap();
        assert_eq!(batch.records, vec![json!({"v": 2})]);
    }

    #[test]
    fn test_clones_share_data() {
        let device_a = MemoryTransport::new();
        let device_b = device_a.clone();

        device_a
            .upsert(RecordKind::RewardPolicy, "*", json!({}))
            .unwrap();

        assert_eq!(device_b.record_count(RecordKind::RewardPolicy), 1);
    }

    #[test]
    fn test_offline_calls_fail() {
        let transport = MemoryTransport::new();
        transport.set_offline(true);

        assert!(transport.fetch_changes(RecordKind::LedgerEntry, None).is_err());
        assert!(transport
            .upsert(RecordKind::LedgerEntry, "a", json!({}))
            .is_err());
    }
}
