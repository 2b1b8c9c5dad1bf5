//! Durable storage for the ledger, active windows, audit log and sync state.
//!
//! Every document is rewritten whole with an atomic replace, so a process
//! killed mid-write leaves the previous version intact.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::ids::ChildId;
use crate::platform::common::{
    atomic_write, ensure_directory_exists, read_if_exists, try_lock_exclusive,
};
use crate::rewards::audit::AuditEntry;
use crate::rewards::ledger::LedgerEntry;
use crate::rewards::window::WindowRecord;
use crate::sync::SyncState;

/// Current document version
const STORE_VERSION: &str = "1.0";

/// Storage backend used by the rewards components
pub trait Store: Send + Sync {
    /// Load every child's ledger
    fn load_ledgers(&self) -> Result<Vec<(ChildId, Vec<LedgerEntry>)>>;

    /// Replace one child's ledger
    fn save_ledger(&self, child_id: &ChildId, entries: &[LedgerEntry]) -> Result<()>;

    fn load_windows(&self) -> Result<Vec<WindowRecord>>;

    /// Replace the set of active and queued windows
    fn save_windows(&self, windows: &[WindowRecord]) -> Result<()>;

    fn load_audit(&self) -> Result<Vec<AuditEntry>>;

    fn save_audit(&self, entries: &[AuditEntry]) -> Result<()>;

    fn load_sync_state(&self) -> Result<Option<SyncState>>;

    fn save_sync_state(&self, state: &SyncState) -> Result<()>;
}

#[derive(Debug, Deserialize, Serialize)]
struct Document<T> {
    version: String,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Deserialize, Serialize)]
struct LedgerBody {
    child_id: ChildId,
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct WindowsBody {
    windows: Vec<WindowRecord>,
}

#[derive(Debug, Deserialize, Serialize)]
struct AuditBody {
    entries: Vec<AuditEntry>,
}

/// JSON files under a data directory
///
/// ```text
/// <data_dir>/ledger/<sha256(child)>.json
/// <data_dir>/windows.json
/// <data_dir>/audit.json
/// <data_dir>/sync.json
/// <data_dir>/.lock
/// ```
///
/// Documents are rewritten whole, so the store holds an exclusive lock on
/// the directory for as long as any clone of it is alive.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
    _lock: Arc<File>,
}

impl JsonFileStore {
    /// Open the data directory, creating it if needed, and lock it
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_directory_exists(&root)?;

        let lock_path = root.join(".lock");
        let Some(lock) = try_lock_exclusive(&lock_path)? else {
            anyhow::bail!(
                "Data directory {} is in use by another screen-rewards process",
                root.display()
            );
        };

        Ok(Self {
            root,
            _lock: Arc::new(lock),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    /// Child ids are opaque strings, so file names are derived from a hash
    fn ledger_path(&self, child_id: &ChildId) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(child_id.as_str().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.ledger_dir().join(format!("{}.json", &digest[..32]))
    }

    fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let Some(content) = read_if_exists(path)? else {
            return Ok(None);
        };

        let document: Document<T> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        if document.version != STORE_VERSION {
            anyhow::bail!(
                "State file version mismatch in {} (expected {}, got {})",
                path.display(),
                STORE_VERSION,
                document.version
            );
        }

        Ok(Some(document.body))
    }

    fn write_document<T: Serialize>(path: &Path, body: T) -> Result<()> {
        let document = Document {
            version: STORE_VERSION.to_string(),
            body,
        };

        let content = serde_json::to_string_pretty(&document)
            .context("Failed to serialize state")?;

        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write state file: {}", path.display()))
    }
}

impl Store for JsonFileStore {
    fn load_ledgers(&self) -> Result<Vec<(ChildId, Vec<LedgerEntry>)>> {
        let dir = self.ledger_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ledgers = Vec::new();
        let listing = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list ledger directory: {}", dir.display()))?;

        for item in listing {
            let path = item
                .with_context(|| format!("Failed to list ledger directory: {}", dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(body) = Self::read_document::<LedgerBody>(&path)? {
                ledgers.push((body.child_id, body.entries));
            }
        }

        ledgers.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ledgers)
    }

    fn save_ledger(&self, child_id: &ChildId, entries: &[LedgerEntry]) -> Result<()> {
        Self::write_document(
            &self.ledger_path(child_id),
            LedgerBody {
                child_id: child_id.clone(),
                entries: entries.to_vec(),
            },
        )
    }

    fn load_windows(&self) -> Result<Vec<WindowRecord>> {
        Ok(Self::read_document::<WindowsBody>(&self.root.join("windows.json"))?
            .map(|body| body.windows)
            .unwrap_or_default())
    }

    fn save_windows(&self, windows: &[WindowRecord]) -> Result<()> {
        Self::write_document(
            &self.root.join("windows.json"),
            WindowsBody {
                windows: windows.to_vec(),
            },
        )
    }

    fn load_audit(&self) -> Result<Vec<AuditEntry>> {
        Ok(Self::read_document::<AuditBody>(&self.root.join("audit.json"))?
            .map(|body| body.entries)
            .unwrap_or_default())
    }

    fn save_audit(&self, entries: &[AuditEntry]) -> Result<()> {
        Self::write_document(
            &self.root.join("audit.json"),
            AuditBody {
                entries: entries.to_vec(),
            },
        )
    }

    fn load_sync_state(&self) -> Result<Option<SyncState>> {
        Self::read_document(&self.root.join("sync.json"))
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        Self::write_document(&self.root.join("sync.json"), state)
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    ledgers: BTreeMap<ChildId, Vec<LedgerEntry>>,
    windows: Vec<WindowRecord>,
    audit: Vec<AuditEntry>,
    sync: Option<SyncState>,
}

/// In-process store
///
/// Writes can be made to fail on demand, which is how persistence failure
/// paths are exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
    fail_writes: AtomicBool,
    fail_next: AtomicUsize,
    fail_target: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched off
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make every write to one document (`ledger`, `windows`, `audit` or
    /// `sync`) fail until cleared
    pub fn fail_writes_to(&self, target: Option<&str>) {
        *self.fail_target.lock() = target.map(str::to_string);
    }

    fn check_write(&self, target: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst)
            || self.fail_target.lock().as_deref() == Some(target)
        {
            anyhow::bail!("simulated write failure for {}", target);
        }
        let pending = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            anyhow::bail!("simulated write failure for {}", target);
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn load_ledgers(&self) -> Result<Vec<(ChildId, Vec<LedgerEntry>)>> {
        Ok(self
            .data
            .lock()
            .ledgers
            .iter()
            .map(|(child, entries)| (child.clone(), entries.clone()))
            .collect())
    }

    fn save_ledger(&self, child_id: &ChildId, entries: &[LedgerEntry]) -> Result<()> {
        self.check_write("ledger")?;
        self.data
            .lock()
            .ledgers
            .insert(child_id.clone(), entries.to_vec());
        Ok(())
    }

    fn load_windows(&self) -> Result<Vec<WindowRecord>> {
        Ok(self.data.lock().windows.clone())
    }

    fn save_windows(&self, windows: &[WindowRecord]) -> Result<()> {
        self.check_write("windows")?;
        self.data.lock().windows = windows.to_vec();
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.data.lock().audit.clone())
    }

    fn save_audit(&self, entries: &[AuditEntry]) -> Result<()> {
        self.check_write("audit")?;
        self.data.lock().audit = entries.to_vec();
        Ok(())
    }

    fn load_sync_state(&self) -> Result<Option<SyncState>> {
        Ok(self.data.lock().sync.clone())
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.check_write("sync")?;
        self.data.lock().sync = Some(state.clone());
        Ok(())
    }
}
