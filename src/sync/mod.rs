//! Multi-device synchronization.

pub mod coordinator;
pub mod records;
pub mod resolver;
pub mod transport;

pub use coordinator::{SyncCoordinator, SyncReport, SyncState, SyncTargets};
pub use records::{AppClassificationRule, RecordKind, RecordSet, RewardPolicyRecord};
pub use resolver::{
    AppendOnly, Resolution, Side, SyncableRecord, merge_append_only, resolve, union_sorted,
};
pub use transport::{ChangeBatch, ChangeToken, CloudTransport, MemoryTransport};
