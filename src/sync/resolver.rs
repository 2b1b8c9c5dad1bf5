//! Conflict resolution between local and remote copies of records.
//!
//! Mutable records are last-writer-wins on `modified_at`, with the origin
//! device id as tie-breaker so every device picks the same winner without
//! coordination. List-valued fields are unioned whichever side wins.
//! Append-only records never conflict: both sides are merged by id.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::hash::Hash;

use crate::ids::DeviceId;

/// A mutable record that can be edited on several devices
pub trait SyncableRecord: Clone {
    /// Logical identity shared by every copy of the record
    fn record_key(&self) -> String;

    fn modified_at(&self) -> DateTime<Utc>;

    fn origin_device(&self) -> &DeviceId;

    /// Fold list-valued fields of `other` into `self`
    fn union_list_fields(&mut self, _other: &Self) {}
}

/// A record type that is only ever appended
pub trait AppendOnly {
    type Id: Eq + Hash;

    fn unique_id(&self) -> Self::Id;
}

/// Which copy won a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Outcome of resolving two copies of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<T> {
    pub record: T,
    pub winner: Side,
}

/// Pick the winning copy of a record.
///
/// The later `modified_at` wins outright. On a tie the lexicographically
/// greater origin device wins, which makes `resolve(a, b)` and
/// `resolve(b, a)` produce the same record.
pub fn resolve<T: SyncableRecord>(local: &T, remote: &T) -> Resolution<T> {
    let local_key = (local.modified_at(), local.origin_device());
    let remote_key = (remote.modified_at(), remote.origin_device());

    let (winner, loser, side) = if remote_key > local_key {
        (remote, local, Side::Remote)
    } else {
        (local, remote, Side::Local)
    };

    let mut record = winner.clone();
    record.union_list_fields(loser);
    Resolution {
        record,
        winner: side,
    }
}

/// Union two append-only sequences by id.
///
/// Local entries keep their order and come first; remote entries that are
/// not already present follow in their original order.
pub fn merge_append_only<T: AppendOnly + Clone>(local: &[T], remote: &[T]) -> Vec<T> {
    let mut seen: HashSet<T::Id> = local.iter().map(|e| e.unique_id()).collect();
    let mut merged = local.to_vec();
    for entry in remote {
        if seen.insert(entry.unique_id()) {
            merged.push(entry.clone());
        }
    }
    merged
}

/// Sorted, de-duplicated union of two lists
pub fn union_sorted<T: Ord + Clone>(left: &[T], right: &[T]) -> Vec<T> {
    let mut merged: Vec<T> = left.iter().chain(right.iter()).cloned().collect();
    merged.sort();
    merged.dedup();
    merged
}
