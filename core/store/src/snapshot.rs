//! Canonical full-store snapshot used by the backup subsystem.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fieldsync_common::{PendingOperation, Record, Session};

/// A point-in-time copy of everything the store holds (backup artifacts
/// excluded): all record collections, the pending-operation queue and the
/// session.
///
/// The layout is canonical: collections are keyed by name in a sorted map
/// and records within a collection are sorted by their id key, so the same
/// store contents always serialize to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Records per collection name, sorted by record key.
    pub collections: BTreeMap<String, Vec<Record>>,
    /// The pending-operation queue in enqueue order.
    pub pending_operations: Vec<PendingOperation>,
    /// The session, if one was held when the snapshot was taken.
    pub session: Option<Session>,
}

impl StoreSnapshot {
    /// Names of the data types included in this snapshot, for backup
    /// metadata.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.push("pending_operations".to_string());
        names.push("session".to_string());
        names
    }

    /// Total number of records across all collections.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}
