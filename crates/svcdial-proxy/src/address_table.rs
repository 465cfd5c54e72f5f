//! Concurrent `host:port` to local address mapping
//!
//! Written by tunnel tasks when a forward becomes ready or stops, read by
//! `dial`. Each operation is atomic on its own; there are no cross-key
//! transactions.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

/// Shared address table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct AddressTable {
    entries: Arc<DashMap<String, String>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressTable {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entries: Arc::new(DashMap::new()),
            changes: Arc::new(changes),
        }
    }

    /// Look up the local address for `key`.
    pub fn resolve(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Map `key` to `address`, replacing any previous value.
    pub fn set(&self, key: &str, address: &str) {
        self.entries.insert(key.to_string(), address.to_string());
        self.bump();
    }

    /// Remove the entry for `key` regardless of its value.
    pub fn clear(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.bump();
        }
    }

    /// Remove the entry for `key` only if it still maps to `address`.
    ///
    /// Returns whether an entry was removed.
    pub fn clear_if(&self, key: &str, address: &str) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, current| current == address)
            .is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Point-in-time copy of every mapping, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receiver that is notified after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}
