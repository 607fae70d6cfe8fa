//! Thread-safe call-id to `Inbound` mapping (spec §4.3).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::call::Inbound;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Concurrent `call-id -> Inbound` mapping.
///
/// `put_if_absent` exists so the inbound dispatcher (which looks a call up
/// without the transport lock) and the client's stream-creation path (which
/// allocates under the transport lock) can race to create an entry for the
/// same id without either double-creating an `Inbound`.
#[derive(Default)]
pub struct CallTable {
    calls: RwLock<HashMap<i32, Arc<dyn Inbound>>>,
}

impl CallTable {
    /// A fresh, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `id`.
    #[must_use]
    pub fn get(&self, id: i32) -> Option<Arc<dyn Inbound>> {
        self.calls.read().get(&id).cloned()
    }

    /// Insert `inbound` at `id` unless one is already present, returning the
    /// existing entry if so (and leaving it untouched).
    pub fn put_if_absent(
        &self,
        id: i32,
        inbound: Arc<dyn Inbound>,
    ) -> Option<Arc<dyn Inbound>> {
        let mut calls = self.calls.write();
        if let Some(existing) = calls.get(&id) {
            return Some(Arc::clone(existing));
        }
        calls.insert(id, inbound);
        None
    }

    /// Remove `id`. Returns whether an entry was actually removed.
    pub fn remove(&self, id: i32) -> bool {
        self.calls.write().remove(&id).is_some()
    }

    /// Atomically take every entry out of the table, leaving it empty.
    pub fn snapshot_and_clear(&self) -> Vec<(i32, Arc<dyn Inbound>)> {
        self.calls.write().drain().collect()
    }

    /// Whether the table currently holds no calls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }

    /// Invoke `on_transport_ready` on every call currently in the table.
    /// Used when the transmit window drains (spec §4.2's `on_peer_ack`).
    pub fn notify_all_ready(&self) {
        for inbound in self.calls.read().values() {
            inbound.on_transport_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::QueueInbound;

    #[test]
    fn put_if_absent_resolves_races() {
        let table = CallTable::new();
        let a = QueueInbound::new();
        let b = QueueInbound::new();
        assert!(table.put_if_absent(5, a.clone()).is_none());
        let existing = table.put_if_absent(5, b).expect("second insert sees first");
        assert!(Arc::ptr_eq(&existing, &(a as Arc<dyn Inbound>)));
    }

    #[test]
    fn snapshot_and_clear_drains_table() {
        let table = CallTable::new();
        table.put_if_absent(1, QueueInbound::new());
        table.put_if_absent(2, QueueInbound::new());
        assert!(!table.is_empty());
        let snapshot = table.snapshot_and_clear();
        assert_eq!(snapshot.len(), 2);
        assert!(table.is_empty());
    }
}
