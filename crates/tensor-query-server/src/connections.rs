//! Table of accepted connections.

use std::collections::HashMap;
use std::sync::Mutex;
use tensor_query_common::{CloseHandle, ConnectionId};

/// Every connection a server has handed out, keyed by id.
///
/// The table holds only close handles; the connections themselves are owned
/// by whoever accepted them. Entries whose connection is already closed are
/// pruned on every insert.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: Mutex<HashMap<ConnectionId, CloseHandle>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ConnectionId, handle: CloseHandle) {
        let mut entries = self.lock();
        entries.retain(|_, handle| !handle.is_closed());
        entries.insert(id, handle);
    }

    /// Closes one connection. Returns false if the id is unknown.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.lock().remove(&id) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Closes every connection and empties the table.
    pub fn close_all(&self) -> usize {
        let drained: Vec<CloseHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &drained {
            handle.close();
        }
        drained.len()
    }

    /// Connections not yet closed.
    pub fn open_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, CloseHandle>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
