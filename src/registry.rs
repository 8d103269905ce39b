//! Live sessions per connection id.
//!
//! One mutex guards the whole table, so registration, lookup and removal are
//! linearizable and readers only ever see complete lists.

use crate::terminal::Terminal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Something the registry can hold and tell apart.
pub trait SessionHandle: Clone + Send + Sync {
    fn handle_id(&self) -> &str;
}

impl SessionHandle for Arc<Terminal> {
    fn handle_id(&self) -> &str {
        &self.id
    }
}

struct Entry<H> {
    seq: u64,
    handle: H,
}

struct Table<H> {
    next_seq: u64,
    sessions: HashMap<String, Vec<Entry<H>>>,
}

pub struct SessionRegistry<H: SessionHandle = Arc<Terminal>> {
    table: Mutex<Table<H>>,
}

impl<H: SessionHandle> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                next_seq: 0,
                sessions: HashMap::new(),
            }),
        }
    }
}

impl<H: SessionHandle> SessionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: &str, handle: H) {
        let mut table = self.lock();
        let seq = table.next_seq;
        table.next_seq += 1;
        let entries = table.sessions.entry(connection_id.to_string()).or_default();
        entries.push(Entry { seq, handle });
        tracing::debug!(connection_id, sessions = entries.len(), "Session registered");
    }

    pub fn all_for(&self, connection_id: &str) -> Vec<H> {
        self.lock()
            .sessions
            .get(connection_id)
            .map(|entries| entries.iter().map(|entry| entry.handle.clone()).collect())
            .unwrap_or_default()
    }

    pub fn first_for(&self, connection_id: &str) -> Option<H> {
        self.lock()
            .sessions
            .get(connection_id)
            .and_then(|entries| entries.first())
            .map(|entry| entry.handle.clone())
    }

    pub fn count_for(&self, connection_id: &str) -> usize {
        self.lock()
            .sessions
            .get(connection_id)
            .map_or(0, Vec::len)
    }

    /// Most recently registered session across all connections.
    pub fn most_recent(&self) -> Option<(String, H)> {
        self.lock()
            .sessions
            .iter()
            .flat_map(|(id, entries)| entries.iter().map(move |entry| (id, entry)))
            .max_by_key(|(_, entry)| entry.seq)
            .map(|(id, entry)| (id.clone(), entry.handle.clone()))
    }

    /// Removes one handle; the id disappears with its last session.
    pub fn remove_one(&self, connection_id: &str, handle: &H) -> bool {
        let mut table = self.lock();
        let Some(entries) = table.sessions.get_mut(connection_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.handle.handle_id() != handle.handle_id());
        let removed = entries.len() != before;
        let remaining = entries.len();
        if remaining == 0 {
            table.sessions.remove(connection_id);
        }
        if removed {
            tracing::debug!(connection_id, remaining, "Session removed");
        }
        removed
    }

    /// Removes every session of `connection_id` and hands them back, in
    /// registration order, under a single lock.
    pub fn take_all(&self, connection_id: &str) -> Vec<H> {
        let taken: Vec<H> = self
            .lock()
            .sessions
            .remove(connection_id)
            .map(|entries| entries.into_iter().map(|entry| entry.handle).collect())
            .unwrap_or_default();
        tracing::debug!(connection_id, removed = taken.len(), "Sessions removed");
        taken
    }

    pub fn remove_all(&self, connection_id: &str) -> usize {
        self.take_all(connection_id).len()
    }

    pub fn snapshot_all(&self) -> HashMap<String, Vec<H>> {
        self.lock()
            .sessions
            .iter()
            .map(|(id, entries)| {
                (
                    id.clone(),
                    entries.iter().map(|entry| entry.handle.clone()).collect(),
                )
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Table<H>> {
        self.table.lock().expect("session registry mutex poisoned")
    }
}
