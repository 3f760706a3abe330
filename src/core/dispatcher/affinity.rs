// src/core/dispatcher/affinity.rs

//! The session affinity table of §3: `session_id -> worker_index`,
//! dispatcher-local (never stored in SCM, per §5's "Session-affinity
//! table: dispatcher-local (not in SCM)"). Present only when
//! `keep_connection != Off` for the owning broker.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct AffinityEntry {
    worker_index: usize,
    last_touch: Instant,
}

/// Tracks which worker a session is bound to, so that all subsequent
/// RPCs of that session are routed back to the same worker (§5:
/// "Session-affinity... until the session is explicitly ended or times
/// out").
#[derive(Default)]
pub struct SessionAffinityTable {
    entries: HashMap<u64, AffinityEntry>,
}

impl SessionAffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `session_id` to `worker_index`, called the first time a
    /// worker binds a session and on every subsequent dispatch (§3's
    /// lifecycle: "insert when a worker first binds a session, update on
    /// each dispatch").
    pub fn bind(&mut self, session_id: u64, worker_index: usize) {
        self.entries.insert(
            session_id,
            AffinityEntry {
                worker_index,
                last_touch: Instant::now(),
            },
        );
    }

    pub fn lookup(&self, session_id: u64) -> Option<usize> {
        self.entries.get(&session_id).map(|e| e.worker_index)
    }

    /// Refreshes the touch time without changing the binding, called on
    /// every dispatch to a session already bound.
    pub fn touch(&mut self, session_id: u64) {
        if let Some(entry) = self.entries.get_mut(&session_id) {
            entry.last_touch = Instant::now();
        }
    }

    /// Removes a session's binding, called when a worker signals
    /// end-of-session.
    pub fn remove(&mut self, session_id: u64) {
        self.entries.remove(&session_id);
    }

    /// Evicts every entry untouched for at least `session_timeout`,
    /// returning the evicted session ids so callers can reconcile
    /// anything else keyed on them.
    pub fn expire_idle(&mut self, session_timeout: Duration) -> Vec<u64> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_touch) >= session_timeout)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in &expired {
            self.entries.remove(sid);
        }
        expired
    }

    /// Removes every binding pointing at `worker_index`, called when
    /// that worker is reaped (crashed or killed) so stale affinity
    /// entries don't route future sessions into a dead worker, per
    /// §7's `SESSION_LOST` semantics.
    pub fn remove_worker(&mut self, worker_index: usize) {
        self.entries.retain(|_, e| e.worker_index != worker_index);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_lookup_round_trips() {
        let mut table = SessionAffinityTable::new();
        table.bind(7, 2);
        assert_eq!(table.lookup(7), Some(2));
    }

    #[test]
    fn remove_worker_clears_only_its_sessions() {
        let mut table = SessionAffinityTable::new();
        table.bind(1, 0);
        table.bind(2, 1);
        table.remove_worker(0);
        assert_eq!(table.lookup(1), None);
        assert_eq!(table.lookup(2), Some(1));
    }

    #[test]
    fn expire_idle_evicts_only_stale_entries() {
        let mut table = SessionAffinityTable::new();
        table.bind(1, 0);
        std::thread::sleep(Duration::from_millis(5));
        table.bind(2, 1);
        let expired = table.expire_idle(Duration::from_millis(2));
        // Both may or may not be expired depending on scheduling; assert
        // the invariant that whatever is reported expired is gone.
        for sid in &expired {
            assert_eq!(table.lookup(*sid), None);
        }
    }
}
