use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::identity::CorrelationKey;

/// How many recently materialized messages the working set remembers. Lock
/// and intent entries whose key falls out of this window are reclaimed by
/// `sweep`.
const WORKING_SET_CAPACITY: usize = 512;

#[derive(Default)]
struct LockState {
    /// Correlation keys with a pipeline run currently executing.
    in_flight: HashSet<CorrelationKey>,
    /// Storage keys whose generation should trigger automatic publication.
    auto_publish: HashSet<String>,
    /// Recently materialized messages, bounded FIFO.
    working: VecDeque<(String, CorrelationKey)>,
    working_index: HashSet<String>,
}

/// In-process guard against duplicate concurrent processing of the same
/// logical message. Keyed by correlation key only, so the same message
/// arriving on two monitored accounts contends on one entry.
///
/// All mutation goes through `try_acquire` / `release` / the intent methods /
/// `sweep`; the sets are never exposed.
pub struct ProcessingLocks {
    state: Mutex<LockState>,
}

impl ProcessingLocks {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
        }
    }

    /// Mark a correlation key as in flight. Returns false when a pipeline
    /// run for this key is already executing; the caller must skip.
    pub fn try_acquire(&self, key: &CorrelationKey) -> bool {
        let mut state = self.state.lock().unwrap();
        state.in_flight.insert(key.clone())
    }

    /// Clear the in-flight mark. Must be called on every exit path; a key
    /// that is never released stays blocked until process restart.
    pub fn release(&self, key: &CorrelationKey) {
        let mut state = self.state.lock().unwrap();
        if !state.in_flight.remove(key) {
            log::debug!("release for {} with no in-flight entry", key);
        }
    }

    pub fn is_in_flight(&self, key: &CorrelationKey) -> bool {
        self.state.lock().unwrap().in_flight.contains(key)
    }

    /// Record that a successful generation for this storage key should be
    /// followed by automatic publication.
    pub fn queue_auto_publish(&self, storage_key: &str) {
        let mut state = self.state.lock().unwrap();
        state.auto_publish.insert(storage_key.to_string());
    }

    /// Consume the auto-publish intent for a storage key, if present.
    pub fn take_auto_publish(&self, storage_key: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        state.auto_publish.remove(storage_key)
    }

    /// Note a message as recently materialized. The working set is bounded;
    /// the oldest entry is evicted once the capacity is reached.
    pub fn note_materialized(&self, storage_key: &str, correlation: &CorrelationKey) {
        let mut state = self.state.lock().unwrap();
        if state.working_index.contains(storage_key) {
            return;
        }
        while state.working.len() >= WORKING_SET_CAPACITY {
            if let Some((old_key, _)) = state.working.pop_front() {
                state.working_index.remove(&old_key);
            }
        }
        state.working.push_back((storage_key.to_string(), correlation.clone()));
        state.working_index.insert(storage_key.to_string());
    }

    /// Drop lock and intent entries whose key is no longer in the working
    /// set. Keeps a long-running process from accumulating orphans left by
    /// runs that never completed.
    pub fn sweep(&self) {
        let mut state = self.state.lock().unwrap();
        let live_correlations: HashSet<&CorrelationKey> =
            state.working.iter().map(|(_, c)| c).collect();
        let orphaned_locks: Vec<CorrelationKey> = state
            .in_flight
            .iter()
            .filter(|k| !live_correlations.contains(*k))
            .cloned()
            .collect();
        let orphaned_intents: Vec<String> = state
            .auto_publish
            .iter()
            .filter(|k| !state.working_index.contains(*k))
            .cloned()
            .collect();
        drop(live_correlations);

        for key in &orphaned_locks {
            state.in_flight.remove(key);
        }
        for key in &orphaned_intents {
            state.auto_publish.remove(key);
        }
        if !orphaned_locks.is_empty() || !orphaned_intents.is_empty() {
            log::info!(
                "lock sweep removed {} orphaned locks, {} orphaned auto-publish intents",
                orphaned_locks.len(),
                orphaned_intents.len()
            );
        }
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }
}

impl Default for ProcessingLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CorrelationKey {
        CorrelationKey::MessageId(id.to_string())
    }

    #[test]
    fn test_acquire_twice_then_release() {
        let locks = ProcessingLocks::new();
        let k = key("m1@x");
        assert!(locks.try_acquire(&k));
        assert!(!locks.try_acquire(&k));
        locks.release(&k);
        assert!(locks.try_acquire(&k));
    }

    #[test]
    fn test_different_keys_do_not_contend() {
        let locks = ProcessingLocks::new();
        assert!(locks.try_acquire(&key("a@x")));
        assert!(locks.try_acquire(&key("b@x")));
    }

    #[test]
    fn test_auto_publish_intent_is_consumed_once() {
        let locks = ProcessingLocks::new();
        locks.queue_auto_publish("acct:m1@x");
        assert!(locks.take_auto_publish("acct:m1@x"));
        assert!(!locks.take_auto_publish("acct:m1@x"));
        assert!(!locks.take_auto_publish("acct:never-queued"));
    }

    #[test]
    fn test_sweep_removes_orphans_and_keeps_live_entries() {
        let locks = ProcessingLocks::new();
        let live = key("live@x");
        let orphan = key("orphan@x");

        locks.note_materialized("acct:live@x", &live);
        locks.queue_auto_publish("acct:live@x");
        locks.queue_auto_publish("acct:gone@x");
        assert!(locks.try_acquire(&live));
        assert!(locks.try_acquire(&orphan));

        locks.sweep();

        assert!(locks.is_in_flight(&live));
        assert!(!locks.is_in_flight(&orphan));
        assert!(locks.take_auto_publish("acct:live@x"));
        assert!(!locks.take_auto_publish("acct:gone@x"));
    }

    #[test]
    fn test_working_set_is_bounded() {
        let locks = ProcessingLocks::new();
        for i in 0..(WORKING_SET_CAPACITY + 100) {
            let k = key(&format!("m{}@x", i));
            locks.note_materialized(&format!("acct:m{}@x", i), &k);
        }
        // The oldest entries were evicted, so a lock for one of them is an
        // orphan after a sweep.
        let evicted = key("m0@x");
        assert!(locks.try_acquire(&evicted));
        locks.sweep();
        assert!(!locks.is_in_flight(&evicted));
        assert_eq!(locks.in_flight_count(), 0);
    }
}
