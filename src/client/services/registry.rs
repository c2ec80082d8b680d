use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use log::debug;
use tokio::sync::broadcast;

use crate::common::models::{ThreadId, ThreadSummary};

/// Bounded set of recently seen event keys; on overflow the older half goes.
#[derive(Debug)]
pub struct SeenIds {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), keys: HashSet::new(), capacity: capacity.max(2) }
    }

    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());
        if self.order.len() > self.capacity {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.keys.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Session-wide state shared by every engine instance: dedup sets that
/// outlive thread switches and the per-thread summaries behind badges.
pub struct SessionRegistry {
    seen_capacity: usize,
    seen: Mutex<HashMap<ThreadId, SeenIds>>,
    summaries: Mutex<HashMap<ThreadId, ThreadSummary>>,
    summary_tx: broadcast::Sender<ThreadSummary>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionRegistry {
    pub fn new(seen_capacity: usize) -> Self {
        let (summary_tx, _) = broadcast::channel(64);
        Self {
            seen_capacity,
            seen: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
            summary_tx,
        }
    }

    /// Records an event key for a thread; `false` means it is a duplicate.
    pub fn mark_seen(&self, thread_id: ThreadId, key: &str) -> bool {
        let mut seen = lock(&self.seen);
        let fresh = seen
            .entry(thread_id)
            .or_insert_with(|| SeenIds::new(self.seen_capacity))
            .insert(key);
        if !fresh {
            debug!("[ROUTER] Duplicate event {} on thread {}", key, thread_id);
        }
        fresh
    }

    pub fn has_seen(&self, thread_id: ThreadId, key: &str) -> bool {
        lock(&self.seen).get(&thread_id).map_or(false, |s| s.contains(key))
    }

    pub fn summary(&self, thread_id: ThreadId) -> Option<ThreadSummary> {
        lock(&self.summaries).get(&thread_id).cloned()
    }

    pub fn summaries(&self) -> Vec<ThreadSummary> {
        let mut all: Vec<_> = lock(&self.summaries).values().cloned().collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Edits a summary in place and broadcasts it when something changed.
    pub fn update_summary<F>(&self, thread_id: ThreadId, f: F)
    where
        F: FnOnce(&mut ThreadSummary),
    {
        let updated = {
            let mut summaries = lock(&self.summaries);
            let entry = summaries
                .entry(thread_id)
                .or_insert_with(|| ThreadSummary { id: thread_id, ..Default::default() });
            let before = entry.clone();
            f(entry);
            (*entry != before).then(|| entry.clone())
        };
        if let Some(summary) = updated {
            let _ = self.summary_tx.send(summary);
        }
    }

    pub fn subscribe_summaries(&self) -> broadcast::Receiver<ThreadSummary> {
        self.summary_tx.subscribe()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(500)
    }
}
