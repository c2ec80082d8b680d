use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Final state of a debounced reaction toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionIntent {
    pub message_id: i64,
    pub emoji: String,
    pub add: bool,
    pub was_reacted: bool,
}

#[derive(Debug)]
struct PendingToggle {
    was_reacted: bool,
    desired: bool,
    deadline: Instant,
}

/// Collapses rapid toggles of one (message, emoji) pair into one mutation.
#[derive(Debug)]
pub struct ReactionDebouncer {
    window: Duration,
    pending: HashMap<(i64, String), PendingToggle>,
}

impl ReactionDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: HashMap::new() }
    }

    /// Registers a toggle and returns the state the user now expects.
    pub fn toggle(&mut self, message_id: i64, emoji: &str, currently_reacted: bool, now: Instant) -> bool {
        let deadline = now + self.window;
        let entry = self
            .pending
            .entry((message_id, emoji.to_string()))
            .or_insert(PendingToggle { was_reacted: currently_reacted, desired: currently_reacted, deadline });
        entry.desired = !entry.desired;
        entry.deadline = deadline;
        entry.desired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Drains every toggle whose window has closed.
    pub fn due(&mut self, now: Instant) -> Vec<ReactionIntent> {
        let ready: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut intents: Vec<_> = ready
            .into_iter()
            .filter_map(|key| {
                self.pending.remove(&key).map(|p| ReactionIntent {
                    message_id: key.0,
                    emoji: key.1,
                    add: p.desired,
                    was_reacted: p.was_reacted,
                })
            })
            .collect();
        intents.sort_by(|a, b| (a.message_id, &a.emoji).cmp(&(b.message_id, &b.emoji)));
        intents
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
