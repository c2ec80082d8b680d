use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use tokio::time::Instant;

use crate::client::models::outbox::{Outbox, OutboxTask};
use crate::client::models::store::{MessageStore, StoreChange};
use crate::client::services::realtime::ChannelHealth;
use crate::client::services::registry::SessionRegistry;
use crate::common::models::*;
use crate::common::protocol::{thread_topic, RealtimeEnvelope, RealtimeEvent};

/// Follow-up the engine should run after an event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileHint {
    None,
    /// Schedule a throttled incremental fetch.
    Nudge,
    /// Fetch everything after the given tail right away.
    DeltaFetch { after_id: Option<i64> },
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    WrongTopic,
    Duplicate,
    Applied {
        change: Option<StoreChange>,
        hint: ReconcileHint,
        /// Outbox task finished by a self-echo.
        completed: Option<OutboxTask>,
        /// Typing indicators are active and need a clear timer.
        typing: bool,
    },
}

impl RouteOutcome {
    fn applied(change: Option<StoreChange>, hint: ReconcileHint) -> Self {
        RouteOutcome::Applied { change, hint, completed: None, typing: false }
    }
}

/// Routes realtime envelopes of one thread into its store and the outbox.
pub struct EventRouter {
    thread_id: ThreadId,
    topic: String,
    me: Participant,
    registry: Arc<SessionRegistry>,
}

impl EventRouter {
    pub fn new(thread_id: ThreadId, me: Participant, registry: Arc<SessionRegistry>) -> Self {
        Self { thread_id, topic: thread_topic(thread_id), me, registry }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn route(
        &self,
        envelope: RealtimeEnvelope,
        store: &mut MessageStore,
        outbox: &mut Outbox,
        now: DateTime<Utc>,
    ) -> RouteOutcome {
        if envelope.topic != self.topic {
            trace!("[ROUTER] Ignoring event for {}", envelope.topic);
            return RouteOutcome::WrongTopic;
        }
        let event = envelope.event;
        if let Some(key) = dedup_key(&event) {
            if !self.registry.mark_seen(self.thread_id, &key) {
                return RouteOutcome::Duplicate;
            }
        }
        debug!("[ROUTER] Routing {} on thread {}", event.kind(), self.thread_id);

        match event {
            RealtimeEvent::Message { message, client_request_id, .. } => {
                self.route_message(message, client_request_id, store, outbox)
            }
            RealtimeEvent::Read { up_to_id, reader_id } => {
                if reader_id == self.me.user_id {
                    self.registry.update_summary(self.thread_id, |s| s.unread_count = 0);
                    return RouteOutcome::applied(None, ReconcileHint::None);
                }
                let ids = store.apply_read(up_to_id, reader_id, now);
                RouteOutcome::applied(self.updated(ids), ReconcileHint::Nudge)
            }
            RealtimeEvent::Delivered { up_to_id, recipient_id } => {
                let ids = store.apply_delivered(up_to_id, recipient_id, now);
                RouteOutcome::applied(self.updated(ids), ReconcileHint::Nudge)
            }
            RealtimeEvent::Typing { users } => {
                let typing: std::collections::BTreeSet<UserId> =
                    users.into_iter().filter(|u| *u != self.me.user_id).collect();
                let active = !typing.is_empty();
                store.participants.typing = typing;
                self.registry.update_summary(self.thread_id, |s| s.typing = active);
                RouteOutcome::Applied {
                    change: Some(StoreChange::Participants { thread_id: self.thread_id }),
                    hint: ReconcileHint::None,
                    completed: None,
                    typing: active,
                }
            }
            RealtimeEvent::Presence { user_id, status } => {
                store.participants.presence.insert(user_id, status);
                if user_id != self.me.user_id {
                    self.registry.update_summary(self.thread_id, |s| s.presence = status);
                }
                RouteOutcome::applied(
                    Some(StoreChange::Participants { thread_id: self.thread_id }),
                    ReconcileHint::None,
                )
            }
            RealtimeEvent::ReactionAdded { message_id, emoji, user_id, .. } => {
                self.route_reaction(store, message_id, &emoji, user_id, true)
            }
            RealtimeEvent::ReactionRemoved { message_id, emoji, user_id, .. } => {
                self.route_reaction(store, message_id, &emoji, user_id, false)
            }
            RealtimeEvent::MessageDeleted { message_id, .. } => {
                let id = MessageId::Server(message_id);
                if store.update(id, |m| m.tombstone()) {
                    self.refresh_summary(store);
                    RouteOutcome::applied(self.updated(vec![id]), ReconcileHint::Nudge)
                } else {
                    RouteOutcome::applied(None, ReconcileHint::Nudge)
                }
            }
            RealtimeEvent::ThreadTail { last_id, last_timestamp, snippet } => {
                let tail = store.tail_server_id();
                self.registry.update_summary(self.thread_id, |s| {
                    if s.last_message_id.map_or(true, |known| last_id >= known) {
                        s.last_message_id = Some(last_id);
                        if let Some(ts) = last_timestamp.as_deref().and_then(parse_timestamp) {
                            s.last_message_timestamp = Some(ts);
                        }
                        if let Some(snippet) = snippet {
                            s.last_message_preview = snippet;
                        }
                    }
                });
                let hint = if tail.map_or(true, |tail| last_id > tail) {
                    ReconcileHint::DeltaFetch { after_id: tail }
                } else {
                    ReconcileHint::None
                };
                RouteOutcome::applied(None, hint)
            }
        }
    }

    fn route_message(
        &self,
        wire: WireMessage,
        envelope_request_id: Option<String>,
        store: &mut MessageStore,
        outbox: &mut Outbox,
    ) -> RouteOutcome {
        let mut message = wire.normalize(self.thread_id);
        if message.client_request_id.is_none() {
            message.client_request_id = envelope_request_id;
        }
        let sender = message.sender_id;
        let is_new = store.get(message.id).is_none();

        let mut completed = None;
        let report = match message.client_request_id.clone().and_then(|crid| outbox.confirm_echo(&crid)) {
            Some((local, finished)) => {
                debug!("[ROUTER] Echo confirmed {} as {}", local, message.id);
                completed = finished;
                store.confirm_local(local, message)
            }
            None => store.ingest_live(message),
        };

        if store.participants.typing.remove(&sender) && store.participants.typing.is_empty() {
            self.registry.update_summary(self.thread_id, |s| s.typing = false);
        }
        let counterpart = sender != self.me.user_id;
        let fresh = is_new && report.replaced.is_empty() && !report.inserted.is_empty();
        self.refresh_summary(store);
        if fresh && counterpart {
            self.registry.update_summary(self.thread_id, |s| s.unread_count += 1);
        }

        let change = (!report.is_empty()).then(|| StoreChange::Merged { thread_id: self.thread_id, report });
        RouteOutcome::Applied { change, hint: ReconcileHint::Nudge, completed, typing: false }
    }

    fn route_reaction(
        &self,
        store: &mut MessageStore,
        message_id: i64,
        emoji: &str,
        user_id: UserId,
        added: bool,
    ) -> RouteOutcome {
        let id = MessageId::Server(message_id);
        let by_me = user_id == self.me.user_id;
        let Some(message) = store.get(id) else {
            return RouteOutcome::applied(None, ReconcileHint::Nudge);
        };
        // Own reactions were applied optimistically already.
        if by_me && message.has_reacted(emoji) == added {
            return RouteOutcome::applied(None, ReconcileHint::None);
        }
        store.update(id, |m| {
            let summary = m.reactions.get_or_insert_with(ReactionSummary::default);
            if added {
                summary.add(emoji, by_me);
            } else {
                summary.remove(emoji, by_me);
            }
        });
        RouteOutcome::applied(self.updated(vec![id]), ReconcileHint::Nudge)
    }

    fn updated(&self, ids: Vec<MessageId>) -> Option<StoreChange> {
        (!ids.is_empty()).then(|| StoreChange::Updated { thread_id: self.thread_id, ids })
    }

    /// Copies the store tail into the thread summary.
    pub fn refresh_summary(&self, store: &MessageStore) {
        let Some(last) = store.iter().rev().find(|m| !m.id.is_local()).or_else(|| store.last()) else {
            return;
        };
        let (id, ts, preview) = (last.id.server(), last.timestamp, last.preview());
        self.registry.update_summary(self.thread_id, |s| {
            if id.is_some() && id >= s.last_message_id {
                s.last_message_id = id;
                s.last_message_timestamp = ts;
                s.last_message_preview = preview;
            }
        });
    }
}

fn dedup_key(event: &RealtimeEvent) -> Option<String> {
    match event {
        RealtimeEvent::Message { event_id, message, .. } => {
            Some(event_id.clone().unwrap_or_else(|| format!("message:{}", message.id)))
        }
        RealtimeEvent::MessageDeleted { event_id, message_id } => {
            Some(event_id.clone().unwrap_or_else(|| format!("deleted:{}", message_id)))
        }
        RealtimeEvent::ReactionAdded { event_id, .. } | RealtimeEvent::ReactionRemoved { event_id, .. } => {
            event_id.clone()
        }
        _ => None,
    }
}

/// Delays incremental reconciliation and caps how often it runs.
#[derive(Debug)]
pub struct ReconcileScheduler {
    delay: Duration,
    min_interval: Duration,
    pending_at: Option<Instant>,
    last_run: Option<Instant>,
}

impl ReconcileScheduler {
    pub fn new(delay: Duration, min_interval: Duration) -> Self {
        Self { delay, min_interval, pending_at: None, last_run: None }
    }

    pub fn nudge(&mut self, now: Instant) {
        if self.pending_at.is_some() {
            return;
        }
        let mut at = now + self.delay;
        if let Some(last) = self.last_run {
            at = at.max(last + self.min_interval);
        }
        self.pending_at = Some(at);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending_at
    }

    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.pending_at {
            Some(at) if at <= now => {
                self.pending_at = None;
                self.last_run = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Counts an out-of-band fetch as a run for throttling purposes.
    pub fn record_run(&mut self, now: Instant) {
        self.last_run = Some(now);
    }

    pub fn reset(&mut self) {
        self.pending_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Degraded,
    Recovered,
}

/// Polls while the realtime channel cannot be trusted.
#[derive(Debug)]
pub struct DegradedPoller {
    interval: Duration,
    degraded: bool,
    next_at: Option<Instant>,
}

impl DegradedPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval, degraded: false, next_at: None }
    }

    pub fn observe(&mut self, health: &ChannelHealth, now: Instant) -> HealthTransition {
        match (self.degraded, health.is_degraded()) {
            (false, true) => {
                self.degraded = true;
                self.next_at = Some(now + self.interval);
                HealthTransition::Degraded
            }
            (true, false) => {
                self.degraded = false;
                self.next_at = None;
                HealthTransition::Recovered
            }
            _ => HealthTransition::Unchanged,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_at
    }

    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.next_at {
            Some(at) if at <= now => {
                self.next_at = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}

/// Lets one typing broadcast through per interval.
#[derive(Debug)]
pub struct TypingThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_sent: None }
    }

    pub fn should_send(&mut self, now: Instant) -> bool {
        if self.last_sent.map_or(true, |last| now >= last + self.interval) {
            self.last_sent = Some(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}
