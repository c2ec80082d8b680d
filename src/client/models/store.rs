use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use log::debug;

use crate::common::models::*;
use crate::common::protocol::FetchMode;

/// Position of a row in the ordered list: `(timestamp, id)` with the id rank
/// breaking ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    ts: i64,
    rank: (u8, i64),
}

#[derive(Debug, Clone)]
struct StoreEntry {
    message: Message,
    /// Lowest order timestamp a live arrival was pinned to.
    floor: Option<i64>,
    order: OrderKey,
}

impl StoreEntry {
    fn new(message: Message, floor: Option<i64>) -> Self {
        Self { message, floor, order: OrderKey::default() }
    }
}

/// What a merge did to the list; the engine turns this into change
/// notifications and cache writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub inserted: Vec<MessageId>,
    pub updated: usize,
    pub replaced: Vec<(LocalId, i64)>,
    /// First newly inserted row that landed after the previous tail.
    pub appended_from: Option<MessageId>,
    pub appended: usize,
    pub prepended: usize,
    /// Cached rows dropped because they no longer connect to fetched history.
    pub removed: Vec<MessageId>,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated == 0 && self.replaced.is_empty() && self.removed.is_empty()
    }

    pub fn absorb(&mut self, other: MergeReport) {
        if self.appended_from.is_none() {
            self.appended_from = other.appended_from;
        }
        self.inserted.extend(other.inserted);
        self.updated += other.updated;
        self.replaced.extend(other.replaced);
        self.appended += other.appended;
        self.prepended += other.prepended;
        self.removed.extend(other.removed);
    }
}

/// Notification broadcast after every store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// A thread became active; its list may have been seeded from cache.
    Opened { thread_id: ThreadId },
    Merged { thread_id: ThreadId, report: MergeReport },
    /// Rows changed in place (status, reactions, upload progress, receipts).
    Updated { thread_id: ThreadId, ids: Vec<MessageId> },
    Participants { thread_id: ThreadId },
    /// The server does not know the thread and nothing was cached.
    Missing { thread_id: ThreadId },
    HistoryExhausted { thread_id: ThreadId },
}

impl StoreChange {
    pub fn thread_id(&self) -> ThreadId {
        match self {
            StoreChange::Opened { thread_id }
            | StoreChange::Merged { thread_id, .. }
            | StoreChange::Updated { thread_id, .. }
            | StoreChange::Participants { thread_id }
            | StoreChange::Missing { thread_id }
            | StoreChange::HistoryExhausted { thread_id } => *thread_id,
        }
    }
}

pub enum FetchDecision {
    Start(FetchMode),
    Coalesced,
}

/// Single-flight bookkeeping for `fetch_messages`.
#[derive(Debug, Default)]
pub struct FetchState {
    in_flight: Option<FetchMode>,
    follow_up: Option<FetchMode>,
}

impl FetchState {
    /// Either claims the slot or folds the request into the one follow-up.
    pub fn begin(&mut self, mode: FetchMode) -> FetchDecision {
        if self.in_flight.is_some() {
            self.follow_up = Some(match (self.follow_up, mode) {
                (Some(FetchMode::Initial), _) | (_, FetchMode::Initial) => FetchMode::Initial,
                _ => FetchMode::Incremental,
            });
            FetchDecision::Coalesced
        } else {
            self.in_flight = Some(mode);
            FetchDecision::Start(mode)
        }
    }

    /// Releases the slot and hands back the coalesced follow-up, if any.
    pub fn finish(&mut self) -> Option<FetchMode> {
        self.in_flight = None;
        self.follow_up.take()
    }

    pub fn cancel(&mut self) {
        self.in_flight = None;
        self.follow_up = None;
    }

    pub fn in_flight(&self) -> Option<FetchMode> {
        self.in_flight
    }

    pub fn has_follow_up(&self) -> bool {
        self.follow_up.is_some()
    }
}

/// Typing and presence of the people in the thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Participants {
    pub typing: BTreeSet<UserId>,
    pub presence: HashMap<UserId, PresenceStatus>,
}

/// Canonical, ordered message list of one thread.
#[derive(Debug)]
pub struct MessageStore {
    thread_id: ThreadId,
    entries: Vec<StoreEntry>,
    pub fetch: FetchState,
    pub older_in_flight: bool,
    pub history_exhausted: bool,
    pub initial_loaded: bool,
    pub missing: bool,
    pub participants: Participants,
    /// Highest id read back from the cache, until the first page lands.
    cached_tail: Option<i64>,
}

impl MessageStore {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            entries: Vec::new(),
            fetch: FetchState::default(),
            older_in_flight: false,
            history_exhausted: false,
            initial_loaded: false,
            missing: false,
            participants: Participants::default(),
            cached_tail: None,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|idx| &self.entries[idx].message)
    }

    /// Mutates a row in place. Ordering fields must not be touched here.
    pub fn update<F>(&mut self, id: MessageId, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        match self.position(id) {
            Some(idx) => {
                f(&mut self.entries[idx].message);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&mut self, id: MessageId, status: MessageStatus) -> bool {
        self.update(id, |m| m.status = status)
    }

    /// Highest confirmed id; the cursor for incremental fetches.
    pub fn tail_server_id(&self) -> Option<i64> {
        self.entries.iter().filter_map(|e| e.message.id.server()).max()
    }

    /// Lowest confirmed id; the cursor for loading older history.
    pub fn head_server_id(&self) -> Option<i64> {
        self.entries.iter().filter_map(|e| e.message.id.server()).min()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    pub fn local_for_request(&self, client_request_id: &str) -> Option<LocalId> {
        self.entries.iter().find_map(|e| match e.message.id {
            MessageId::Local(local) if e.message.client_request_id.as_deref() == Some(client_request_id) => {
                Some(local)
            }
            _ => None,
        })
    }

    /// Fills an empty store with rows read back from the local cache.
    pub fn seed_from_cache(&mut self, rows: Vec<Message>) -> MergeReport {
        let report = self.merge_batch(rows);
        self.cached_tail = self.tail_server_id();
        report
    }

    /// Merges fetched rows; placement follows the plain `(timestamp, id)` key.
    pub fn merge_batch(&mut self, incoming: Vec<Message>) -> MergeReport {
        self.merge_inner(incoming, false)
    }

    /// Merges a row that just arrived live (realtime or local send).
    ///
    /// A row newer than everything known is pinned to the tail even when its
    /// timestamp is older than the current tail.
    pub fn ingest_live(&mut self, message: Message) -> MergeReport {
        self.merge_inner(vec![message], true)
    }

    /// Retires a placeholder in favour of its server-confirmed row.
    pub fn confirm_local(&mut self, local: LocalId, confirmed: Message) -> MergeReport {
        let before = self.bounds();
        let mut report = MergeReport::default();
        if self.position(MessageId::Local(local)).is_some() {
            self.replace_local(local, confirmed, &mut report);
        } else if let Some(idx) = self.position(confirmed.id) {
            let previous = self.entries[idx].message.clone();
            self.entries[idx].message.overlay(&confirmed);
            if self.entries[idx].message != previous {
                report.updated += 1;
            }
        } else {
            let floor = self.live_floor(&confirmed);
            report.inserted.push(confirmed.id);
            self.entries.push(StoreEntry::new(confirmed, floor));
        }
        self.reorder();
        self.classify(&mut report, before);
        report
    }

    /// Marks own messages up to `up_to` as read by the counterpart.
    pub fn apply_read(&mut self, up_to: i64, reader: UserId, at: DateTime<Utc>) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for entry in self.entries.iter_mut() {
            let msg = &mut entry.message;
            match msg.id.server() {
                Some(id) if id <= up_to && msg.sender_id != reader && !msg.is_read => {
                    msg.mark_read(at);
                    changed.push(msg.id);
                }
                _ => {}
            }
        }
        changed
    }

    pub fn apply_delivered(&mut self, up_to: i64, recipient: UserId, at: DateTime<Utc>) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for entry in self.entries.iter_mut() {
            let msg = &mut entry.message;
            match msg.id.server() {
                Some(id) if id <= up_to && msg.sender_id != recipient && !msg.is_delivered => {
                    msg.mark_delivered(at);
                    changed.push(msg.id);
                }
                _ => {}
            }
        }
        changed
    }

    /// Applies an initial or incremental page and updates load flags.
    ///
    /// When the first initial page after seeding does not reach back to the
    /// newest cached row, the cached rows below it are dropped so older
    /// history is loaded again from the page's head instead of leaving a gap.
    pub fn apply_page(
        &mut self,
        mode: FetchMode,
        rows: Vec<Message>,
        requested: usize,
        has_more: Option<bool>,
    ) -> MergeReport {
        let count = rows.len();
        let page_head = rows.iter().filter_map(|m| m.id.server()).min();
        let mut report = MergeReport::default();
        if mode == FetchMode::Initial {
            if let (Some(cached_tail), Some(page_head)) = (self.cached_tail.take(), page_head) {
                if page_head > cached_tail {
                    report.removed = self.drop_server_rows_below(page_head);
                    debug!(
                        "[STORE] Dropped {} cached rows of thread {} below {}",
                        report.removed.len(),
                        self.thread_id,
                        page_head
                    );
                }
            }
        }
        report.absorb(self.merge_batch(rows));
        self.initial_loaded = true;
        self.missing = false;
        if mode == FetchMode::Initial && (count < requested || has_more == Some(false)) {
            self.history_exhausted = true;
        }
        report
    }

    /// Applies a page of older history and reports whether the start was hit.
    pub fn apply_older_page(&mut self, rows: Vec<Message>, requested: usize, has_more: Option<bool>) -> MergeReport {
        let count = rows.len();
        let report = self.merge_batch(rows);
        if count < requested || has_more == Some(false) {
            self.history_exhausted = true;
        }
        report
    }

    fn drop_server_rows_below(&mut self, id: i64) -> Vec<MessageId> {
        let mut removed = Vec::new();
        self.entries.retain(|e| match e.message.id.server() {
            Some(server) if server < id => {
                removed.push(e.message.id);
                false
            }
            _ => true,
        });
        removed
    }

    fn merge_inner(&mut self, incoming: Vec<Message>, live: bool) -> MergeReport {
        let before = self.bounds();
        let mut report = MergeReport::default();
        for message in incoming {
            if message.id.server().is_some() {
                let correlated = message
                    .client_request_id
                    .as_deref()
                    .and_then(|crid| self.local_for_request(crid));
                if let Some(local) = correlated {
                    self.replace_local(local, message, &mut report);
                    continue;
                }
            }
            match self.position(message.id) {
                Some(idx) => {
                    let previous = self.entries[idx].message.clone();
                    self.entries[idx].message.overlay(&message);
                    if self.entries[idx].message != previous {
                        report.updated += 1;
                    }
                }
                None => {
                    let floor = if live { self.live_floor(&message) } else { None };
                    report.inserted.push(message.id);
                    self.entries.push(StoreEntry::new(message, floor));
                }
            }
        }
        self.reorder();
        self.classify(&mut report, before);
        report
    }

    fn replace_local(&mut self, local: LocalId, confirmed: Message, report: &mut MergeReport) {
        let Some(idx) = self.position(MessageId::Local(local)) else {
            return;
        };
        let placeholder = self.entries.remove(idx).message;
        let Some(server_id) = confirmed.id.server() else {
            return;
        };
        report.replaced.push((local, server_id));
        match self.position(confirmed.id) {
            Some(existing) => {
                // The confirmed row got here first (fetch raced the echo).
                let row = &mut self.entries[existing].message;
                row.overlay(&confirmed);
                if row.local.preview_url.is_none() {
                    row.local.preview_url = placeholder.local.preview_url;
                }
                if row.local.upload_progress.is_none() {
                    row.local.upload_progress = placeholder.local.upload_progress;
                }
            }
            None => {
                let mut row = placeholder;
                row.id = confirmed.id;
                row.overlay(&confirmed);
                let floor = self.live_floor(&row);
                self.entries.push(StoreEntry::new(row, floor));
            }
        }
    }

    /// A live row newer than everything known sorts no earlier than the
    /// current tail.
    fn live_floor(&self, message: &Message) -> Option<i64> {
        let newer = match message.id {
            MessageId::Local(_) => true,
            MessageId::Server(id) => self.tail_server_id().map_or(true, |tail| id > tail),
        };
        if newer {
            self.entries.iter().map(|e| e.order.ts).max()
        } else {
            None
        }
    }

    /// Recomputes every order key from the current rows and re-sorts.
    ///
    /// A row without a usable timestamp takes the order timestamp of the
    /// nearest lower confirmed id (or `i64::MIN`); placeholders without one
    /// follow the newest confirmed row. Keys only depend on the set of rows
    /// and their live floors, never on the order they arrived in.
    fn reorder(&mut self) {
        let mut confirmed: Vec<usize> = (0..self.entries.len())
            .filter(|idx| self.entries[*idx].message.id.server().is_some())
            .collect();
        confirmed.sort_by_key(|idx| self.entries[*idx].message.id.order_rank());

        let mut carried = i64::MIN;
        let mut newest = i64::MIN;
        for idx in confirmed {
            let entry = &mut self.entries[idx];
            let ts = resolve_ts(entry, carried);
            entry.order = OrderKey { ts, rank: entry.message.id.order_rank() };
            carried = ts;
            newest = newest.max(ts);
        }
        for entry in self.entries.iter_mut().filter(|e| e.message.id.server().is_none()) {
            let ts = resolve_ts(entry, newest);
            entry.order = OrderKey { ts, rank: entry.message.id.order_rank() };
        }
        self.entries.sort_by(|a, b| a.order.cmp(&b.order));
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn bounds(&self) -> Option<(OrderKey, OrderKey)> {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => Some((first.order, last.order)),
            _ => None,
        }
    }

    fn classify(&self, report: &mut MergeReport, before: Option<(OrderKey, OrderKey)>) {
        if report.inserted.is_empty() {
            return;
        }
        for entry in &self.entries {
            if !report.inserted.contains(&entry.message.id) {
                continue;
            }
            match before {
                Some((head, _)) if entry.order < head => report.prepended += 1,
                Some((_, tail)) if entry.order <= tail => {}
                _ => {
                    report.appended += 1;
                    if report.appended_from.is_none() {
                        report.appended_from = Some(entry.message.id);
                    }
                }
            }
        }
    }
}

fn resolve_ts(entry: &StoreEntry, fallback: i64) -> i64 {
    let ts = entry.message.timestamp.map_or(fallback, |t| t.timestamp_millis());
    entry.floor.map_or(ts, |floor| ts.max(floor))
}

/// Pure keyed union of two batches, ordered by `(timestamp, id)`.
pub fn merge_messages(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let thread = existing
        .first()
        .or_else(|| incoming.first())
        .map(|m| m.thread_id)
        .unwrap_or_default();
    let mut store = MessageStore::new(thread);
    store.merge_batch(existing.to_vec());
    store.merge_batch(incoming.to_vec());
    store.messages()
}
