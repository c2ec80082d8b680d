use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::client::config::SyncConfig;
use crate::client::models::outbox::*;
use crate::client::models::store::{FetchDecision, MergeReport, MessageStore, StoreChange};
use crate::client::services::api::MessageApi;
use crate::client::services::cache::MessageCache;
use crate::client::services::reactions::{ReactionDebouncer, ReactionIntent};
use crate::client::services::realtime::{ChannelHealth, RealtimeChannel};
use crate::client::services::registry::SessionRegistry;
use crate::client::services::router::*;
use crate::client::services::transport::{classify, Backoff, ErrorClass, TransportMonitor};
use crate::common::error::{ApiError, SyncError};
use crate::common::models::*;
use crate::common::protocol::*;

const FETCH_BACKOFF: Backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
const CHANGE_BUFFER: usize = 256;

/// Collaborators the engine is built from.
pub struct SyncDeps {
    pub config: SyncConfig,
    pub api: Arc<dyn MessageApi>,
    pub channel: Arc<dyn RealtimeChannel>,
    pub cache: Arc<dyn MessageCache>,
    pub registry: Arc<SessionRegistry>,
    pub transport: TransportMonitor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Fetch even when the thread is not the visible one.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRequest {
    Started,
    /// Folded into the follow-up of the fetch already in flight.
    Coalesced,
    Skipped,
}

/// Point-in-time copy of the open thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub messages: Vec<Message>,
    pub initial_loaded: bool,
    pub history_exhausted: bool,
    pub missing: bool,
    pub fetch_in_flight: bool,
    pub typing: Vec<UserId>,
    pub presence: HashMap<UserId, PresenceStatus>,
    pub degraded: bool,
}

impl ThreadSnapshot {
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub task_id: Uuid,
    pub thread_id: ThreadId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub message_id: Option<MessageId>,
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Open { thread_id: ThreadId, reply: oneshot::Sender<()> },
    Close { reply: oneshot::Sender<()> },
    SetActive { active: bool },
    Fetch { mode: FetchMode, options: FetchOptions, reply: oneshot::Sender<FetchRequest> },
    FetchOlder { reply: Reply<usize> },
    SendText { content: String, reply_to: Option<i64>, reply: Reply<LocalId> },
    SendAttachment { upload: AttachmentUpload, kind: AttachmentKind, reply: Reply<LocalId> },
    Retry { id: MessageId, reply: Reply<()> },
    ToggleReaction { id: MessageId, emoji: String, reply: Reply<bool> },
    Delete { id: MessageId, reply: Reply<()> },
    Typing,
    MarkSeen,
    Snapshot { reply: oneshot::Sender<Option<ThreadSnapshot>> },
    Pending { reply: oneshot::Sender<Vec<PendingTask>> },
    Shutdown,
}

enum TaskSuccess {
    Sent(WireMessage),
    Initialized(AttachmentInit),
    Uploaded { server_id: i64, file_url: String },
    Finalized { server_id: i64, row: Option<WireMessage>, file_url: String, meta: AttachmentMeta },
    Done,
}

enum Completion {
    Fetched {
        epoch: u64,
        thread_id: ThreadId,
        mode: FetchMode,
        requested: usize,
        result: Result<MessagePage, ApiError>,
    },
    FetchedOlder {
        epoch: u64,
        thread_id: ThreadId,
        requested: usize,
        result: Result<MessagePage, ApiError>,
    },
    Task {
        task_id: Uuid,
        thread_id: ThreadId,
        temp_id: Option<LocalId>,
        result: Result<TaskSuccess, ApiError>,
    },
    Progress {
        thread_id: ThreadId,
        id: MessageId,
        percent: u8,
    },
}

/// Cloneable front end of a running engine.
#[derive(Clone)]
pub struct ThreadSyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    changes: broadcast::Sender<StoreChange>,
    registry: Arc<SessionRegistry>,
}

impl ThreadSyncHandle {
    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Makes `thread_id` the active thread: seeds it from the cache,
    /// subscribes to its topic and starts the initial fetch.
    pub async fn open_thread(&self, thread_id: ThreadId) -> Result<(), SyncError> {
        self.request(|reply| Command::Open { thread_id, reply }).await
    }

    pub async fn close_thread(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Whether the open thread is on screen. Background threads only fetch
    /// when forced.
    pub fn set_active(&self, active: bool) -> Result<(), SyncError> {
        self.send(Command::SetActive { active })
    }

    pub async fn fetch_messages(&self, mode: FetchMode, options: FetchOptions) -> Result<FetchRequest, SyncError> {
        self.request(|reply| Command::Fetch { mode, options, reply }).await
    }

    /// Loads the page before the oldest known message; returns how many rows
    /// were added.
    pub async fn fetch_older(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::FetchOlder { reply }).await?
    }

    pub async fn send_text(&self, content: impl Into<String>, reply_to: Option<i64>) -> Result<LocalId, SyncError> {
        let content = content.into();
        self.request(|reply| Command::SendText { content, reply_to, reply }).await?
    }

    pub async fn send_attachment(&self, upload: AttachmentUpload, kind: AttachmentKind) -> Result<LocalId, SyncError> {
        self.request(|reply| Command::SendAttachment { upload, kind, reply }).await?
    }

    /// Re-arms a send that ended in `failed`.
    pub async fn retry_message(&self, id: MessageId) -> Result<(), SyncError> {
        self.request(|reply| Command::Retry { id, reply }).await?
    }

    /// Flips the user's reaction optimistically and returns the new state.
    pub async fn toggle_reaction(&self, id: MessageId, emoji: impl Into<String>) -> Result<bool, SyncError> {
        let emoji = emoji.into();
        self.request(|reply| Command::ToggleReaction { id, emoji, reply }).await?
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<(), SyncError> {
        self.request(|reply| Command::Delete { id, reply }).await?
    }

    pub fn notify_typing(&self) -> Result<(), SyncError> {
        self.send(Command::Typing)
    }

    pub fn mark_seen(&self) -> Result<(), SyncError> {
        self.send(Command::MarkSeen)
    }

    pub async fn snapshot(&self) -> Result<Option<ThreadSnapshot>, SyncError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn pending_tasks(&self) -> Result<Vec<PendingTask>, SyncError> {
        self.request(|reply| Command::Pending { reply }).await
    }

    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct ActiveThread {
    store: MessageStore,
    router: EventRouter,
}

/// Single-task engine owning every piece of mutable sync state.
pub struct ThreadSync {
    config: SyncConfig,
    me: Participant,
    api: Arc<dyn MessageApi>,
    channel: Arc<dyn RealtimeChannel>,
    cache: Arc<dyn MessageCache>,
    registry: Arc<SessionRegistry>,
    transport: TransportMonitor,
    changes: broadcast::Sender<StoreChange>,
    completions: mpsc::UnboundedSender<Completion>,
    cache_writer: mpsc::UnboundedSender<(ThreadId, Vec<Message>)>,

    thread: Option<ActiveThread>,
    outbox: Outbox,
    epoch: u64,
    next_local: u64,
    active: bool,
    fetch_tasks: Vec<JoinHandle<()>>,
    fetch_retry: Option<(Instant, FetchMode)>,
    fetch_failures: u32,
    refetch_on_reconnect: Option<FetchMode>,
    older_reply: Option<Reply<usize>>,
    reconcile: ReconcileScheduler,
    poller: DegradedPoller,
    typing_throttle: TypingThrottle,
    typing_clear_at: Option<Instant>,
    reactions: ReactionDebouncer,
    delivered_up_to: HashMap<ThreadId, i64>,
}

impl ThreadSync {
    /// Starts the engine on the current runtime.
    pub fn spawn(
        deps: SyncDeps,
        events: mpsc::Receiver<RealtimeEnvelope>,
        health: watch::Receiver<ChannelHealth>,
    ) -> ThreadSyncHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let cache_writer = spawn_cache_writer(deps.cache.clone());
        let config = deps.config;

        let engine = ThreadSync {
            me: config.participant(),
            api: deps.api,
            channel: deps.channel,
            cache: deps.cache,
            registry: deps.registry.clone(),
            transport: deps.transport,
            changes: changes.clone(),
            completions: completion_tx,
            cache_writer,
            thread: None,
            outbox: Outbox::new(),
            epoch: 0,
            next_local: 0,
            active: true,
            fetch_tasks: Vec::new(),
            fetch_retry: None,
            fetch_failures: 0,
            refetch_on_reconnect: None,
            older_reply: None,
            reconcile: ReconcileScheduler::new(config.reconcile_delay, config.reconcile_throttle),
            poller: DegradedPoller::new(config.degraded_poll),
            typing_throttle: TypingThrottle::new(config.typing_throttle),
            typing_clear_at: None,
            reactions: ReactionDebouncer::new(config.reaction_debounce),
            delivered_up_to: HashMap::new(),
            config,
        };
        let online = engine.transport.subscribe();
        tokio::spawn(engine.run(command_rx, completion_rx, events, health, online));

        ThreadSyncHandle { commands: command_tx, changes, registry: deps.registry }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut events: mpsc::Receiver<RealtimeEnvelope>,
        mut health: watch::Receiver<ChannelHealth>,
        mut online: watch::Receiver<bool>,
    ) {
        info!("[SYNC] Engine started for user {}", self.me.user_id);
        let (mut events_open, mut health_open, mut online_open) = (true, true, true);
        let initial_health = *health.borrow_and_update();
        self.poller.observe(&initial_health, Instant::now());

        loop {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                event = events.recv(), if events_open => match event {
                    Some(envelope) => self.handle_event(envelope),
                    None => {
                        warn!("[SYNC] Realtime event stream ended");
                        events_open = false;
                    }
                },
                changed = health.changed(), if health_open => match changed {
                    Ok(()) => {
                        let current = *health.borrow_and_update();
                        self.on_health(current);
                    }
                    Err(_) => health_open = false,
                },
                changed = online.changed(), if online_open => match changed {
                    Ok(()) => {
                        let current = *online.borrow_and_update();
                        self.on_online(current);
                    }
                    Err(_) => online_open = false,
                },
                _ = timer => self.on_timers(),
            }
        }

        self.leave_thread().await;
        info!("[SYNC] Engine stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.reconcile.deadline(),
            self.poller.deadline(),
            self.outbox.next_deadline(),
            self.fetch_retry.map(|(at, _)| at),
            self.reactions.next_deadline(),
            self.typing_clear_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ---- commands -------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { thread_id, reply } => {
                self.open_thread(thread_id).await;
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                self.leave_thread().await;
                let _ = reply.send(());
            }
            Command::SetActive { active } => {
                let resumed = active && !self.active;
                self.active = active;
                if resumed {
                    self.reconcile.nudge(Instant::now());
                }
            }
            Command::Fetch { mode, options, reply } => {
                let _ = reply.send(self.request_fetch(mode, options.force));
            }
            Command::FetchOlder { reply } => self.fetch_older(reply),
            Command::SendText { content, reply_to, reply } => {
                let _ = reply.send(self.send_text(content, reply_to));
            }
            Command::SendAttachment { upload, kind, reply } => {
                let _ = reply.send(self.send_attachment(upload, kind));
            }
            Command::Retry { id, reply } => {
                let _ = reply.send(self.retry_message(id));
            }
            Command::ToggleReaction { id, emoji, reply } => {
                let _ = reply.send(self.toggle_reaction(id, &emoji));
            }
            Command::Delete { id, reply } => {
                let _ = reply.send(self.delete_message(id));
            }
            Command::Typing => self.notify_typing().await,
            Command::MarkSeen => {
                if let Some(thread) = &self.thread {
                    self.registry.update_summary(thread.store.thread_id(), |s| s.unread_count = 0);
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Pending { reply } => {
                let pending = self
                    .outbox
                    .tasks()
                    .map(|t| PendingTask {
                        task_id: t.task_id,
                        thread_id: t.thread_id,
                        kind: t.kind,
                        status: t.status,
                        attempt_count: t.attempt_count,
                        message_id: t.message_id(),
                    })
                    .collect();
                let _ = reply.send(pending);
            }
            Command::Shutdown => {}
        }
    }

    async fn open_thread(&mut self, thread_id: ThreadId) {
        if self.thread.as_ref().map(|t| t.store.thread_id()) == Some(thread_id) {
            debug!("[SYNC] Thread {} already open", thread_id);
            return;
        }
        self.leave_thread().await;
        info!("[SYNC] Opening thread {}", thread_id);

        let mut store = MessageStore::new(thread_id);
        match self.cache.load(thread_id).await {
            Ok(rows) if !rows.is_empty() => {
                debug!("[CACHE] Seeding thread {} with {} cached rows", thread_id, rows.len());
                store.seed_from_cache(rows);
            }
            Ok(_) => {}
            Err(e) => warn!("[CACHE] Could not load thread {}: {}", thread_id, e),
        }
        for placeholder in self.pending_placeholders(thread_id) {
            store.ingest_live(placeholder);
        }

        let router = EventRouter::new(thread_id, self.me, self.registry.clone());
        if let Err(e) = self.channel.subscribe(router.topic()).await {
            warn!("[SYNC] Subscribe to {} failed: {}", router.topic(), e);
        }
        router.refresh_summary(&store);
        self.thread = Some(ActiveThread { store, router });
        self.active = true;
        self.typing_throttle.reset();
        self.emit(StoreChange::Opened { thread_id });

        self.request_fetch(FetchMode::Initial, true);
    }

    /// Drops the open thread: aborts its fetches and invalidates late results.
    async fn leave_thread(&mut self) {
        self.flush_reactions();
        self.epoch += 1;
        for task in self.fetch_tasks.drain(..) {
            task.abort();
        }
        self.fetch_retry = None;
        self.fetch_failures = 0;
        self.refetch_on_reconnect = None;
        self.reconcile.reset();
        self.typing_clear_at = None;
        if let Some(reply) = self.older_reply.take() {
            let _ = reply.send(Ok(0));
        }
        if let Some(thread) = self.thread.take() {
            info!("[SYNC] Leaving thread {}", thread.store.thread_id());
            if let Err(e) = self.channel.unsubscribe(thread.router.topic()).await {
                debug!("[SYNC] Unsubscribe from {} failed: {}", thread.router.topic(), e);
            }
        }
    }

    /// Rebuilds rows for sends still sitting in the outbox.
    fn pending_placeholders(&self, thread_id: ThreadId) -> Vec<Message> {
        self.outbox
            .tasks()
            .filter(|t| t.thread_id == thread_id)
            .filter_map(|task| {
                let local = task.temp_id?;
                let status = match task.status {
                    TaskStatus::Queued => MessageStatus::Queued,
                    TaskStatus::InFlight => MessageStatus::Sending,
                    TaskStatus::Failed => MessageStatus::Failed,
                };
                let crid = task.client_request_id.clone();
                match &task.payload {
                    TaskPayload::Text { content, reply_to } => {
                        let mut row =
                            Message::local_placeholder(local, thread_id, &self.me, content.clone(), crid, status);
                        row.reply_to_message_id = *reply_to;
                        Some(row)
                    }
                    TaskPayload::Attachment { upload, stage: AttachmentStage::Init, .. } => {
                        let mut row =
                            Message::local_placeholder(local, thread_id, &self.me, upload.caption.clone(), crid, status);
                        row.attachment_meta = Some(upload.meta());
                        row.local.preview_url = upload.preview_url.clone();
                        Some(row)
                    }
                    _ => None,
                }
            })
            .collect()
    }

    fn request_fetch(&mut self, mode: FetchMode, force: bool) -> FetchRequest {
        if !self.active && !force {
            trace!("[SYNC] Skipping {} fetch for inactive thread", mode.as_str());
            return FetchRequest::Skipped;
        }
        let Some(thread) = self.thread.as_mut() else {
            return FetchRequest::Skipped;
        };
        match thread.store.fetch.begin(mode) {
            FetchDecision::Coalesced => {
                debug!("[SYNC] Coalescing {} fetch into follow-up", mode.as_str());
                FetchRequest::Coalesced
            }
            FetchDecision::Start(mode) => {
                let thread_id = thread.store.thread_id();
                let mut query = ListQuery::latest(mode, self.config.page_size);
                if mode == FetchMode::Incremental {
                    query.after_id = thread.store.tail_server_id();
                }
                self.fetch_retry = None;
                self.reconcile.record_run(Instant::now());
                let api = self.api.clone();
                let tx = self.completions.clone();
                let epoch = self.epoch;
                debug!("[SYNC] Fetching {} page for thread {} ({:?})", mode.as_str(), thread_id, query.after_id);
                let handle = tokio::spawn(async move {
                    let result = api.list_messages(thread_id, &query).await;
                    let _ = tx.send(Completion::Fetched { epoch, thread_id, mode, requested: query.limit, result });
                });
                self.fetch_tasks.retain(|t| !t.is_finished());
                self.fetch_tasks.push(handle);
                FetchRequest::Started
            }
        }
    }

    fn fetch_older(&mut self, reply: Reply<usize>) {
        let Some(thread) = self.thread.as_mut() else {
            let _ = reply.send(Err(SyncError::NoActiveThread));
            return;
        };
        let store = &mut thread.store;
        let head = store.head_server_id();
        if store.history_exhausted || store.older_in_flight || head.is_none() {
            let _ = reply.send(Ok(0));
            return;
        }
        store.older_in_flight = true;
        let thread_id = store.thread_id();
        let mut query = ListQuery::latest(FetchMode::Incremental, self.config.page_size);
        query.before_id = head;
        let api = self.api.clone();
        let tx = self.completions.clone();
        let epoch = self.epoch;
        self.older_reply = Some(reply);
        let handle = tokio::spawn(async move {
            let result = api.list_messages(thread_id, &query).await;
            let _ = tx.send(Completion::FetchedOlder { epoch, thread_id, requested: query.limit, result });
        });
        self.fetch_tasks.retain(|t| !t.is_finished());
        self.fetch_tasks.push(handle);
    }

    fn allocate_local(&mut self) -> LocalId {
        self.next_local += 1;
        LocalId(self.next_local)
    }

    fn send_text(&mut self, content: String, reply_to: Option<i64>) -> Result<LocalId, SyncError> {
        let thread_id = self.active_thread_id()?;
        let local = self.allocate_local();
        let task = OutboxTask::new(
            thread_id,
            Some(local),
            TaskKind::Text,
            TaskPayload::Text { content: content.clone(), reply_to },
        );
        let mut row = Message::local_placeholder(
            local,
            thread_id,
            &self.me,
            content,
            task.client_request_id.clone(),
            MessageStatus::Queued,
        );
        row.reply_to_message_id = reply_to;
        self.enqueue_send(row, task);
        Ok(local)
    }

    fn send_attachment(&mut self, upload: AttachmentUpload, kind: AttachmentKind) -> Result<LocalId, SyncError> {
        let thread_id = self.active_thread_id()?;
        let local = self.allocate_local();
        let mut row = Message::local_placeholder(
            local,
            thread_id,
            &self.me,
            upload.caption.clone(),
            String::new(),
            MessageStatus::Queued,
        );
        row.attachment_meta = Some(upload.meta());
        row.local.preview_url = upload.preview_url.clone();
        let task = OutboxTask::new(
            thread_id,
            Some(local),
            TaskKind::for_attachment(kind),
            TaskPayload::Attachment { upload, kind, stage: AttachmentStage::Init },
        );
        row.client_request_id = Some(task.client_request_id.clone());
        self.enqueue_send(row, task);
        Ok(local)
    }

    fn enqueue_send(&mut self, row: Message, task: OutboxTask) {
        info!("[OUTBOX] Queued {:?} send {} on thread {}", task.kind, row.id, task.thread_id);
        if let Some(thread) = self.thread.as_mut() {
            let report = thread.store.ingest_live(row);
            self.after_merge(report);
        }
        self.outbox.enqueue(task);
        self.drain_outbox();
    }

    fn retry_message(&mut self, id: MessageId) -> Result<(), SyncError> {
        if !self.outbox.retry_failed(id) {
            return Err(SyncError::NothingToRetry(id));
        }
        info!("[OUTBOX] Retrying failed send {}", id);
        self.set_status(id, MessageStatus::Queued);
        self.drain_outbox();
        Ok(())
    }

    fn toggle_reaction(&mut self, id: MessageId, emoji: &str) -> Result<bool, SyncError> {
        let message_id = id.server().ok_or(SyncError::NotConfirmed(id))?;
        let now = Instant::now();
        let thread = self.thread.as_mut().ok_or(SyncError::NoActiveThread)?;
        let current = thread.store.get(id).ok_or(SyncError::UnknownMessage(id))?.has_reacted(emoji);
        let desired = self.reactions.toggle(message_id, emoji, current, now);
        if desired != current {
            thread.store.update(id, |m| apply_own_reaction(m, emoji, desired));
        }
        self.touched(vec![id], true);
        Ok(desired)
    }

    fn delete_message(&mut self, id: MessageId) -> Result<(), SyncError> {
        let message_id = id.server().ok_or(SyncError::NotConfirmed(id))?;
        let thread = self.thread.as_mut().ok_or(SyncError::NoActiveThread)?;
        let previous = thread.store.get(id).cloned().ok_or(SyncError::UnknownMessage(id))?;
        if previous.deleted {
            return Ok(());
        }
        let thread_id = thread.store.thread_id();
        thread.store.update(id, |m| m.tombstone());
        self.touched(vec![id], true);
        self.outbox.enqueue(OutboxTask::new(
            thread_id,
            None,
            TaskKind::Delete,
            TaskPayload::Delete { message_id, previous: Box::new(previous) },
        ));
        self.drain_outbox();
        Ok(())
    }

    async fn notify_typing(&mut self) {
        let Some(thread) = &self.thread else {
            return;
        };
        if !self.typing_throttle.should_send(Instant::now()) {
            return;
        }
        if let Err(e) = self.channel.send_typing(thread.router.topic()).await {
            debug!("[SYNC] Typing broadcast failed: {}", e);
        }
    }

    fn snapshot(&self) -> Option<ThreadSnapshot> {
        let thread = self.thread.as_ref()?;
        let store = &thread.store;
        Some(ThreadSnapshot {
            thread_id: store.thread_id(),
            messages: store.messages(),
            initial_loaded: store.initial_loaded,
            history_exhausted: store.history_exhausted,
            missing: store.missing,
            fetch_in_flight: store.fetch.in_flight().is_some(),
            typing: store.participants.typing.iter().copied().collect(),
            presence: store.participants.presence.clone(),
            degraded: self.poller.is_degraded(),
        })
    }

    // ---- completions ----------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { epoch, thread_id, mode, requested, result } => {
                if epoch != self.epoch {
                    debug!("[SYNC] Dropping stale {} page for thread {}", mode.as_str(), thread_id);
                    return;
                }
                self.on_fetched(thread_id, mode, requested, result);
            }
            Completion::FetchedOlder { epoch, thread_id, requested, result } => {
                if epoch != self.epoch {
                    return;
                }
                self.on_fetched_older(thread_id, requested, result);
            }
            Completion::Task { task_id, thread_id, temp_id, result } => match result {
                Ok(success) => self.on_task_done(task_id, thread_id, temp_id, success),
                Err(err) => self.on_task_failed(task_id, thread_id, err),
            },
            Completion::Progress { thread_id, id, percent } => {
                let uploading = matches!(
                    self.outbox.task_for_message(id).map(|t| &t.payload),
                    Some(TaskPayload::Attachment { stage: AttachmentStage::Upload { .. }, .. })
                );
                if !uploading {
                    return;
                }
                if let Some(store) = self.store_for(thread_id) {
                    if store.update(id, |m| m.local.upload_progress = Some(percent)) {
                        self.touched(vec![id], false);
                    }
                }
            }
        }
    }

    fn on_fetched(&mut self, thread_id: ThreadId, mode: FetchMode, requested: usize, result: Result<MessagePage, ApiError>) {
        let online = self.transport.is_online();
        let Some(thread) = self.thread.as_mut().filter(|t| t.store.thread_id() == thread_id) else {
            return;
        };
        let follow_up = thread.store.fetch.finish();
        let mut full_page = false;

        match result {
            Ok(page) => {
                self.fetch_failures = 0;
                let rows: Vec<Message> = page.messages.into_iter().map(|w| w.normalize(thread_id)).collect();
                let count = rows.len();
                for crid in rows.iter().filter_map(|m| m.client_request_id.as_deref()) {
                    self.outbox.confirm_echo(crid);
                }
                let was_exhausted = thread.store.history_exhausted;
                let report = thread.store.apply_page(mode, rows, requested, page.has_more);
                let exhausted_now = thread.store.history_exhausted && !was_exhausted;
                debug!("[SYNC] {} page for thread {}: {} rows", mode.as_str(), thread_id, count);
                full_page = mode == FetchMode::Incremental && count >= requested;
                if report.is_empty() {
                    self.persist();
                } else {
                    self.after_merge(report);
                }
                if exhausted_now {
                    self.emit(StoreChange::HistoryExhausted { thread_id });
                }
            }
            Err(err) => {
                let class = classify(&err, online);
                match class {
                    ErrorClass::NotFound if thread.store.is_empty() => {
                        info!("[SYNC] Thread {} not found; showing empty state", thread_id);
                        thread.store.missing = true;
                        thread.store.initial_loaded = true;
                        self.emit(StoreChange::Missing { thread_id });
                    }
                    ErrorClass::Offline => {
                        debug!("[SYNC] Fetch deferred until reconnect");
                        self.refetch_on_reconnect = Some(merge_mode(self.refetch_on_reconnect, mode));
                    }
                    ErrorClass::HardClient => {
                        error!("[SYNC] {} fetch for thread {} rejected: {}", mode.as_str(), thread_id, err);
                    }
                    ErrorClass::NotFound | ErrorClass::Transient | ErrorClass::Forbidden => {
                        self.fetch_failures += 1;
                        let at = Instant::now() + FETCH_BACKOFF.delay(self.fetch_failures);
                        warn!("[SYNC] {} fetch failed ({}); retry #{}", mode.as_str(), err, self.fetch_failures);
                        let retry_mode = merge_mode(self.fetch_retry.map(|(_, m)| m), mode);
                        self.fetch_retry = Some((at, retry_mode));
                    }
                }
            }
        }

        if let Some(next) = follow_up {
            self.request_fetch(next, true);
        } else if full_page {
            self.request_fetch(FetchMode::Incremental, true);
        }
    }

    fn on_fetched_older(&mut self, thread_id: ThreadId, requested: usize, result: Result<MessagePage, ApiError>) {
        let reply = self.older_reply.take();
        let Some(thread) = self.thread.as_mut().filter(|t| t.store.thread_id() == thread_id) else {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(0));
            }
            return;
        };
        thread.store.older_in_flight = false;
        let added = match result {
            Ok(page) => {
                let rows: Vec<Message> = page.messages.into_iter().map(|w| w.normalize(thread_id)).collect();
                let report = thread.store.apply_older_page(rows, requested, page.has_more);
                let exhausted = thread.store.history_exhausted;
                let added = report.inserted.len();
                self.after_merge(report);
                if exhausted {
                    self.emit(StoreChange::HistoryExhausted { thread_id });
                }
                added
            }
            Err(err) => {
                warn!("[SYNC] Loading older history failed: {}", err);
                0
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(Ok(added));
        }
    }

    fn on_task_done(&mut self, task_id: Uuid, thread_id: ThreadId, temp_id: Option<LocalId>, success: TaskSuccess) {
        match success {
            TaskSuccess::Sent(wire) => {
                self.outbox.complete(task_id);
                let row = wire.normalize(thread_id);
                info!("[OUTBOX] Send confirmed as {}", row.id);
                self.confirm_row(thread_id, temp_id, row);
            }
            TaskSuccess::Initialized(init) => {
                let server_id = init.message.id;
                let row = init.message.normalize(thread_id);
                debug!("[OUTBOX] Attachment placeholder {} created", server_id);
                self.confirm_row(thread_id, temp_id, row);
                self.update_row(thread_id, MessageId::Server(server_id), |m| {
                    m.status = MessageStatus::Sending;
                    m.local.upload_progress = Some(0);
                });
                self.outbox
                    .advance_stage(task_id, AttachmentStage::Upload { server_id, target: init.target });
            }
            TaskSuccess::Uploaded { server_id, file_url } => {
                self.update_row(thread_id, MessageId::Server(server_id), |m| m.local.upload_progress = Some(100));
                self.outbox.advance_stage(task_id, AttachmentStage::Finalize { server_id, file_url });
            }
            TaskSuccess::Finalized { server_id, row, file_url, meta } => {
                self.outbox.complete(task_id);
                info!("[OUTBOX] Attachment {} finalized", server_id);
                let id = MessageId::Server(server_id);
                self.update_row(thread_id, id, |m| {
                    m.attachment_url = Some(file_url);
                    m.attachment_meta = Some(meta);
                    m.local.upload_progress = None;
                    m.status = m.status.advance(MessageStatus::Sent);
                });
                if let Some(wire) = row {
                    self.confirm_row(thread_id, None, wire.normalize(thread_id));
                }
            }
            TaskSuccess::Done => {
                self.outbox.complete(task_id);
            }
        }
        self.drain_outbox();
    }

    fn on_task_failed(&mut self, task_id: Uuid, thread_id: ThreadId, err: ApiError) {
        let class = classify(&err, self.transport.is_online());
        let Some(disposition) = self.outbox.record_failure(task_id, class, Instant::now()) else {
            trace!("[OUTBOX] Failure for finished task {} ignored", task_id);
            return;
        };
        let Some(task) = self.outbox.get(task_id).cloned() else {
            return;
        };
        warn!("[OUTBOX] {:?} task attempt {} failed ({}): {:?}", task.kind, task.attempt_count, err, disposition);

        match disposition {
            Disposition::Retry { .. } | Disposition::Parked => {
                if let Some(id) = task.message_id() {
                    self.set_status(id, MessageStatus::Queued);
                }
            }
            Disposition::Failed => match &task.payload {
                TaskPayload::Text { .. } | TaskPayload::Attachment { .. } => {
                    if let Some(id) = task.message_id() {
                        self.set_status(id, MessageStatus::Failed);
                    }
                }
                TaskPayload::Reaction { message_id, emoji, was_reacted, .. } => {
                    self.outbox.complete(task_id);
                    let id = MessageId::Server(*message_id);
                    let (emoji, was_reacted) = (emoji.clone(), *was_reacted);
                    self.update_row(thread_id, id, |m| {
                        if m.has_reacted(&emoji) != was_reacted {
                            apply_own_reaction(m, &emoji, was_reacted);
                        }
                    });
                }
                TaskPayload::Delete { message_id, previous } => {
                    self.outbox.complete(task_id);
                    let restored = (**previous).clone();
                    self.update_row(thread_id, MessageId::Server(*message_id), |m| {
                        // A server-side delete that arrived meanwhile wins.
                        if !m.deleted || restored.deleted {
                            return;
                        }
                        let mut row = restored;
                        row.status = row.status.advance(m.status);
                        *m = row;
                    });
                }
                TaskPayload::Receipt { .. } => {
                    self.outbox.complete(task_id);
                }
            },
        }
        self.drain_outbox();
    }

    // ---- realtime -------------------------------------------------------

    fn handle_event(&mut self, envelope: RealtimeEnvelope) {
        let Some(thread) = self.thread.as_mut() else {
            trace!("[ROUTER] No open thread; dropping {}", envelope.event.kind());
            return;
        };
        let outcome = thread.router.route(envelope, &mut thread.store, &mut self.outbox, Utc::now());
        let RouteOutcome::Applied { change, hint, completed, typing } = outcome else {
            return;
        };
        if let Some(task) = completed {
            debug!("[OUTBOX] Task {} finished by echo", task.task_id);
        }
        match change {
            Some(StoreChange::Merged { report, .. }) => self.after_merge(report),
            Some(StoreChange::Updated { ids, .. }) => self.touched(ids, true),
            Some(other) => self.emit(other),
            None => {}
        }
        let now = Instant::now();
        if typing {
            self.typing_clear_at = Some(now + self.config.typing_clear);
        }
        match hint {
            ReconcileHint::None => {}
            ReconcileHint::Nudge => {
                if self.active {
                    self.reconcile.nudge(now);
                }
            }
            ReconcileHint::DeltaFetch { after_id } => {
                debug!("[ROUTER] Tail moved past {:?}; fetching delta", after_id);
                self.request_fetch(FetchMode::Incremental, true);
            }
        }
        self.drain_outbox();
    }

    fn on_health(&mut self, health: ChannelHealth) {
        match self.poller.observe(&health, Instant::now()) {
            HealthTransition::Degraded => {
                warn!("[SYNC] Realtime channel degraded ({:?}); polling", health);
            }
            HealthTransition::Recovered => {
                info!("[SYNC] Realtime channel recovered; catching up");
                self.request_fetch(FetchMode::Incremental, true);
            }
            HealthTransition::Unchanged => {}
        }
    }

    fn on_online(&mut self, online: bool) {
        if !online {
            return;
        }
        let replayed = self.outbox.replay();
        if replayed > 0 {
            info!("[OUTBOX] Back online; replaying {} queued tasks", replayed);
        }
        let mode = self.refetch_on_reconnect.take().or(self.fetch_retry.take().map(|(_, m)| m));
        self.request_fetch(mode.unwrap_or(FetchMode::Incremental), true);
        self.drain_outbox();
    }

    fn on_timers(&mut self) {
        let now = Instant::now();
        if self.reconcile.take_due(now) {
            trace!("[SYNC] Reconcile timer fired");
            self.request_fetch(FetchMode::Incremental, false);
        }
        if self.poller.take_due(now) {
            trace!("[SYNC] Degraded poll");
            self.request_fetch(FetchMode::Incremental, false);
        }
        if let Some((at, mode)) = self.fetch_retry {
            if at <= now {
                self.fetch_retry = None;
                self.request_fetch(mode, true);
            }
        }
        if self.typing_clear_at.map_or(false, |at| at <= now) {
            self.typing_clear_at = None;
            if let Some(thread) = self.thread.as_mut() {
                let thread_id = thread.store.thread_id();
                thread.store.participants.typing.clear();
                self.registry.update_summary(thread_id, |s| s.typing = false);
                self.emit(StoreChange::Participants { thread_id });
            }
        }
        let intents = self.reactions.due(now);
        self.enqueue_reactions(intents);
        self.drain_outbox();
    }

    // ---- outbox plumbing ------------------------------------------------

    fn flush_reactions(&mut self) {
        let intents = self.reactions.due(Instant::now() + self.config.reaction_debounce);
        self.enqueue_reactions(intents);
    }

    fn enqueue_reactions(&mut self, intents: Vec<ReactionIntent>) {
        let Some(thread_id) = self.thread.as_ref().map(|t| t.store.thread_id()) else {
            return;
        };
        for intent in intents {
            debug!("[OUTBOX] Reaction {} on {} -> {}", intent.emoji, intent.message_id, intent.add);
            self.outbox.enqueue(OutboxTask::new(
                thread_id,
                None,
                TaskKind::Reaction,
                TaskPayload::Reaction {
                    message_id: intent.message_id,
                    emoji: intent.emoji,
                    add: intent.add,
                    was_reacted: intent.was_reacted,
                },
            ));
        }
    }

    fn drain_outbox(&mut self) {
        let started = self.outbox.start_ready(Instant::now(), self.transport.is_online());
        for task in started {
            if let Some(id) = task.message_id() {
                self.update_row(task.thread_id, id, |m| {
                    if m.status.is_pending() || m.status == MessageStatus::Failed {
                        m.status = MessageStatus::Sending;
                    }
                });
            }
            trace!("[OUTBOX] Starting {:?} task {} (attempt {})", task.kind, task.task_id, task.attempt_count);
            let api = self.api.clone();
            let tx = self.completions.clone();
            tokio::spawn(async move {
                let result = execute_task(api, &task, tx.clone()).await;
                let _ = tx.send(Completion::Task {
                    task_id: task.task_id,
                    thread_id: task.thread_id,
                    temp_id: task.temp_id,
                    result,
                });
            });
        }
    }

    // ---- store helpers --------------------------------------------------

    fn active_thread_id(&self) -> Result<ThreadId, SyncError> {
        self.thread.as_ref().map(|t| t.store.thread_id()).ok_or(SyncError::NoActiveThread)
    }

    fn store_for(&mut self, thread_id: ThreadId) -> Option<&mut MessageStore> {
        self.thread
            .as_mut()
            .filter(|t| t.store.thread_id() == thread_id)
            .map(|t| &mut t.store)
    }

    fn confirm_row(&mut self, thread_id: ThreadId, temp_id: Option<LocalId>, row: Message) {
        let Some(store) = self.store_for(thread_id) else {
            return;
        };
        let report = match temp_id {
            Some(local) => store.confirm_local(local, row),
            None => store.ingest_live(row),
        };
        self.after_merge(report);
    }

    fn update_row<F>(&mut self, thread_id: ThreadId, id: MessageId, f: F)
    where
        F: FnOnce(&mut Message),
    {
        let changed = match self.store_for(thread_id) {
            Some(store) => store.update(id, f),
            None => false,
        };
        if changed {
            self.touched(vec![id], true);
        }
    }

    fn set_status(&mut self, id: MessageId, status: MessageStatus) {
        let changed = self.thread.as_mut().map_or(false, |t| t.store.set_status(id, status));
        if changed {
            self.touched(vec![id], true);
        }
    }

    fn after_merge(&mut self, report: MergeReport) {
        if report.is_empty() {
            return;
        }
        let Some(thread) = self.thread.as_ref() else {
            return;
        };
        let thread_id = thread.store.thread_id();
        thread.router.refresh_summary(&thread.store);
        self.emit(StoreChange::Merged { thread_id, report });
        self.persist();
        self.schedule_receipt();
    }

    fn touched(&mut self, ids: Vec<MessageId>, persist: bool) {
        let Some(thread_id) = self.thread.as_ref().map(|t| t.store.thread_id()) else {
            return;
        };
        self.emit(StoreChange::Updated { thread_id, ids });
        if persist {
            self.persist();
        }
    }

    fn emit(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    fn persist(&self) {
        if let Some(thread) = &self.thread {
            let _ = self.cache_writer.send((thread.store.thread_id(), thread.store.messages()));
        }
    }

    /// Acknowledges delivery of the newest counterpart message.
    fn schedule_receipt(&mut self) {
        let Some(thread) = self.thread.as_ref() else {
            return;
        };
        let thread_id = thread.store.thread_id();
        let me = self.me.user_id;
        let newest = thread
            .store
            .iter()
            .filter(|m| m.sender_id != me && !m.is_delivered && m.message_type == MessageType::User)
            .filter_map(|m| m.id.server())
            .max();
        let Some(up_to_id) = newest else {
            return;
        };
        if self.delivered_up_to.get(&thread_id).map_or(false, |done| *done >= up_to_id) {
            return;
        }
        self.delivered_up_to.insert(thread_id, up_to_id);
        if !self.outbox.coalesce_receipt(thread_id, up_to_id) {
            self.outbox.enqueue(OutboxTask::new(
                thread_id,
                None,
                TaskKind::Delivered,
                TaskPayload::Receipt { up_to_id },
            ));
        }
        self.drain_outbox();
    }
}

fn merge_mode(pending: Option<FetchMode>, mode: FetchMode) -> FetchMode {
    match (pending, mode) {
        (Some(FetchMode::Initial), _) | (_, FetchMode::Initial) => FetchMode::Initial,
        _ => FetchMode::Incremental,
    }
}

fn apply_own_reaction(message: &mut Message, emoji: &str, add: bool) {
    let summary = message.reactions.get_or_insert_with(ReactionSummary::default);
    if add {
        summary.add(emoji, true);
    } else {
        summary.remove(emoji, true);
    }
}

/// Writes store snapshots in order, keeping only the newest per thread when
/// writes pile up.
fn spawn_cache_writer(cache: Arc<dyn MessageCache>) -> mpsc::UnboundedSender<(ThreadId, Vec<Message>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(ThreadId, Vec<Message>)>();
    tokio::spawn(async move {
        while let Some((thread_id, rows)) = rx.recv().await {
            let mut latest = HashMap::new();
            latest.insert(thread_id, rows);
            while let Ok((thread_id, rows)) = rx.try_recv() {
                latest.insert(thread_id, rows);
            }
            for (thread_id, rows) in latest {
                if let Err(e) = cache.store(thread_id, &rows).await {
                    warn!("[CACHE] Write for thread {} failed: {}", thread_id, e);
                }
            }
        }
    });
    tx
}

async fn execute_task(
    api: Arc<dyn MessageApi>,
    task: &OutboxTask,
    completions: mpsc::UnboundedSender<Completion>,
) -> Result<TaskSuccess, ApiError> {
    let thread_id = task.thread_id;
    match &task.payload {
        TaskPayload::Text { content, reply_to } => {
            let request = SendMessageRequest {
                content: content.clone(),
                message_type: MessageType::User,
                reply_to_message_id: *reply_to,
                client_request_id: task.client_request_id.clone(),
            };
            api.send_message(thread_id, &request).await.map(TaskSuccess::Sent)
        }
        TaskPayload::Attachment { upload, kind, stage } => match stage {
            AttachmentStage::Init => {
                let request = AttachmentInitRequest {
                    kind: *kind,
                    filename: upload.filename.clone(),
                    content_type: upload.content_type.clone(),
                    size: upload.bytes.len() as u64,
                    caption: upload.caption.clone(),
                    client_request_id: task.client_request_id.clone(),
                };
                api.init_attachment(thread_id, &request).await.map(TaskSuccess::Initialized)
            }
            AttachmentStage::Upload { server_id, target } => {
                let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
                let id = MessageId::Server(*server_id);
                tokio::spawn(async move {
                    while let Some(percent) = progress_rx.recv().await {
                        let _ = completions.send(Completion::Progress { thread_id, id, percent });
                    }
                });
                api.upload_attachment(target, upload, progress_tx).await?;
                Ok(TaskSuccess::Uploaded { server_id: *server_id, file_url: target.file_url.clone() })
            }
            AttachmentStage::Finalize { server_id, file_url } => {
                let request = AttachmentFinalizeRequest { attachment_url: file_url.clone(), attachment_meta: upload.meta() };
                let row = match api.finalize_attachment(*server_id, &request).await {
                    Ok(row) => Some(row),
                    // Already finalized by an earlier attempt.
                    Err(e) if e.status() == Some(409) => None,
                    Err(e) => return Err(e),
                };
                Ok(TaskSuccess::Finalized {
                    server_id: *server_id,
                    row,
                    file_url: file_url.clone(),
                    meta: upload.meta(),
                })
            }
        },
        TaskPayload::Reaction { message_id, emoji, add, .. } => {
            if *add {
                api.add_reaction(*message_id, emoji).await?;
            } else {
                api.remove_reaction(*message_id, emoji).await?;
            }
            Ok(TaskSuccess::Done)
        }
        TaskPayload::Delete { message_id, .. } => {
            api.delete_message(*message_id).await?;
            Ok(TaskSuccess::Done)
        }
        TaskPayload::Receipt { up_to_id } => {
            api.mark_delivered(thread_id, *up_to_id).await?;
            Ok(TaskSuccess::Done)
        }
    }
}
