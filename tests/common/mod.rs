#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use booking_chat::client::config::SyncConfig;
use booking_chat::client::services::api::MessageApi;
use booking_chat::client::services::cache::MemoryMessageCache;
use booking_chat::client::services::realtime::{ChannelHealth, RealtimeChannel};
use booking_chat::client::services::registry::SessionRegistry;
use booking_chat::client::services::transport::TransportMonitor;
use booking_chat::client::services::{SyncDeps, ThreadSnapshot, ThreadSync, ThreadSyncHandle};
use booking_chat::common::error::{ApiError, RealtimeError};
use booking_chat::common::models::*;
use booking_chat::common::protocol::*;

pub const ME: UserId = 1;
pub const PROVIDER: UserId = 2;

pub fn counterpart_row(id: i64, thread_id: ThreadId, content: &str) -> WireMessage {
    WireMessage {
        id,
        thread_id: Some(thread_id),
        sender_id: Some(PROVIDER),
        sender_type: Some(SenderType::Provider),
        content: Some(content.to_string()),
        timestamp: Some(format!("2024-05-01T10:{:02}:{:02}Z", (id / 60) % 60, id % 60)),
        ..Default::default()
    }
}

#[derive(Default)]
struct ApiState {
    threads: HashMap<ThreadId, Vec<WireMessage>>,
    missing: HashSet<ThreadId>,
    next_id: i64,
    by_request: HashMap<String, i64>,
    list_calls: usize,
    last_query: Option<ListQuery>,
    send_calls: usize,
    lose_send_responses: u32,
    reactions: Vec<(i64, String, bool)>,
    deletes: Vec<i64>,
    reject_deletes: bool,
    delivered: Vec<(ThreadId, i64)>,
    init_calls: usize,
    uploads: usize,
    finalizes: usize,
    list_failures: VecDeque<ApiError>,
    send_failures: VecDeque<ApiError>,
    init_failures: VecDeque<ApiError>,
    upload_failures: VecDeque<ApiError>,
}

/// In-process stand-in for the booking REST API.
pub struct MockApi {
    state: Mutex<ApiState>,
    list_delays: Mutex<HashMap<ThreadId, Duration>>,
    send_delay: Mutex<Duration>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ApiState { next_id: 1000, ..Default::default() }),
            list_delays: Mutex::new(HashMap::new()),
            send_delay: Mutex::new(Duration::ZERO),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap()
    }

    pub fn seed(&self, thread_id: ThreadId, rows: Vec<WireMessage>) {
        let mut state = self.lock();
        if let Some(max) = rows.iter().map(|r| r.id).max() {
            state.next_id = state.next_id.max(max + 1);
        }
        state.threads.entry(thread_id).or_default().extend(rows);
    }

    pub fn mark_missing(&self, thread_id: ThreadId) {
        self.lock().missing.insert(thread_id);
    }

    pub fn set_list_delay(&self, thread_id: ThreadId, delay: Duration) {
        self.list_delays.lock().unwrap().insert(thread_id, delay);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    /// Commits the next `n` sends but fails their responses.
    pub fn lose_send_responses(&self, n: u32) {
        self.lock().lose_send_responses = n;
    }

    /// The next list calls fail with these errors, in order.
    pub fn fail_lists(&self, errors: Vec<ApiError>) {
        self.lock().list_failures.extend(errors);
    }

    /// The next sends fail before anything is committed.
    pub fn fail_sends(&self, errors: Vec<ApiError>) {
        self.lock().send_failures.extend(errors);
    }

    pub fn fail_inits(&self, errors: Vec<ApiError>) {
        self.lock().init_failures.extend(errors);
    }

    pub fn fail_uploads(&self, errors: Vec<ApiError>) {
        self.lock().upload_failures.extend(errors);
    }

    pub fn reject_deletes(&self) {
        self.lock().reject_deletes = true;
    }

    pub fn rows(&self, thread_id: ThreadId) -> Vec<WireMessage> {
        self.lock().threads.get(&thread_id).cloned().unwrap_or_default()
    }

    pub fn row_for_request(&self, thread_id: ThreadId, client_request_id: &str) -> Option<WireMessage> {
        self.rows(thread_id)
            .into_iter()
            .find(|r| r.client_request_id.as_deref() == Some(client_request_id))
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn last_query(&self) -> Option<ListQuery> {
        self.lock().last_query.clone()
    }

    pub fn send_calls(&self) -> usize {
        self.lock().send_calls
    }

    pub fn reactions(&self) -> Vec<(i64, String, bool)> {
        self.lock().reactions.clone()
    }

    pub fn deletes(&self) -> Vec<i64> {
        self.lock().deletes.clone()
    }

    pub fn delivered(&self) -> Vec<(ThreadId, i64)> {
        self.lock().delivered.clone()
    }

    pub fn init_calls(&self) -> usize {
        self.lock().init_calls
    }

    pub fn uploads(&self) -> usize {
        self.lock().uploads
    }

    pub fn finalizes(&self) -> usize {
        self.lock().finalizes
    }

    fn commit(&self, thread_id: ThreadId, client_request_id: &str, content: &str) -> WireMessage {
        let mut state = self.lock();
        if let Some(existing) = state.by_request.get(client_request_id).copied() {
            if let Some(row) = state.threads.get(&thread_id).and_then(|rows| rows.iter().find(|r| r.id == existing)) {
                return row.clone();
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        let row = WireMessage {
            id,
            thread_id: Some(thread_id),
            sender_id: Some(ME),
            sender_type: Some(SenderType::Client),
            content: Some(content.to_string()),
            timestamp: Some(Utc::now().to_rfc3339()),
            client_request_id: Some(client_request_id.to_string()),
            ..Default::default()
        };
        state.by_request.insert(client_request_id.to_string(), id);
        state.threads.entry(thread_id).or_default().push(row.clone());
        row
    }
}

#[async_trait]
impl MessageApi for MockApi {
    async fn list_messages(&self, thread_id: ThreadId, query: &ListQuery) -> Result<MessagePage, ApiError> {
        let delay = self.list_delays.lock().unwrap().get(&thread_id).copied();
        {
            let mut state = self.lock();
            state.list_calls += 1;
            state.last_query = Some(query.clone());
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        if state.missing.contains(&thread_id) {
            return Err(ApiError::NotFound);
        }
        let mut rows = state.threads.get(&thread_id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.id);
        let page: Vec<WireMessage> = if let Some(after) = query.after_id {
            rows.into_iter().filter(|r| r.id > after).take(query.limit).collect()
        } else {
            let rows: Vec<_> = match query.before_id {
                Some(before) => rows.into_iter().filter(|r| r.id < before).collect(),
                None => rows,
            };
            let skip = rows.len().saturating_sub(query.limit);
            rows.into_iter().skip(skip).collect()
        };
        Ok(MessagePage { messages: page, has_more: None })
    }

    async fn send_message(&self, thread_id: ThreadId, request: &SendMessageRequest) -> Result<WireMessage, ApiError> {
        let delay = *self.send_delay.lock().unwrap();
        {
            let mut state = self.lock();
            state.send_calls += 1;
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }
        }
        let row = self.commit(thread_id, &request.client_request_id, &request.content);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.lose_send_responses > 0 {
            state.lose_send_responses -= 1;
            return Err(ApiError::Network("connection reset".to_string()));
        }
        Ok(row)
    }

    async fn add_reaction(&self, message_id: i64, emoji: &str) -> Result<(), ApiError> {
        self.lock().reactions.push((message_id, emoji.to_string(), true));
        Ok(())
    }

    async fn remove_reaction(&self, message_id: i64, emoji: &str) -> Result<(), ApiError> {
        self.lock().reactions.push((message_id, emoji.to_string(), false));
        Ok(())
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), ApiError> {
        let reject = {
            let mut state = self.lock();
            state.deletes.push(message_id);
            state.reject_deletes
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        if reject {
            return Err(ApiError::Status { status: 400, message: "too old to delete".to_string() });
        }
        Ok(())
    }

    async fn mark_delivered(&self, thread_id: ThreadId, up_to_id: i64) -> Result<(), ApiError> {
        self.lock().delivered.push((thread_id, up_to_id));
        Ok(())
    }

    async fn init_attachment(&self, thread_id: ThreadId, request: &AttachmentInitRequest) -> Result<AttachmentInit, ApiError> {
        {
            let mut state = self.lock();
            state.init_calls += 1;
            if let Some(err) = state.init_failures.pop_front() {
                return Err(err);
            }
        }
        let message = self.commit(thread_id, &request.client_request_id, &request.caption);
        Ok(AttachmentInit {
            target: UploadTarget {
                upload_url: format!("https://storage.test/upload/{}", message.id),
                headers: HashMap::new(),
                file_url: format!("https://files.test/{}/{}", message.id, request.filename),
            },
            message,
        })
    }

    async fn upload_attachment(
        &self,
        _target: &UploadTarget,
        _upload: &AttachmentUpload,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<(), ApiError> {
        if let Some(err) = self.lock().upload_failures.pop_front() {
            return Err(err);
        }
        let _ = progress.send(50);
        let _ = progress.send(100);
        self.lock().uploads += 1;
        Ok(())
    }

    async fn finalize_attachment(&self, message_id: i64, request: &AttachmentFinalizeRequest) -> Result<WireMessage, ApiError> {
        let mut state = self.lock();
        state.finalizes += 1;
        let row = state
            .threads
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|r| r.id == message_id)
            .ok_or(ApiError::NotFound)?;
        row.attachment_url = Some(request.attachment_url.clone());
        row.attachment_meta = Some(request.attachment_meta.clone());
        Ok(row.clone())
    }
}

/// Records the frames the engine would push over the socket.
#[derive(Default)]
pub struct MockChannel {
    log: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    async fn subscribe(&self, topic: &str) -> Result<(), RealtimeError> {
        self.record(format!("subscribe {}", topic));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RealtimeError> {
        self.record(format!("unsubscribe {}", topic));
        Ok(())
    }

    async fn send_typing(&self, topic: &str) -> Result<(), RealtimeError> {
        self.record(format!("typing {}", topic));
        Ok(())
    }
}

pub struct Harness {
    pub handle: ThreadSyncHandle,
    pub api: Arc<MockApi>,
    pub channel: Arc<MockChannel>,
    pub cache: Arc<MemoryMessageCache>,
    pub transport: TransportMonitor,
    pub events: mpsc::Sender<RealtimeEnvelope>,
    pub health: watch::Sender<ChannelHealth>,
}

pub fn test_config() -> SyncConfig {
    SyncConfig { user_id: ME, sender_type: SenderType::Client, ..SyncConfig::default() }
}

impl Harness {
    pub fn start(api: MockApi) -> Self {
        Self::start_with_cache(api, MemoryMessageCache::new())
    }

    pub fn start_with_cache(api: MockApi, cache: MemoryMessageCache) -> Self {
        let api = Arc::new(api);
        let channel = Arc::new(MockChannel::default());
        let cache = Arc::new(cache);
        let transport = TransportMonitor::new(true);
        let (events, events_rx) = mpsc::channel(64);
        let (health, health_rx) = watch::channel(ChannelHealth::connected());
        let deps = SyncDeps {
            config: test_config(),
            api: api.clone(),
            channel: channel.clone(),
            cache: cache.clone(),
            registry: Arc::new(SessionRegistry::default()),
            transport: transport.clone(),
        };
        let handle = ThreadSync::spawn(deps, events_rx, health_rx);
        Self { handle, api, channel, cache, transport, events, health }
    }

    pub async fn push(&self, thread_id: ThreadId, event: RealtimeEvent) {
        self.events.send(RealtimeEnvelope::for_thread(thread_id, event)).await.unwrap();
    }

    pub async fn snapshot(&self) -> ThreadSnapshot {
        self.handle.snapshot().await.unwrap().expect("a thread is open")
    }

    /// Polls the open thread until `check` holds, advancing paused time.
    pub async fn eventually<F>(&self, what: &str, check: F) -> ThreadSnapshot
    where
        F: Fn(&ThreadSnapshot) -> bool,
    {
        for _ in 0..1000 {
            let snapshot = self.snapshot().await;
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}: {:#?}", what, self.snapshot().await);
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn local_rows(snapshot: &ThreadSnapshot) -> usize {
    snapshot.messages.iter().filter(|m| m.id.is_local()).count()
}
