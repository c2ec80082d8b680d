use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type ThreadId = i64;
pub type UserId = i64;

/// Placeholder identity of a message that only exists on this device.
///
/// Allocated from a per-session counter and never reused once the message has
/// been confirmed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

/// Identity of a message row in a thread.
///
/// Serialized as a single integer: server ids stay positive and local
/// placeholders are written as negative numbers, which is what older caches and
/// the REST layer expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum MessageId {
    Local(LocalId),
    Server(i64),
}

impl MessageId {
    pub fn server(&self) -> Option<i64> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Local(_) => None,
        }
    }

    pub fn local(&self) -> Option<LocalId> {
        match self {
            MessageId::Local(id) => Some(*id),
            MessageId::Server(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    /// Tie-break rank: confirmed rows first, then placeholders in creation order.
    pub fn order_rank(&self) -> (u8, i64) {
        match self {
            MessageId::Server(id) => (0, *id),
            MessageId::Local(local) => (1, local.0 as i64),
        }
    }
}

impl From<i64> for MessageId {
    fn from(raw: i64) -> Self {
        if raw < 0 {
            MessageId::Local(LocalId(raw.unsigned_abs()))
        } else {
            MessageId::Server(raw)
        }
    }
}

impl From<MessageId> for i64 {
    fn from(id: MessageId) -> Self {
        match id {
            MessageId::Server(id) => id,
            MessageId::Local(local) => -(local.0 as i64),
        }
    }
}

impl From<LocalId> for MessageId {
    fn from(local: LocalId) -> Self {
        MessageId::Local(local)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(local) => write!(f, "{}", local),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    #[default]
    Client,
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    User,
    System,
}

/// Local delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sending,
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Failed => 0,
            MessageStatus::Queued => 1,
            MessageStatus::Sending => 2,
            MessageStatus::Sent => 3,
            MessageStatus::Delivered => 4,
            MessageStatus::Read => 5,
        }
    }

    /// The further-along of two statuses.
    pub fn advance(self, other: MessageStatus) -> MessageStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, MessageStatus::Queued | MessageStatus::Sending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttachmentMeta {
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub original_filename: Option<String>,
}

/// Reaction counts plus the emoji the current user has applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReactionSummary {
    pub counts: BTreeMap<String, u32>,
    pub mine: BTreeSet<String>,
}

impl ReactionSummary {
    pub fn count(&self, emoji: &str) -> u32 {
        self.counts.get(emoji).copied().unwrap_or(0)
    }

    pub fn add(&mut self, emoji: &str, by_me: bool) {
        *self.counts.entry(emoji.to_string()).or_insert(0) += 1;
        if by_me {
            self.mine.insert(emoji.to_string());
        }
    }

    pub fn remove(&mut self, emoji: &str, by_me: bool) {
        if let Some(count) = self.counts.get_mut(emoji) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(emoji);
            }
        }
        if by_me {
            self.mine.remove(emoji);
        }
    }
}

/// State only the local device knows about; server payloads never carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LocalState {
    pub upload_progress: Option<u8>,
    pub preview_url: Option<String>,
}

/// Identity and body fields the source payload actually carried. Sparse
/// server rows leave some out; everything built locally or read back from
/// the cache carries all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarriedFields {
    pub sender_id: bool,
    pub sender_type: bool,
    pub content: bool,
    pub message_type: bool,
}

impl Default for CarriedFields {
    fn default() -> Self {
        Self { sender_id: true, sender_type: true, content: true, message_type: true }
    }
}

impl CarriedFields {
    fn union(self, other: CarriedFields) -> Self {
        Self {
            sender_id: self.sender_id || other.sender_id,
            sender_type: self.sender_type || other.sender_type,
            content: self.content || other.content,
            message_type: self.message_type || other.message_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub sender_type: SenderType,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: Option<DateTime<Utc>>,
    pub attachment_url: Option<String>,
    pub attachment_meta: Option<AttachmentMeta>,
    pub reply_to_message_id: Option<i64>,
    pub reactions: Option<ReactionSummary>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub client_request_id: Option<String>,
    pub deleted: bool,
    pub system_key: Option<String>,
    pub quote_id: Option<i64>,
    #[serde(default)]
    pub local: LocalState,
    #[serde(skip)]
    pub carried: CarriedFields,
}

impl Message {
    /// Builds the optimistic row shown while a send is queued or in flight.
    pub fn local_placeholder(
        local_id: LocalId,
        thread_id: ThreadId,
        sender: &Participant,
        content: String,
        client_request_id: String,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: MessageId::Local(local_id),
            thread_id,
            sender_id: sender.user_id,
            sender_type: sender.sender_type,
            content,
            message_type: MessageType::User,
            timestamp: Some(Utc::now()),
            attachment_url: None,
            attachment_meta: None,
            reply_to_message_id: None,
            reactions: None,
            is_delivered: false,
            delivered_at: None,
            is_read: false,
            read_at: None,
            status,
            client_request_id: Some(client_request_id),
            deleted: false,
            system_key: None,
            quote_id: None,
            local: LocalState::default(),
            carried: CarriedFields::default(),
        }
    }

    /// Applies a newer view of the same message on top of this one.
    ///
    /// Fields the incoming payload leaves empty keep their current value,
    /// delivery/read flags and the tombstone only move forward, and local
    /// transient state survives unless the incoming row replaces it.
    pub fn overlay(&mut self, incoming: &Message) {
        self.thread_id = incoming.thread_id;
        if incoming.carried.sender_id {
            self.sender_id = incoming.sender_id;
        }
        if incoming.carried.sender_type {
            self.sender_type = incoming.sender_type;
        }
        if incoming.carried.message_type {
            self.message_type = incoming.message_type;
        }
        if incoming.carried.content {
            self.content = incoming.content.clone();
        }
        self.carried = self.carried.union(incoming.carried);
        self.timestamp = incoming.timestamp.or(self.timestamp);
        self.attachment_url = incoming.attachment_url.clone().or(self.attachment_url.take());
        self.attachment_meta = incoming.attachment_meta.clone().or(self.attachment_meta.take());
        self.reply_to_message_id = incoming.reply_to_message_id.or(self.reply_to_message_id);
        if incoming.reactions.is_some() {
            self.reactions = incoming.reactions.clone();
        }
        self.is_delivered |= incoming.is_delivered;
        self.delivered_at = self.delivered_at.or(incoming.delivered_at);
        self.is_read |= incoming.is_read;
        self.read_at = self.read_at.or(incoming.read_at);
        self.status = self.status.advance(incoming.status);
        self.client_request_id = self.client_request_id.take().or(incoming.client_request_id.clone());
        self.system_key = incoming.system_key.clone().or(self.system_key.take());
        self.quote_id = incoming.quote_id.or(self.quote_id);
        self.local.upload_progress = incoming.local.upload_progress.or(self.local.upload_progress);
        self.local.preview_url = incoming.local.preview_url.clone().or(self.local.preview_url.take());
        self.deleted |= incoming.deleted;
        if self.deleted {
            self.tombstone();
        }
    }

    /// Clears everything a deleted message must no longer show.
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.content.clear();
        self.attachment_url = None;
        self.attachment_meta = None;
        self.local.preview_url = None;
        self.local.upload_progress = None;
    }

    pub fn mark_delivered(&mut self, at: DateTime<Utc>) {
        if !self.is_delivered {
            self.is_delivered = true;
            self.delivered_at = Some(at);
        }
        self.status = self.status.advance(MessageStatus::Delivered);
    }

    pub fn mark_read(&mut self, at: DateTime<Utc>) {
        self.mark_delivered(at);
        if !self.is_read {
            self.is_read = true;
            self.read_at = Some(at);
        }
        self.status = self.status.advance(MessageStatus::Read);
    }

    pub fn has_reacted(&self, emoji: &str) -> bool {
        self.reactions.as_ref().map(|r| r.mine.contains(emoji)).unwrap_or(false)
    }

    /// Short text used for thread list previews and notifications.
    pub fn preview(&self) -> String {
        if self.deleted {
            return String::new();
        }
        if self.content.trim().is_empty() && self.attachment_url.is_some() {
            let name = self
                .attachment_meta
                .as_ref()
                .and_then(|m| m.original_filename.clone())
                .unwrap_or_else(|| "attachment".to_string());
            return format!("[{}]", name);
        }
        self.content.chars().take(80).collect()
    }
}

/// Who is talking in this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub sender_type: SenderType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    #[default]
    Offline,
}

/// Per-thread digest consumed by badges and the thread list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub last_message_id: Option<i64>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message_preview: String,
    pub unread_count: u32,
    pub typing: bool,
    pub presence: PresenceStatus,
}

/// File or voice note handed to the outbox for the two-phase upload.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub caption: String,
    pub preview_url: Option<String>,
}

impl AttachmentUpload {
    pub fn meta(&self) -> AttachmentMeta {
        AttachmentMeta {
            content_type: Some(self.content_type.clone()),
            size: Some(self.bytes.len() as u64),
            original_filename: Some(self.filename.clone()),
        }
    }
}

/// Message row as the REST API and realtime channel send it.
///
/// Every field except the id is optional so partial payloads (sparse field
/// selection, lightweight echoes) still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WireMessage {
    pub id: i64,
    pub thread_id: Option<ThreadId>,
    pub sender_id: Option<UserId>,
    pub sender_type: Option<SenderType>,
    pub content: Option<String>,
    pub message_type: Option<MessageType>,
    pub timestamp: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_meta: Option<AttachmentMeta>,
    pub reply_to_message_id: Option<i64>,
    pub reactions: Option<BTreeMap<String, u32>>,
    pub my_reactions: Option<Vec<String>>,
    pub is_delivered: Option<bool>,
    pub delivered_at: Option<String>,
    pub is_read: Option<bool>,
    pub read_at: Option<String>,
    pub client_request_id: Option<String>,
    pub is_deleted: Option<bool>,
    pub system_key: Option<String>,
    pub quote_id: Option<i64>,
}

impl WireMessage {
    /// Converts a server row into the store representation.
    pub fn normalize(self, fallback_thread: ThreadId) -> Message {
        let reactions = if self.reactions.is_some() || self.my_reactions.is_some() {
            Some(ReactionSummary {
                counts: self.reactions.unwrap_or_default(),
                mine: self.my_reactions.unwrap_or_default().into_iter().collect(),
            })
        } else {
            None
        };
        let is_delivered = self.is_delivered.unwrap_or(false);
        let is_read = self.is_read.unwrap_or(false);
        let status = if is_read {
            MessageStatus::Read
        } else if is_delivered {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        };
        let carried = CarriedFields {
            sender_id: self.sender_id.is_some(),
            sender_type: self.sender_type.is_some(),
            content: self.content.is_some(),
            message_type: self.message_type.is_some(),
        };
        let mut message = Message {
            id: MessageId::Server(self.id),
            thread_id: self.thread_id.unwrap_or(fallback_thread),
            sender_id: self.sender_id.unwrap_or_default(),
            sender_type: self.sender_type.unwrap_or_default(),
            content: self.content.unwrap_or_default(),
            message_type: self.message_type.unwrap_or_default(),
            timestamp: self.timestamp.as_deref().and_then(parse_timestamp),
            attachment_url: self.attachment_url,
            attachment_meta: self.attachment_meta,
            reply_to_message_id: self.reply_to_message_id,
            reactions,
            is_delivered,
            delivered_at: self.delivered_at.as_deref().and_then(parse_timestamp),
            is_read,
            read_at: self.read_at.as_deref().and_then(parse_timestamp),
            status,
            client_request_id: self.client_request_id,
            deleted: self.is_deleted.unwrap_or(false),
            system_key: self.system_key,
            quote_id: self.quote_id,
            local: LocalState::default(),
            carried,
        };
        if message.deleted {
            message.tombstone();
        }
        message
    }
}

/// Parses RFC 3339 strings or integer epoch milliseconds; anything else is
/// treated as a missing timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}
