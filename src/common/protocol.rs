use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::models::*;

/// Topic name the realtime channel uses for a thread.
pub fn thread_topic(thread_id: ThreadId) -> String {
    format!("thread:{}", thread_id)
}

/// Parses `thread:<id>` back into a thread id.
pub fn topic_thread(topic: &str) -> Option<ThreadId> {
    topic.strip_prefix("thread:").and_then(|id| id.parse().ok())
}

/// Event pushed by the realtime channel, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Message {
        #[serde(default)]
        event_id: Option<String>,
        message: WireMessage,
        #[serde(default)]
        client_request_id: Option<String>,
    },
    Read {
        up_to_id: i64,
        reader_id: UserId,
    },
    Delivered {
        up_to_id: i64,
        recipient_id: UserId,
    },
    Typing {
        #[serde(default)]
        users: Vec<UserId>,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
    ReactionAdded {
        #[serde(default)]
        event_id: Option<String>,
        message_id: i64,
        emoji: String,
        user_id: UserId,
    },
    ReactionRemoved {
        #[serde(default)]
        event_id: Option<String>,
        message_id: i64,
        emoji: String,
        user_id: UserId,
    },
    MessageDeleted {
        #[serde(default)]
        event_id: Option<String>,
        message_id: i64,
    },
    ThreadTail {
        last_id: i64,
        #[serde(default)]
        last_timestamp: Option<String>,
        #[serde(default)]
        snippet: Option<String>,
    },
}

impl RealtimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::Message { .. } => "message",
            RealtimeEvent::Read { .. } => "read",
            RealtimeEvent::Delivered { .. } => "delivered",
            RealtimeEvent::Typing { .. } => "typing",
            RealtimeEvent::Presence { .. } => "presence",
            RealtimeEvent::ReactionAdded { .. } => "reaction_added",
            RealtimeEvent::ReactionRemoved { .. } => "reaction_removed",
            RealtimeEvent::MessageDeleted { .. } => "message_deleted",
            RealtimeEvent::ThreadTail { .. } => "thread_tail",
        }
    }
}

/// Server → client frame: a topic plus the flattened event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEnvelope {
    pub topic: String,
    #[serde(flatten)]
    pub event: RealtimeEvent,
}

impl RealtimeEnvelope {
    pub fn for_thread(thread_id: ThreadId, event: RealtimeEvent) -> Self {
        Self { topic: thread_topic(thread_id), event }
    }
}

/// Client → server frame on the realtime socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Typing { topic: String },
}

/// Acknowledgement the server sends after `auth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub success: bool,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Initial,
    Incremental,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Initial => "initial",
            FetchMode::Incremental => "incremental",
        }
    }
}

/// Query for the list-history endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub mode: FetchMode,
    pub limit: usize,
    pub before_id: Option<i64>,
    pub after_id: Option<i64>,
    pub fields: Option<Vec<String>>,
}

impl ListQuery {
    pub fn latest(mode: FetchMode, limit: usize) -> Self {
        Self { mode, limit, before_id: None, after_id: None, fields: None }
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("mode".to_string(), self.mode.as_str().to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(before) = self.before_id {
            pairs.push(("before_id".to_string(), before.to_string()));
        }
        if let Some(after) = self.after_id {
            pairs.push(("after_id".to_string(), after.to_string()));
        }
        if let Some(fields) = &self.fields {
            pairs.push(("fields".to_string(), fields.join(",")));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub has_more: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_message_id: Option<i64>,
    pub client_request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    File,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInitRequest {
    pub kind: AttachmentKind,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub caption: String,
    pub client_request_id: String,
}

/// Where the bytes of an attachment have to be uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTarget {
    pub upload_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// URL the file is served from once the upload completes.
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInit {
    pub message: WireMessage,
    pub target: UploadTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentFinalizeRequest {
    pub attachment_url: String,
    pub attachment_meta: AttachmentMeta,
}
