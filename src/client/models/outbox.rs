use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::client::services::transport::{Backoff, ErrorClass, RetryPolicy};
use crate::common::models::*;
use crate::common::protocol::{AttachmentKind, UploadTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Text,
    Voice,
    File,
    Reaction,
    Delivered,
    Delete,
}

/// Independent drain queues; each runs at most one task at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Messages,
    Mutations,
}

const MESSAGE_BACKOFF: Backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
const MUTATION_BACKOFF: Backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(15));

impl TaskKind {
    pub fn policy(self) -> RetryPolicy {
        match self {
            TaskKind::Text | TaskKind::Voice => RetryPolicy::unbounded(MESSAGE_BACKOFF),
            TaskKind::File => RetryPolicy::bounded(3, MESSAGE_BACKOFF),
            TaskKind::Reaction | TaskKind::Delivered | TaskKind::Delete => RetryPolicy::bounded(5, MUTATION_BACKOFF),
        }
    }

    pub fn lane(self) -> Lane {
        match self {
            TaskKind::Text | TaskKind::Voice | TaskKind::File => Lane::Messages,
            TaskKind::Reaction | TaskKind::Delivered | TaskKind::Delete => Lane::Mutations,
        }
    }

    pub fn for_attachment(kind: AttachmentKind) -> Self {
        match kind {
            AttachmentKind::File => TaskKind::File,
            AttachmentKind::Voice => TaskKind::Voice,
        }
    }

    /// Whether a rejected request parks the task instead of failing it.
    fn requeues_on_hard_error(self) -> bool {
        matches!(self, TaskKind::Text | TaskKind::Voice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    InFlight,
    Failed,
}

/// Where an attachment send stands; each phase retries on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentStage {
    Init,
    Upload { server_id: i64, target: UploadTarget },
    Finalize { server_id: i64, file_url: String },
}

#[derive(Debug, Clone)]
pub enum TaskPayload {
    Text {
        content: String,
        reply_to: Option<i64>,
    },
    Attachment {
        upload: AttachmentUpload,
        kind: AttachmentKind,
        stage: AttachmentStage,
    },
    Reaction {
        message_id: i64,
        emoji: String,
        add: bool,
        /// Whether the user had reacted before the optimistic update.
        was_reacted: bool,
    },
    Delete {
        message_id: i64,
        previous: Box<Message>,
    },
    Receipt {
        up_to_id: i64,
    },
}

#[derive(Debug, Clone)]
pub struct OutboxTask {
    pub task_id: Uuid,
    pub thread_id: ThreadId,
    pub temp_id: Option<LocalId>,
    pub kind: TaskKind,
    pub attempt_count: u32,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub next_attempt_at: Option<Instant>,
    pub client_request_id: String,
}

impl OutboxTask {
    pub fn new(thread_id: ThreadId, temp_id: Option<LocalId>, kind: TaskKind, payload: TaskPayload) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            thread_id,
            temp_id,
            kind,
            attempt_count: 0,
            payload,
            status: TaskStatus::Queued,
            next_attempt_at: None,
            client_request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Row this task drives; attachments move to their server id after init.
    pub fn message_id(&self) -> Option<MessageId> {
        match &self.payload {
            TaskPayload::Attachment { stage: AttachmentStage::Upload { server_id, .. }, .. }
            | TaskPayload::Attachment { stage: AttachmentStage::Finalize { server_id, .. }, .. } => {
                Some(MessageId::Server(*server_id))
            }
            TaskPayload::Text { .. } | TaskPayload::Attachment { .. } => self.temp_id.map(MessageId::Local),
            _ => None,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.status == TaskStatus::Queued && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { at: Instant },
    /// Waits for the next offline → online transition.
    Parked,
    Failed,
}

/// Correlated, laned send queue.
#[derive(Debug, Default)]
pub struct Outbox {
    tasks: VecDeque<OutboxTask>,
    correlation: HashMap<String, LocalId>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: OutboxTask) -> Uuid {
        if let Some(local) = task.temp_id {
            self.correlation.insert(task.client_request_id.clone(), local);
        }
        let id = task.task_id;
        self.tasks.push_back(task);
        id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_id: Uuid) -> Option<&OutboxTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn get_mut(&mut self, task_id: Uuid) -> Option<&mut OutboxTask> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &OutboxTask> {
        self.tasks.iter()
    }

    pub fn task_for_message(&self, id: MessageId) -> Option<&OutboxTask> {
        self.tasks.iter().find(|t| t.message_id() == Some(id))
    }

    pub fn local_for_request(&self, client_request_id: &str) -> Option<LocalId> {
        self.correlation.get(client_request_id).copied()
    }

    /// Claims the head of every lane that is due. Failed tasks never block a
    /// lane; an in-flight head does.
    pub fn start_ready(&mut self, now: Instant, online: bool) -> Vec<OutboxTask> {
        if !online {
            return Vec::new();
        }
        let mut started = Vec::new();
        for lane in [Lane::Messages, Lane::Mutations] {
            let head = self
                .tasks
                .iter_mut()
                .find(|t| t.kind.lane() == lane && t.status != TaskStatus::Failed);
            if let Some(task) = head {
                if task.is_ready(now) {
                    task.status = TaskStatus::InFlight;
                    task.attempt_count += 1;
                    task.next_attempt_at = None;
                    started.push(task.clone());
                }
            }
        }
        started
    }

    /// Removes a finished task and forgets its correlation key.
    pub fn complete(&mut self, task_id: Uuid) -> Option<OutboxTask> {
        let idx = self.tasks.iter().position(|t| t.task_id == task_id)?;
        let task = self.tasks.remove(idx)?;
        self.correlation.remove(&task.client_request_id);
        Some(task)
    }

    /// Records a failed attempt and decides what happens next.
    pub fn record_failure(&mut self, task_id: Uuid, class: ErrorClass, now: Instant) -> Option<Disposition> {
        let task = self.get_mut(task_id)?;
        let policy = task.kind.policy();
        let disposition = match class {
            ErrorClass::Offline => {
                task.attempt_count = task.attempt_count.saturating_sub(1);
                Disposition::Parked
            }
            ErrorClass::HardClient | ErrorClass::NotFound if task.kind.requeues_on_hard_error() => {
                Disposition::Retry { at: now + policy.backoff.delay(task.attempt_count) }
            }
            ErrorClass::HardClient | ErrorClass::NotFound => Disposition::Failed,
            ErrorClass::Transient | ErrorClass::Forbidden if policy.exhausted(task.attempt_count) => {
                Disposition::Failed
            }
            ErrorClass::Transient | ErrorClass::Forbidden => {
                Disposition::Retry { at: now + policy.backoff.delay(task.attempt_count) }
            }
        };
        match disposition {
            Disposition::Retry { at } => {
                task.status = TaskStatus::Queued;
                task.next_attempt_at = Some(at);
            }
            Disposition::Parked => {
                task.status = TaskStatus::Queued;
                task.next_attempt_at = None;
            }
            Disposition::Failed => task.status = TaskStatus::Failed,
        }
        Some(disposition)
    }

    /// Moves a task to its next attachment phase without counting an attempt.
    pub fn advance_stage(&mut self, task_id: Uuid, next: AttachmentStage) -> bool {
        match self.get_mut(task_id) {
            Some(task) => {
                if let TaskPayload::Attachment { stage, .. } = &mut task.payload {
                    *stage = next;
                }
                task.status = TaskStatus::Queued;
                task.attempt_count = 0;
                task.next_attempt_at = None;
                true
            }
            None => false,
        }
    }

    /// Re-arms a failed message send for the user's explicit retry.
    pub fn retry_failed(&mut self, id: MessageId) -> bool {
        match self
            .tasks
            .iter_mut()
            .find(|t| t.message_id() == Some(id) && t.status == TaskStatus::Failed)
        {
            Some(task) => {
                task.status = TaskStatus::Queued;
                task.attempt_count = 0;
                task.next_attempt_at = None;
                true
            }
            None => false,
        }
    }

    /// Makes every queued task due now; used on reconnect.
    pub fn replay(&mut self) -> usize {
        let mut count = 0;
        for task in self.tasks.iter_mut().filter(|t| t.status == TaskStatus::Queued) {
            task.next_attempt_at = None;
            count += 1;
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .filter_map(|t| t.next_attempt_at)
            .min()
    }

    /// Resolves an inbound echo. A pending text send carrying the same key is
    /// finished; attachment sends keep running their remaining phases.
    pub fn confirm_echo(&mut self, client_request_id: &str) -> Option<(LocalId, Option<OutboxTask>)> {
        let local = self.local_for_request(client_request_id)?;
        let text_task = self
            .tasks
            .iter()
            .find(|t| t.client_request_id == client_request_id && t.kind == TaskKind::Text)
            .map(|t| t.task_id);
        let finished = text_task.and_then(|id| self.complete(id));
        Some((local, finished))
    }

    /// Folds a new delivery receipt into a queued one for the same thread.
    pub fn coalesce_receipt(&mut self, thread_id: ThreadId, up_to_id: i64) -> bool {
        for task in self.tasks.iter_mut() {
            if task.thread_id != thread_id || task.status != TaskStatus::Queued {
                continue;
            }
            if let TaskPayload::Receipt { up_to_id: pending } = &mut task.payload {
                *pending = (*pending).max(up_to_id);
                return true;
            }
        }
        false
    }
}
