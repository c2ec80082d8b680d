mod common;

use std::sync::Arc;
use std::time::Duration;

use booking_chat::client::models::store::StoreChange;
use booking_chat::client::services::cache::{MemoryMessageCache, MessageCache};
use booking_chat::client::services::realtime::{ChannelHealth, ChannelMode};
use booking_chat::client::services::{FetchOptions, FetchRequest};
use booking_chat::common::models::*;
use booking_chat::common::protocol::*;

use common::*;

const THREAD: ThreadId = 7;

fn seeded(rows: i64) -> MockApi {
    let api = MockApi::new();
    api.seed(THREAD, (1..=rows).map(|id| counterpart_row(id, THREAD, &format!("row {}", id))).collect());
    api
}

#[tokio::test(start_paused = true)]
async fn fetches_are_single_flight_with_one_follow_up() {
    let api = seeded(3);
    api.set_list_delay(THREAD, Duration::from_millis(200));
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();

    for _ in 0..3 {
        let request = h
            .handle
            .fetch_messages(FetchMode::Incremental, FetchOptions { force: true })
            .await
            .unwrap();
        assert_eq!(request, FetchRequest::Coalesced);
    }

    h.eventually("initial page", |s| s.initial_loaded && s.messages.len() == 3).await;
    h.eventually("follow-up done", |s| !s.fetch_in_flight).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.api.list_calls(), 2);
    assert_eq!(h.api.last_query().and_then(|q| q.after_id), Some(3));
}

#[tokio::test(start_paused = true)]
async fn background_thread_skips_unforced_fetch() {
    let h = Harness::start(seeded(1));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded && !s.fetch_in_flight).await;

    h.handle.set_active(false).unwrap();
    let request = h.handle.fetch_messages(FetchMode::Incremental, FetchOptions::default()).await.unwrap();
    assert_eq!(request, FetchRequest::Skipped);
}

#[tokio::test(start_paused = true)]
async fn lost_send_response_is_retried_without_duplicates() {
    let api = MockApi::new();
    api.lose_send_responses(1);
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();

    let local = h.handle.send_text("see you at 10", None).await.unwrap();
    let placeholder = h.snapshot().await;
    assert_eq!(placeholder.message(MessageId::Local(local)).map(|m| m.content.as_str()), Some("see you at 10"));

    let snapshot = h
        .eventually("confirmed send", |s| s.messages.iter().any(|m| !m.id.is_local() && m.status == MessageStatus::Sent))
        .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(local_rows(&snapshot), 0);
    assert_eq!(h.api.send_calls(), 2);
    assert_eq!(h.api.rows(THREAD).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn offline_sends_flush_in_order_on_reconnect() {
    let h = Harness::start(MockApi::new());
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    h.transport.set_online(false);
    for text in ["one", "two", "three"] {
        h.handle.send_text(text, None).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    let queued = h.snapshot().await;
    assert_eq!(local_rows(&queued), 3);
    assert!(queued.messages.iter().all(|m| m.status == MessageStatus::Queued));
    assert_eq!(h.api.send_calls(), 0);

    h.transport.set_online(true);
    let snapshot = h.eventually("all confirmed", |s| s.messages.len() == 3 && local_rows(s) == 0).await;
    let contents: Vec<_> = snapshot.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["one", "two", "three"]);
    let server: Vec<_> = h.api.rows(THREAD).iter().map(|r| r.content.clone().unwrap_or_default()).collect();
    assert_eq!(server, ["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn thread_tail_pulls_the_missing_delta() {
    let h = Harness::start(seeded(2));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 2 && !s.fetch_in_flight).await;

    h.api.seed(THREAD, vec![counterpart_row(3, THREAD, "missed")]);
    h.push(THREAD, RealtimeEvent::ThreadTail { last_id: 3, last_timestamp: None, snippet: Some("missed".into()) })
        .await;

    let snapshot = h.eventually("delta applied", |s| s.messages.len() == 3).await;
    assert_eq!(snapshot.messages[2].content, "missed");
    assert_eq!(h.api.last_query().and_then(|q| q.after_id), Some(2));
}

#[tokio::test(start_paused = true)]
async fn stale_tail_event_does_not_fetch() {
    let h = Harness::start(seeded(4));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 4 && !s.fetch_in_flight).await;
    let calls = h.api.list_calls();

    h.push(THREAD, RealtimeEvent::ThreadTail { last_id: 4, last_timestamp: None, snippet: None }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.api.list_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn rapid_reaction_toggles_send_one_request() {
    let h = Harness::start(seeded(1));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 1).await;
    let id = MessageId::Server(1);

    assert!(h.handle.toggle_reaction(id, "👍").await.unwrap());
    assert!(!h.handle.toggle_reaction(id, "👍").await.unwrap());
    assert!(h.handle.toggle_reaction(id, "👍").await.unwrap());
    assert!(h.snapshot().await.message(id).unwrap().has_reacted("👍"));
    assert!(h.api.reactions().is_empty());

    wait_until("reaction sent", || !h.api.reactions().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.api.reactions(), vec![(1, "👍".to_string(), true)]);
}

#[tokio::test(start_paused = true)]
async fn reacting_to_a_placeholder_is_rejected() {
    let h = Harness::start(MockApi::new());
    h.handle.open_thread(THREAD).await.unwrap();
    h.transport.set_online(false);
    let local = h.handle.send_text("pending", None).await.unwrap();
    let err = h.handle.toggle_reaction(MessageId::Local(local), "❤️").await.unwrap_err();
    assert_eq!(err, booking_chat::common::error::SyncError::NotConfirmed(MessageId::Local(local)));
}

#[tokio::test(start_paused = true)]
async fn missing_thread_resolves_to_empty_state() {
    let api = MockApi::new();
    api.mark_missing(9);
    let h = Harness::start(api);
    let mut changes = h.handle.changes();
    h.handle.open_thread(9).await.unwrap();

    let snapshot = h.eventually("missing flag", |s| s.missing).await;
    assert!(snapshot.initial_loaded);
    assert!(snapshot.messages.is_empty());

    let mut saw_missing = false;
    while let Ok(change) = changes.try_recv() {
        saw_missing |= matches!(change, StoreChange::Missing { thread_id: 9 });
    }
    assert!(saw_missing);
}

#[tokio::test(start_paused = true)]
async fn realtime_echo_replaces_the_placeholder() {
    let api = MockApi::new();
    api.set_send_delay(Duration::from_secs(2));
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    let local = h.handle.send_text("on my way", None).await.unwrap();
    wait_until("send reached server", || h.api.send_calls() == 1).await;
    let crid = h
        .snapshot()
        .await
        .message(MessageId::Local(local))
        .and_then(|m| m.client_request_id.clone())
        .unwrap();
    let committed = h.api.row_for_request(THREAD, &crid).unwrap();

    h.push(
        THREAD,
        RealtimeEvent::Message { event_id: Some("evt-1".into()), message: committed.clone(), client_request_id: None },
    )
    .await;
    let snapshot = h.eventually("echo applied", |s| local_rows(s) == 0 && !s.messages.is_empty()).await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, MessageId::Server(committed.id));

    tokio::time::sleep(Duration::from_secs(3)).await;
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert!(h.handle.pending_tasks().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_events_are_applied_once() {
    let h = Harness::start(MockApi::new());
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    let event = RealtimeEvent::Message {
        event_id: Some("evt-9".into()),
        message: counterpart_row(40, THREAD, "hello"),
        client_request_id: None,
    };
    h.push(THREAD, event.clone()).await;
    h.push(THREAD, event).await;
    h.push(99, RealtimeEvent::Typing { users: vec![PROVIDER] }).await;

    h.eventually("message applied", |s| s.messages.len() == 1).await;
    let summary = h.handle.registry().summary(THREAD).unwrap();
    assert_eq!(summary.unread_count, 1);
    assert_eq!(summary.last_message_id, Some(40));
    assert!(h.snapshot().await.typing.is_empty());

    h.handle.mark_seen().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.registry().summary(THREAD).unwrap().unread_count, 0);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_clears_after_silence() {
    let h = Harness::start(MockApi::new());
    h.handle.open_thread(THREAD).await.unwrap();
    h.push(THREAD, RealtimeEvent::Typing { users: vec![PROVIDER, ME] }).await;

    let snapshot = h.eventually("typing shown", |s| !s.typing.is_empty()).await;
    assert_eq!(snapshot.typing, vec![PROVIDER]);
    h.eventually("typing cleared", |s| s.typing.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn typing_broadcasts_are_throttled() {
    let h = Harness::start(MockApi::new());
    h.handle.open_thread(THREAD).await.unwrap();
    for _ in 0..5 {
        h.handle.notify_typing().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let typing = h.channel.log().iter().filter(|l| l.starts_with("typing")).count();
    assert_eq!(typing, 1);
}

#[tokio::test(start_paused = true)]
async fn attachment_runs_init_upload_and_finalize() {
    let h = Harness::start(MockApi::new());
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    let upload = AttachmentUpload {
        filename: "invoice.pdf".into(),
        content_type: "application/pdf".into(),
        bytes: Arc::new(vec![7u8; 4096]),
        caption: "invoice".into(),
        preview_url: None,
    };
    h.handle.send_attachment(upload, AttachmentKind::File).await.unwrap();

    let snapshot = h
        .eventually("attachment finalized", |s| {
            s.messages.iter().any(|m| m.attachment_url.is_some() && m.local.upload_progress.is_none())
        })
        .await;
    assert_eq!(snapshot.messages.len(), 1);
    let row = &snapshot.messages[0];
    assert!(!row.id.is_local());
    assert_eq!(row.status, MessageStatus::Sent);
    assert!(row.attachment_url.as_deref().unwrap().ends_with("invoice.pdf"));
    assert_eq!(row.attachment_meta.as_ref().and_then(|m| m.size), Some(4096));
    assert_eq!(h.api.uploads(), 1);
    assert_eq!(h.api.finalizes(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_delete_restores_the_row() {
    let api = seeded(1);
    api.reject_deletes();
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 1).await;

    h.handle.delete_message(MessageId::Server(1)).await.unwrap();
    assert!(h.snapshot().await.message(MessageId::Server(1)).unwrap().deleted);

    let snapshot = h
        .eventually("row restored", |s| s.message(MessageId::Server(1)).map_or(false, |m| !m.deleted))
        .await;
    assert_eq!(snapshot.messages[0].content, "row 1");
    assert_eq!(h.api.deletes(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn switching_threads_drops_the_old_page() {
    let api = seeded(2);
    api.set_list_delay(THREAD, Duration::from_secs(1));
    api.seed(8, vec![counterpart_row(50, 8, "other thread")]);
    let h = Harness::start(api);

    h.handle.open_thread(THREAD).await.unwrap();
    h.handle.open_thread(8).await.unwrap();
    h.eventually("second thread loaded", |s| s.messages.len() == 1).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.thread_id, 8);
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "other thread");
    assert!(h.channel.log().contains(&format!("unsubscribe {}", thread_topic(THREAD))));
}

#[tokio::test(start_paused = true)]
async fn delivery_receipt_covers_newest_counterpart_message() {
    let h = Harness::start(seeded(3));
    h.handle.open_thread(THREAD).await.unwrap();
    wait_until("receipt sent", || !h.api.delivered().is_empty()).await;
    assert_eq!(h.api.delivered(), vec![(THREAD, 3)]);
}

#[tokio::test(start_paused = true)]
async fn cached_rows_show_before_the_first_page() {
    let cached: Vec<Message> = (1..=2).map(|id| counterpart_row(id, THREAD, "cached").normalize(THREAD)).collect();
    let api = seeded(3);
    api.set_list_delay(THREAD, Duration::from_secs(1));
    let h = Harness::start_with_cache(api, MemoryMessageCache::with_thread(THREAD, cached));

    h.handle.open_thread(THREAD).await.unwrap();
    let first = h.snapshot().await;
    assert_eq!(first.messages.len(), 2);
    assert!(!first.initial_loaded);

    h.eventually("fresh page", |s| s.initial_loaded && s.messages.len() == 3).await;
    wait_until("cache rewritten", || h.cache.snapshot(THREAD).len() == 3).await;
    assert_eq!(h.cache.load(THREAD).await.unwrap()[2].content, "row 3");
}

#[tokio::test(start_paused = true)]
async fn older_history_is_prepended_until_exhausted() {
    let h = Harness::start(seeded(60));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 50).await;

    assert_eq!(h.handle.fetch_older().await.unwrap(), 10);
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.messages.len(), 60);
    assert_eq!(snapshot.messages[0].id, MessageId::Server(1));
    assert!(snapshot.history_exhausted);
    assert_eq!(h.handle.fetch_older().await.unwrap(), 0);
}

fn invoice(kind_caption: &str) -> AttachmentUpload {
    AttachmentUpload {
        filename: format!("{}.bin", kind_caption),
        content_type: "application/octet-stream".into(),
        bytes: Arc::new(vec![1u8; 512]),
        caption: kind_caption.into(),
        preview_url: None,
    }
}

#[tokio::test(start_paused = true)]
async fn stale_cache_is_not_left_behind_a_gap() {
    let cached: Vec<Message> = (1..=2).map(|id| counterpart_row(id, THREAD, "cached").normalize(THREAD)).collect();
    let h = Harness::start_with_cache(seeded(60), MemoryMessageCache::with_thread(THREAD, cached));
    h.handle.open_thread(THREAD).await.unwrap();

    let snapshot = h.eventually("first page", |s| s.initial_loaded && !s.fetch_in_flight).await;
    assert_eq!(snapshot.messages.len(), 50);
    assert_eq!(snapshot.messages[0].id, MessageId::Server(11));
    assert!(!snapshot.history_exhausted);

    assert_eq!(h.handle.fetch_older().await.unwrap(), 10);
    let snapshot = h.snapshot().await;
    let ids: Vec<i64> = snapshot.messages.iter().map(|m| i64::from(m.id)).collect();
    assert_eq!(ids, (1..=60).collect::<Vec<_>>());
    assert!(snapshot.history_exhausted);
}

#[tokio::test(start_paused = true)]
async fn undated_live_row_sorts_after_the_page_it_raced() {
    let api = seeded(4);
    api.set_list_delay(THREAD, Duration::from_millis(500));
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();

    let mut undated = counterpart_row(5, THREAD, "no clock");
    undated.timestamp = None;
    h.push(THREAD, RealtimeEvent::Message { event_id: Some("evt-5".into()), message: undated, client_request_id: None })
        .await;

    let snapshot = h.eventually("page and live row", |s| s.initial_loaded && s.messages.len() == 5).await;
    let ids: Vec<i64> = snapshot.messages.iter().map(|m| i64::from(m.id)).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn degraded_channel_polls_and_catches_up_on_recovery() {
    let h = Harness::start(seeded(2));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 2 && !s.fetch_in_flight).await;

    h.health
        .send(ChannelHealth { mode: ChannelMode::Disconnected, failure_count: 3 })
        .unwrap();
    h.api.seed(THREAD, vec![counterpart_row(3, THREAD, "polled")]);
    let snapshot = h.eventually("polled row", |s| s.messages.len() == 3).await;
    assert!(snapshot.degraded);

    h.api.seed(THREAD, vec![counterpart_row(4, THREAD, "after recovery")]);
    h.health.send(ChannelHealth::connected()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = h.snapshot().await;
    assert!(!snapshot.degraded);
    assert_eq!(snapshot.messages.len(), 4);
    assert_eq!(snapshot.messages[3].content, "after recovery");
}

#[tokio::test(start_paused = true)]
async fn forbidden_and_server_errors_retry_quietly() {
    let api = seeded(3);
    api.fail_lists(vec![
        booking_chat::common::error::ApiError::Forbidden(403),
        booking_chat::common::error::ApiError::Status { status: 503, message: "busy".into() },
    ]);
    let h = Harness::start(api);
    let mut changes = h.handle.changes();
    h.handle.open_thread(THREAD).await.unwrap();

    let snapshot = h.eventually("loaded after retries", |s| s.initial_loaded && s.messages.len() == 3).await;
    assert!(!snapshot.missing);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.api.list_calls(), 3);
    while let Ok(change) = changes.try_recv() {
        assert!(!matches!(change, StoreChange::Missing { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn not_found_with_rows_keeps_them_and_retries() {
    let h = Harness::start(seeded(2));
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.messages.len() == 2 && !s.fetch_in_flight).await;
    let calls = h.api.list_calls();

    h.api.fail_lists(vec![booking_chat::common::error::ApiError::NotFound]);
    h.api.seed(THREAD, vec![counterpart_row(3, THREAD, "late")]);
    h.handle.fetch_messages(FetchMode::Incremental, FetchOptions { force: true }).await.unwrap();

    wait_until("failed fetch", || h.api.list_calls() == calls + 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let kept = h.snapshot().await;
    assert!(!kept.missing);
    assert_eq!(kept.messages.len(), 2);

    let snapshot = h.eventually("retried fetch", |s| s.messages.len() == 3).await;
    assert!(!snapshot.missing);
    assert_eq!(h.api.list_calls(), calls + 2);
}

#[tokio::test(start_paused = true)]
async fn failed_file_send_can_be_retried() {
    let api = MockApi::new();
    let network = || booking_chat::common::error::ApiError::Network("reset".into());
    api.fail_uploads(vec![network(), network(), network()]);
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    h.handle.send_attachment(invoice("contract"), AttachmentKind::File).await.unwrap();
    let snapshot = h
        .eventually("file send failed", |s| s.messages.iter().any(|m| m.status == MessageStatus::Failed))
        .await;
    let failed = snapshot.messages[0].id;
    assert_eq!(h.api.uploads(), 0);
    assert_eq!(h.handle.pending_tasks().await.unwrap().len(), 1);

    h.handle.retry_message(failed).await.unwrap();
    let snapshot = h
        .eventually("file delivered", |s| {
            s.message(failed).map_or(false, |m| m.attachment_url.is_some() && m.status == MessageStatus::Sent)
        })
        .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(h.api.uploads(), 1);
    assert!(h.handle.pending_tasks().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn text_stays_queued_through_hard_errors() {
    let api = MockApi::new();
    let rejected = || booking_chat::common::error::ApiError::Status { status: 400, message: "bad".into() };
    api.fail_sends(vec![rejected(), rejected()]);
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    let local = h.handle.send_text("still there?", None).await.unwrap();
    let id = MessageId::Local(local);
    h.eventually("requeued", |s| {
        h.api.send_calls() >= 1 && s.message(id).map_or(false, |m| m.status == MessageStatus::Queued)
    })
    .await;

    let snapshot = h.eventually("confirmed", |s| s.messages.len() == 1 && local_rows(s) == 0).await;
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert_eq!(snapshot.messages[0].content, "still there?");
    assert_eq!(h.api.send_calls(), 3);
    assert_eq!(h.api.rows(THREAD).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn voice_note_stays_queued_through_hard_errors() {
    let api = MockApi::new();
    api.fail_inits(vec![booking_chat::common::error::ApiError::Status { status: 422, message: "codec".into() }]);
    let h = Harness::start(api);
    h.handle.open_thread(THREAD).await.unwrap();
    h.eventually("initial page", |s| s.initial_loaded).await;

    let local = h.handle.send_attachment(invoice("voice"), AttachmentKind::Voice).await.unwrap();
    let id = MessageId::Local(local);
    h.eventually("requeued", |s| {
        h.api.init_calls() >= 1 && s.message(id).map_or(false, |m| m.status == MessageStatus::Queued)
    })
    .await;

    let snapshot = h
        .eventually("voice delivered", |s| {
            s.messages.len() == 1 && s.messages[0].attachment_url.is_some() && s.messages[0].local.upload_progress.is_none()
        })
        .await;
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert_eq!(h.api.init_calls(), 2);
    assert!(snapshot.messages.iter().all(|m| m.status != MessageStatus::Failed));
}
