use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use booking_chat::client::config::SyncConfig;
use booking_chat::client::models::anchor::{AnchorManager, AnchorState, Viewport, ViewportMetrics};
use booking_chat::client::models::store::StoreChange;
use booking_chat::client::services::api::HttpMessageApi;
use booking_chat::client::services::cache::SqliteMessageCache;
use booking_chat::client::services::realtime::WebSocketChannel;
use booking_chat::client::services::registry::SessionRegistry;
use booking_chat::client::services::transport::TransportMonitor;
use booking_chat::client::services::{SyncDeps, ThreadSync, ThreadSyncHandle};
use booking_chat::common::models::{Message, MessageId, MessageStatus};
use booking_chat::utils::logger::SyncLogger;

/// Follows one booking thread from the terminal.
#[derive(Parser, Debug)]
#[command(name = "booking-chat-watch", version)]
struct Args {
    /// Thread to open.
    thread_id: i64,
    /// Rows the terminal "viewport" shows at once.
    #[arg(long, default_value_t = 20)]
    rows: usize,
}

/// Line-based viewport: one row per message.
struct TerminalViewport {
    rows: usize,
    total: usize,
    offset: usize,
}

impl TerminalViewport {
    fn bottom_offset(&self) -> usize {
        self.total.saturating_sub(self.rows)
    }
}

impl Viewport for TerminalViewport {
    fn scroll_to_end(&mut self) {
        self.offset = self.bottom_offset();
    }

    fn scroll_by(&mut self, delta: f64) {
        let next = (self.offset as f64 + delta).max(0.0) as usize;
        self.offset = next.min(self.bottom_offset());
    }

    fn metrics(&self) -> ViewportMetrics {
        ViewportMetrics {
            scroll_offset: self.offset as f64,
            viewport_height: self.rows as f64,
            content_height: self.total as f64,
        }
    }
}

fn render(message: &Message) -> String {
    let status = match message.status {
        MessageStatus::Queued => "queued",
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "FAILED",
    };
    let body = if message.deleted { "(deleted)".to_string() } else { message.preview() };
    let time = message
        .timestamp
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let progress = message
        .local
        .upload_progress
        .map(|p| format!(" [{}%]", p))
        .unwrap_or_default();
    format!("[{}] #{} <{}> {} ({}){}", time, message.id, message.sender_id, body, status, progress)
}

async fn redraw(handle: &ThreadSyncHandle, viewport: &TerminalViewport, anchor: &mut AnchorManager) -> anyhow::Result<()> {
    let Some(snapshot) = handle.snapshot().await? else {
        return Ok(());
    };
    println!("--- thread {} ---", snapshot.thread_id);
    if snapshot.missing {
        println!("(thread not found)");
        return Ok(());
    }
    if snapshot.messages.is_empty() && snapshot.initial_loaded {
        println!("(no messages yet)");
    }
    let divider = anchor.unseen_divider();
    let end = (viewport.offset + viewport.rows).min(snapshot.messages.len());
    for message in &snapshot.messages[viewport.offset.min(end)..end] {
        if divider == Some(message.id) {
            println!("----- new messages -----");
        }
        println!("{}", render(message));
    }
    if !snapshot.typing.is_empty() {
        println!("... {:?} typing", snapshot.typing);
    }
    if snapshot.degraded {
        println!("(realtime degraded, polling)");
    }
    if anchor.state(Instant::now()) == AnchorState::Anchored {
        println!("(scrolled up; /bottom to jump back)");
    }
    Ok(())
}

fn parse_id(raw: Option<&str>) -> anyhow::Result<MessageId> {
    let raw = raw.context("missing message id")?;
    Ok(MessageId::from(raw.parse::<i64>().with_context(|| format!("invalid message id {}", raw))?))
}

async fn run_command(handle: &ThreadSyncHandle, line: &str, viewport: &mut TerminalViewport, anchor: &mut AnchorManager) -> anyhow::Result<bool> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/quit") => return Ok(false),
        Some("/older") => {
            let added = handle.fetch_older().await?;
            println!("[CLIENT] Loaded {} older messages", added);
        }
        Some("/react") => {
            let id = parse_id(parts.next())?;
            let emoji = parts.next().unwrap_or("👍");
            let on = handle.toggle_reaction(id, emoji).await?;
            println!("[CLIENT] Reaction {} {}", emoji, if on { "added" } else { "removed" });
        }
        Some("/delete") => handle.delete_message(parse_id(parts.next())?).await?,
        Some("/retry") => handle.retry_message(parse_id(parts.next())?).await?,
        Some("/up") => {
            viewport.scroll_by(-(viewport.rows as f64));
            anchor.on_user_scroll(viewport.metrics(), Instant::now());
            redraw(handle, viewport, anchor).await?;
        }
        Some("/bottom") => {
            viewport.scroll_to_end();
            anchor.on_user_scroll(viewport.metrics(), Instant::now());
            handle.mark_seen()?;
            redraw(handle, viewport, anchor).await?;
        }
        Some("/pending") => {
            for task in handle.pending_tasks().await? {
                println!(
                    "[OUTBOX] {:?} {:?} attempts={} message={:?}",
                    task.kind, task.status, task.attempt_count, task.message_id
                );
            }
        }
        Some(cmd) if cmd.starts_with('/') => println!("[CLIENT] Unknown command {}", cmd),
        Some(_) => {
            let local = handle.send_text(line, None).await?;
            println!("[CLIENT] Queued {}", local);
        }
        None => {}
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SyncConfig::from_env();
    config.validate()?;
    SyncLogger::init(&config.log_level)?;

    let api = HttpMessageApi::new(&config.api_base_url, config.auth_token.clone())?;
    let cache = SqliteMessageCache::connect(&config.cache_database_url).await?;
    let (channel, events, health) =
        WebSocketChannel::connect(config.realtime_url.clone(), config.auth_token.clone().unwrap_or_default());
    let deps = SyncDeps {
        registry: Arc::new(SessionRegistry::new(config.seen_capacity)),
        api: Arc::new(api),
        channel: Arc::new(channel),
        cache: Arc::new(cache),
        transport: TransportMonitor::default(),
        config: config.clone(),
    };
    let handle = ThreadSync::spawn(deps, events, health);
    let mut changes = handle.changes();
    handle.open_thread(args.thread_id).await?;

    println!("[CLIENT] Type a message and press enter. Commands: /older /react <id> <emoji> /delete <id> /retry <id> /up /bottom /pending /quit");
    let mut viewport = TerminalViewport { rows: args.rows, total: 0, offset: 0 };
    let mut anchor = AnchorManager::new(config.anchor_suppression).with_bottom_threshold(1.0);
    let mut input = BufReader::new(stdin()).lines();

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    if let Some(snapshot) = handle.snapshot().await? {
                        viewport.total = snapshot.messages.len();
                    }
                    anchor.apply_change(&change, &mut viewport, Instant::now());
                    if let StoreChange::Participants { .. } = change {
                        continue;
                    }
                    redraw(&handle, &viewport, &mut anchor).await?;
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("[CLIENT] Skipped {} updates", skipped),
                Err(RecvError::Closed) => break,
            },
            line = input.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                handle.notify_typing()?;
                match run_command(&handle, line, &mut viewport, &mut anchor).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("[CLIENT][ERROR] {}", e),
                }
                print!("> ");
                std::io::stdout().flush()?;
            }
        }
    }

    handle.close_thread().await?;
    handle.shutdown();
    Ok(())
}
