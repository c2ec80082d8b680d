use booking_chat::client::config::SyncConfig;
use booking_chat::client::services::cache::{MessageCache, SqliteMessageCache};
use clap::Parser;

/// Dumps the local message cache.
#[derive(Parser, Debug)]
#[command(name = "booking-chat-cache")]
struct Args {
    /// Show the rows of a single thread.
    #[arg(long)]
    thread: Option<i64>,
    /// Drop the cached rows of `--thread`.
    #[arg(long, requires = "thread")]
    clear: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SyncConfig::from_env();
    println!("Connecting to {}", config.cache_database_url);
    let cache = SqliteMessageCache::connect(&config.cache_database_url).await?;

    let Some(thread_id) = args.thread else {
        println!("\n-- cached threads --");
        for t in cache.threads().await? {
            println!("thread_id={} rows={} updated_at={}", t.thread_id, t.rows, t.updated_at);
        }
        return Ok(());
    };

    if args.clear {
        let removed = cache.clear_thread(thread_id).await?;
        println!("Removed {} rows for thread {}", removed, thread_id);
        return Ok(());
    }

    println!("\n-- thread {} --", thread_id);
    for m in cache.load(thread_id).await? {
        let ts = m.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
        println!(
            "id={} sender={} type={:?} deleted={} read={} ts={} content_len={}",
            m.id,
            m.sender_id,
            m.message_type,
            m.deleted,
            m.is_read,
            ts,
            m.content.len()
        );
    }
    Ok(())
}
