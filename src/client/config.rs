use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::common::models::{Participant, SenderType, UserId};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub realtime_url: String,
    pub auth_token: Option<String>,
    pub cache_database_url: String,
    pub user_id: UserId,
    pub sender_type: SenderType,
    pub page_size: usize,
    pub reconcile_delay: Duration,
    pub reconcile_throttle: Duration,
    pub typing_throttle: Duration,
    pub typing_clear: Duration,
    pub reaction_debounce: Duration,
    pub degraded_poll: Duration,
    pub anchor_suppression: Duration,
    pub seen_capacity: usize,
    pub log_level: String,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn millis_or(key: &str, default: u64) -> Duration {
    Duration::from_millis(var_or(key, default))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let sender_type = match env::var("SENDER_TYPE").as_deref() {
            Ok("provider") => SenderType::Provider,
            _ => SenderType::Client,
        };
        Self {
            api_base_url: env::var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            realtime_url: env::var("REALTIME_URL").unwrap_or(defaults.realtime_url),
            auth_token: env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            cache_database_url: env::var("CACHE_DATABASE_URL").unwrap_or(defaults.cache_database_url),
            user_id: var_or("USER_ID", defaults.user_id),
            sender_type,
            page_size: var_or("PAGE_SIZE", defaults.page_size),
            reconcile_delay: millis_or("RECONCILE_DELAY_MS", 250),
            reconcile_throttle: millis_or("RECONCILE_THROTTLE_MS", 1000),
            typing_throttle: millis_or("TYPING_THROTTLE_MS", 1200),
            typing_clear: millis_or("TYPING_CLEAR_MS", 6000),
            reaction_debounce: millis_or("REACTION_DEBOUNCE_MS", 300),
            degraded_poll: Duration::from_secs(var_or("DEGRADED_POLL_SECS", 5)),
            anchor_suppression: millis_or("ANCHOR_SUPPRESSION_MS", 600),
            seen_capacity: var_or("SEEN_CAPACITY", defaults.seen_capacity),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    /// Identity used for own-message detection and optimistic rows.
    pub fn participant(&self) -> Participant {
        Participant { user_id: self.user_id, sender_type: self.sender_type }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.api_base_url).with_context(|| format!("invalid API_BASE_URL {}", self.api_base_url))?;
        let realtime = url::Url::parse(&self.realtime_url)
            .with_context(|| format!("invalid REALTIME_URL {}", self.realtime_url))?;
        if !matches!(realtime.scheme(), "ws" | "wss") {
            bail!("REALTIME_URL must use ws:// or wss://, got {}", realtime.scheme());
        }
        if self.page_size == 0 {
            bail!("PAGE_SIZE must be positive");
        }
        if self.seen_capacity < 2 {
            bail!("SEEN_CAPACITY must be at least 2");
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            realtime_url: "ws://127.0.0.1:8081/realtime".to_string(),
            auth_token: None,
            cache_database_url: "sqlite:data/booking_chat_cache.db".to_string(),
            user_id: 0,
            sender_type: SenderType::Client,
            page_size: 50,
            reconcile_delay: Duration::from_millis(250),
            reconcile_throttle: Duration::from_secs(1),
            typing_throttle: Duration::from_millis(1200),
            typing_clear: Duration::from_secs(6),
            reaction_debounce: Duration::from_millis(300),
            degraded_poll: Duration::from_secs(5),
            anchor_suppression: Duration::from_millis(600),
            seen_capacity: 500,
            log_level: "info".to_string(),
        }
    }
}
