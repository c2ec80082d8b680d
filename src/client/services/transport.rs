use std::sync::Arc;
use std::time::Duration;

use log::info;
use rand::Rng;
use tokio::sync::watch;

use crate::common::error::ApiError;

/// Tracks whether the device currently has connectivity.
///
/// The host application feeds platform signals into `set_online`; the engine
/// and the outbox observe the watch channel.
#[derive(Clone)]
pub struct TransportMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl TransportMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { state: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("[SYNC] Transport is now {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for TransportMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Offline,
    Transient,
    Forbidden,
    NotFound,
    HardClient,
}

impl ErrorClass {
    /// Whether the same request may succeed if repeated later.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Offline | ErrorClass::Transient | ErrorClass::Forbidden)
    }
}

pub fn classify(error: &ApiError, online: bool) -> ErrorClass {
    if !online {
        return ErrorClass::Offline;
    }
    match error {
        ApiError::Offline => ErrorClass::Offline,
        ApiError::Network(_) | ApiError::Timeout => ErrorClass::Transient,
        ApiError::NotFound => ErrorClass::NotFound,
        ApiError::Forbidden(_) => ErrorClass::Forbidden,
        ApiError::Decode(_) => ErrorClass::HardClient,
        ApiError::Status { status, .. } => match *status {
            401 | 403 => ErrorClass::Forbidden,
            404 => ErrorClass::NotFound,
            408 | 425 | 429 => ErrorClass::Transient,
            s if s >= 500 => ErrorClass::Transient,
            _ => ErrorClass::HardClient,
        },
    }
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction of the computed delay added or removed at random.
    pub jitter: f64,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, factor: 2.0, max, jitter: 0.2 }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1).min(32) as i32);
        let raw = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        let jittered = (raw * (1.0 + spread)).clamp(0.0, self.max.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// `None` keeps retrying forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts: Some(max_attempts), backoff }
    }

    pub const fn unbounded(backoff: Backoff) -> Self {
        Self { max_attempts: None, backoff }
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_wins_over_status() {
        let err = ApiError::Status { status: 500, message: "boom".into() };
        assert_eq!(classify(&err, false), ErrorClass::Offline);
        assert_eq!(classify(&err, true), ErrorClass::Transient);
    }

    #[test]
    fn status_codes_map_to_classes() {
        let status = |s: u16| ApiError::Status { status: s, message: String::new() };
        assert_eq!(classify(&status(429), true), ErrorClass::Transient);
        assert_eq!(classify(&status(408), true), ErrorClass::Transient);
        assert_eq!(classify(&status(403), true), ErrorClass::Forbidden);
        assert_eq!(classify(&status(422), true), ErrorClass::HardClient);
        assert_eq!(classify(&ApiError::NotFound, true), ErrorClass::NotFound);
        assert_eq!(classify(&ApiError::Decode("eof".into()), true), ErrorClass::HardClient);
        assert!(ErrorClass::Forbidden.is_retryable());
        assert!(!ErrorClass::HardClient.is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff { jitter: 0.0, ..Backoff::new(Duration::from_secs(1), Duration::from_secs(30)) };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));

        let jittered = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        for _ in 0..50 {
            let d = jittered.delay(1);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{:?}", d);
        }
    }

    #[test]
    fn monitor_only_notifies_on_change() {
        let monitor = TransportMonitor::new(true);
        let mut rx = monitor.subscribe();
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
        monitor.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());
    }

    #[test]
    fn retry_policy_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert!(RetryPolicy::bounded(3, backoff).exhausted(3));
        assert!(!RetryPolicy::bounded(3, backoff).exhausted(2));
        assert!(!RetryPolicy::unbounded(backoff).exhausted(1_000));
    }
}
