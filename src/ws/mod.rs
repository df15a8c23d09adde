//! WS Connection Manager (C2): state machine, heartbeat, exponential
//! backoff reconnect, subscription book and health check (spec.md §4.2).
//! Payload-agnostic — venue adapters hand it a codec closure and consume
//! the canonical events it forwards.

pub mod backoff;
pub mod health;
pub mod subscription;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use backoff::BackoffConfig;
use health::HealthState;
use subscription::SubscriptionBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

pub struct ConnectionManagerState {
    pub state: RwLock<ConnectionState>,
    pub attempt: AtomicU32,
    pub last_message_at: RwLock<Option<DateTime<Utc>>>,
    pub subscriptions: RwLock<SubscriptionBook>,
    pub backoff: BackoffConfig,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub auto_resubscribe: bool,
}

impl ConnectionManagerState {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            attempt: AtomicU32::new(0),
            last_message_at: RwLock::new(None),
            subscriptions: RwLock::new(SubscriptionBook::new()),
            backoff,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(60),
            auto_resubscribe: true,
        }
    }

    pub fn health(&self) -> HealthState {
        let is_connected = matches!(*self.state.read(), ConnectionState::Connected);
        health::classify(is_connected, *self.last_message_at.read(), Utc::now())
    }

    pub fn on_message_received(&self) {
        *self.last_message_at.write() = Some(Utc::now());
    }

    pub fn transition_connecting(&self) {
        *self.state.write() = ConnectionState::Connecting;
    }

    pub fn transition_connected(&self) -> bool {
        let was_reconnecting = matches!(*self.state.read(), ConnectionState::Reconnecting);
        *self.state.write() = ConnectionState::Connected;
        self.attempt.store(0, Ordering::SeqCst);
        was_reconnecting
    }

    pub fn transition_reconnecting(&self) -> u32 {
        *self.state.write() = ConnectionState::Reconnecting;
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn transition_disconnected(&self) {
        *self.state.write() = ConnectionState::Disconnected;
    }

    pub fn transition_error(&self) {
        *self.state.write() = ConnectionState::Error;
    }

    pub fn exceeded_max_attempts(&self) -> bool {
        self.attempt.load(Ordering::SeqCst) >= self.backoff.max_attempts
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.read()
    }
}

pub type SharedConnectionManager = Arc<ConnectionManagerState>;

/// Drives one reconnect attempt: sleeps the backoff delay, transitions to
/// `Connecting`, and returns whether the caller should attempt to connect
/// (`false` once `maxAttempts` is exceeded, in which case state becomes
/// `Error`).
pub async fn await_reconnect_delay(manager: &SharedConnectionManager) -> bool {
    let attempt = manager.transition_reconnecting();
    if attempt > manager.backoff.max_attempts {
        manager.transition_error();
        return false;
    }
    let delay = manager.backoff.jittered_delay(attempt);
    sleep(delay).await;
    manager.transition_connecting();
    true
}

/// Settle delay observed before replaying the subscription book after a
/// reconnect (spec.md §4.2: "≥100ms").
pub const RESUBSCRIBE_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Called once the socket reports `onOpen` after having been in
/// `Reconnecting`. Returns the list of (channel, params) to replay if
/// `autoResubscribe` is enabled.
pub async fn resubscribe_after_reconnect(
    manager: &SharedConnectionManager,
    was_reconnecting: bool,
) -> Vec<(String, serde_json::Value)> {
    if !was_reconnecting || !manager.auto_resubscribe {
        return Vec::new();
    }
    sleep(RESUBSCRIBE_SETTLE_DELAY).await;
    manager.subscriptions.read().all_channels()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    #[tokio::test]
    async fn resubscribe_emits_one_message_per_book_entry_after_settle_delay() {
        let manager: SharedConnectionManager = Arc::new(ConnectionManagerState::new(BackoffConfig::default()));
        manager
            .subscriptions
            .write()
            .subscribe("BTCUSDT@markPrice", json!({}));
        manager
            .subscriptions
            .write()
            .subscribe("ETHUSDT@markPrice", json!({}));

        let start = Instant::now();
        let replay = resubscribe_after_reconnect(&manager, true).await;
        let elapsed = start.elapsed();

        assert_eq!(replay.len(), 2);
        assert!(elapsed >= RESUBSCRIBE_SETTLE_DELAY);
    }

    #[tokio::test]
    async fn no_resubscribe_when_not_previously_reconnecting() {
        let manager: SharedConnectionManager = Arc::new(ConnectionManagerState::new(BackoffConfig::default()));
        manager.subscriptions.write().subscribe("BTCUSDT@markPrice", json!({}));
        let replay = resubscribe_after_reconnect(&manager, false).await;
        assert!(replay.is_empty());
    }

    #[test]
    fn exceeding_max_attempts_transitions_to_error() {
        let manager: SharedConnectionManager = Arc::new(ConnectionManagerState::new(BackoffConfig {
            max_attempts: 2,
            ..BackoffConfig::default()
        }));
        manager.transition_reconnecting();
        manager.transition_reconnecting();
        assert!(manager.exceeded_max_attempts());
    }
}
