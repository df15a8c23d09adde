//! Connection health classification (spec.md §4.2): `{optimal, degraded,
//! fallback}` derived from `(isConnected, ageOfLastMessage, currentMode)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Optimal,
    Degraded,
    Fallback,
}

/// A 60s silence forces reconnect even if the socket claims open.
pub const SILENCE_FORCE_RECONNECT: Duration = Duration::from_secs(60);

pub fn classify(
    is_connected: bool,
    last_message_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> HealthState {
    if !is_connected {
        return HealthState::Fallback;
    }
    match last_message_at {
        None => HealthState::Degraded,
        Some(last) => {
            let age = (now - last).to_std().unwrap_or(Duration::ZERO);
            if age >= SILENCE_FORCE_RECONNECT {
                HealthState::Fallback
            } else if age >= Duration::from_secs(20) {
                HealthState::Degraded
            } else {
                HealthState::Optimal
            }
        }
    }
}

pub fn should_force_reconnect(last_message_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_message_at {
        None => false,
        Some(last) => {
            let age = (now - last).to_std().unwrap_or(Duration::ZERO);
            age >= SILENCE_FORCE_RECONNECT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn disconnected_socket_is_fallback() {
        assert_eq!(classify(false, None, Utc::now()), HealthState::Fallback);
    }

    #[test]
    fn fresh_message_is_optimal() {
        let now = Utc::now();
        assert_eq!(classify(true, Some(now), now), HealthState::Optimal);
    }

    #[test]
    fn sixty_second_silence_forces_reconnect() {
        let now = Utc::now();
        let last = now - ChronoDuration::seconds(61);
        assert!(should_force_reconnect(Some(last), now));
        assert_eq!(classify(true, Some(last), now), HealthState::Fallback);
    }
}
