//! Subscription book: `{channel -> {params, subscribedAt, active}}`. Every
//! subscribe mutates the book; resubscribe replays stored params after
//! reconnect (spec.md §4.2).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub params: serde_json::Value,
    pub subscribed_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Default)]
pub struct SubscriptionBook {
    channels: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, channel: impl Into<String>, params: serde_json::Value) {
        self.channels.insert(
            channel.into(),
            SubscriptionEntry {
                params,
                subscribed_at: Utc::now(),
                active: true,
            },
        );
    }

    pub fn unsubscribe(&mut self, channel: &str) {
        self.channels.remove(channel);
    }

    pub fn mark_inactive_all(&mut self) {
        for entry in self.channels.values_mut() {
            entry.active = false;
        }
    }

    pub fn mark_active(&mut self, channel: &str) {
        if let Some(entry) = self.channels.get_mut(channel) {
            entry.active = true;
        }
    }

    /// All channels currently recorded, regardless of `active` — this is
    /// what gets replayed on resubscribe after reconnect.
    pub fn all_channels(&self) -> Vec<(String, serde_json::Value)> {
        self.channels
            .iter()
            .map(|(channel, entry)| (channel.clone(), entry.params.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resubscribe_replays_every_channel_present_before_disconnect() {
        let mut book = SubscriptionBook::new();
        book.subscribe("BTCUSDT@markPrice", json!({"symbol": "BTCUSDT"}));
        book.subscribe("ETHUSDT@markPrice", json!({"symbol": "ETHUSDT"}));
        book.mark_inactive_all();

        let channels = book.all_channels();
        assert_eq!(channels.len(), 2);
        assert!(channels.iter().any(|(c, _)| c == "BTCUSDT@markPrice"));
        assert!(channels.iter().any(|(c, _)| c == "ETHUSDT@markPrice"));
    }

    #[test]
    fn unsubscribe_removes_channel_from_book() {
        let mut book = SubscriptionBook::new();
        book.subscribe("BTCUSDT@markPrice", json!({}));
        book.unsubscribe("BTCUSDT@markPrice");
        assert!(book.is_empty());
    }
}
