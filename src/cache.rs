//! Rate Limiter + Cache (C9): per-(key) sliding-window rate limiter plus the
//! two read-mostly TTL caches named in spec.md §4.9. All three guard their
//! state behind `parking_lot::RwLock`, matching the shared-resource policy
//! of spec.md §5 ("read-mostly, guarded by reader-writer locks").

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after: Duration,
}

/// In-memory sliding-window limiter keyed by an arbitrary string (spec.md
/// calls for `(userId, route)`; `/public/opportunities` instead keys by
/// client IP).
#[derive(Default)]
pub struct RateLimiter {
    windows: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Allows the `limit`-th request within `window` and rejects beyond
    /// that, matching testable property 9 (30th request allowed, 31st
    /// rejected with `Retry-After: 60`, `X-RateLimit-Remaining: 0`).
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.write();
        let entry = windows.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if (entry.len() as u32) < limit {
            entry.push_back(now);
            RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit - entry.len() as u32,
                retry_after: Duration::ZERO,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: window,
            }
        }
    }
}

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Generic TTL cache backing the markets cache (`(exchange,
/// instrumentUniverse) -> venue metadata`, TTL 1 h) and the account-type
/// cache (`(userId, exchange) -> {isPortfolioMargin, isHedgeMode}`, TTL
/// 10 min).
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, TtlEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.write().insert(
            key,
            TtlEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }
}

pub const MARKETS_CACHE_TTL: Duration = Duration::from_secs(3600);
pub const ACCOUNT_TYPE_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountType {
    pub is_portfolio_margin: bool,
    pub is_hedge_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_exactly_limit_requests_then_rejects_with_retry_after() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        for _ in 0..30 {
            let decision = limiter.check("user-1:/public/opportunities", 30, window);
            assert!(decision.allowed);
        }
        let thirty_first = limiter.check("user-1:/public/opportunities", 30, window);
        assert!(!thirty_first.allowed);
        assert_eq!(thirty_first.remaining, 0);
        assert_eq!(thirty_first.retry_after, window);
    }

    #[test]
    fn different_keys_have_independent_windows() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        for _ in 0..30 {
            limiter.check("ip-a", 30, window);
        }
        let ip_b = limiter.check("ip-b", 30, window);
        assert!(ip_b.allowed);
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let cache: TtlCache<&str, i32> = TtlCache::new(Duration::from_millis(1));
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn ttl_cache_returns_fresh_entries() {
        let cache: TtlCache<&str, i32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", 42);
        assert_eq!(cache.get(&"k"), Some(42));
    }
}
