//! Exponential-backoff reconnect schedule (spec.md §4.2, testable
//! property 3): `delay_n = min(initial * factor^(n-1), maxDelay) * (1 ± jitter)`.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.10,
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Base delay for attempt `n` (1-indexed), before jitter is applied.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let raw = self.initial_ms as f64 * self.factor.powi((attempt.max(1) - 1) as i32);
        raw.min(self.max_delay_ms as f64) as u64
    }

    /// Base delay with jitter applied, used to actually schedule a retry.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt) as f64;
        let jitter_span = base * self.jitter;
        let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        Duration::from_millis((base + offset).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_matches_spec_sequence() {
        let cfg = BackoffConfig::default();
        let expected = [1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000];
        for (i, &exp) in expected.iter().enumerate() {
            let attempt = (i + 1) as u32;
            assert_eq!(cfg.base_delay_ms(attempt), exp, "attempt {attempt}");
        }
    }

    #[test]
    fn jittered_delay_stays_within_jitter_band() {
        let cfg = BackoffConfig::default();
        for attempt in 1..=7u32 {
            let base = cfg.base_delay_ms(attempt) as f64;
            let band = base * cfg.jitter;
            let sample = cfg.jittered_delay(attempt).as_millis() as f64;
            assert!(sample >= (base - band).max(0.0) - 1.0);
            assert!(sample <= base + band + 1.0);
        }
    }
}
