use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CanonicalSymbol, Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpportunityStatus {
    Active,
    Ended,
}

/// Process-wide (not per-user) arbitrage opportunity. Keyed by
/// (symbol, longExchange, shortExchange); at most one ACTIVE per triplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: Uuid,
    pub symbol: CanonicalSymbol,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub detected_at: DateTime<Utc>,
    pub disappeared_at: Option<DateTime<Utc>>,
    pub initial_spread: Decimal,
    pub current_spread: Decimal,
    pub max_spread: Decimal,
    pub max_spread_at: DateTime<Utc>,
    pub status: OpportunityStatus,
    pub notification_count: u32,
    pub user_id: Option<Uuid>,
    /// Running sum/count of `annualizedReturn` observed each cycle, used to
    /// compute `realizedApy` (mean over lifetime) on `end()`.
    annualized_return_sum: Decimal,
    observation_count: u32,
}

impl ArbitrageOpportunity {
    pub fn new(
        symbol: CanonicalSymbol,
        long_exchange: Exchange,
        short_exchange: Exchange,
        spread: Decimal,
        annualized_return: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            long_exchange,
            short_exchange,
            detected_at: now,
            disappeared_at: None,
            initial_spread: spread,
            current_spread: spread,
            max_spread: spread,
            max_spread_at: now,
            status: OpportunityStatus::Active,
            notification_count: 1,
            user_id: None,
            annualized_return_sum: annualized_return,
            observation_count: 1,
        }
    }

    /// Upsert rule (a): update currentSpread, bump maxSpread/maxSpreadAt if
    /// the new spread is a new high (spec.md §4.5).
    pub fn observe(&mut self, spread: Decimal, annualized_return: Decimal, now: DateTime<Utc>) {
        self.current_spread = spread;
        self.notification_count += 1;
        self.annualized_return_sum += annualized_return;
        self.observation_count += 1;
        if spread > self.max_spread {
            self.max_spread = spread;
            self.max_spread_at = now;
        }
    }

    /// Disappearance rule: triplet not seen in the latest sweep (spec.md
    /// §4.5). `realizedApy` is the mean of every `annualizedReturn` observed
    /// across this opportunity's lifetime.
    pub fn end(&mut self, now: DateTime<Utc>) -> OpportunityEndHistory {
        self.disappeared_at = Some(now);
        self.status = OpportunityStatus::Ended;
        let duration_ms = (now - self.detected_at).num_milliseconds();
        let realized_apy = if self.observation_count == 0 {
            Decimal::ZERO
        } else {
            self.annualized_return_sum / Decimal::from(self.observation_count)
        };
        OpportunityEndHistory {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            long_exchange: self.long_exchange,
            short_exchange: self.short_exchange,
            detected_at: self.detected_at,
            disappeared_at: now,
            duration_ms,
            initial_spread: self.initial_spread,
            final_spread: self.current_spread,
            max_spread: self.max_spread,
            realized_apy,
        }
    }
}

/// De-identified row persisted on ACTIVE→ENDED transition (spec.md §6):
/// deliberately carries no `userId`, `notificationCount` or settlement
/// records so `/public/opportunities` can return it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityEndHistory {
    pub id: Uuid,
    pub symbol: CanonicalSymbol,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub detected_at: DateTime<Utc>,
    pub disappeared_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub initial_spread: Decimal,
    pub final_spread: Decimal,
    pub max_spread: Decimal,
    pub realized_apy: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn observe_tracks_running_max_spread() {
        let now = Utc::now();
        let mut opp = ArbitrageOpportunity::new(
            CanonicalSymbol::new("BTCUSDT"),
            Exchange::Okx,
            Exchange::Binance,
            dec!(0.0006),
            dec!(0.2190),
            now,
        );
        opp.observe(dec!(0.0004), dec!(0.1460), now);
        assert_eq!(opp.max_spread, dec!(0.0006));
        opp.observe(dec!(0.0009), dec!(0.3285), now);
        assert_eq!(opp.max_spread, dec!(0.0009));
    }

    #[test]
    fn end_produces_deidentified_history_row() {
        let now = Utc::now();
        let mut opp = ArbitrageOpportunity::new(
            CanonicalSymbol::new("BTCUSDT"),
            Exchange::Okx,
            Exchange::Binance,
            dec!(0.0006),
            dec!(0.2190),
            now,
        );
        opp.observe(dec!(0.0004), dec!(0.1460), now);
        let history = opp.end(now + chrono::Duration::seconds(30));
        assert_eq!(opp.status, OpportunityStatus::Ended);
        assert_eq!(history.duration_ms, 30_000);
        // mean of the two observed annualized returns, not just the last one
        assert_eq!(history.realized_apy, (dec!(0.2190) + dec!(0.1460)) / dec!(2));
    }
}
