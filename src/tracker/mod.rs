//! Opportunity Tracker (C5): owns the appearance→update→disappearance
//! lifecycle of arbitrage opportunities (spec.md §4.5). Consumes the Funding
//! Pair Engine's per-symbol `bestPair` on every detection cycle; a periodic
//! sweep is simply "run a cycle and diff against the previous one".

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

use crate::domain::{
    ArbitrageOpportunity, CanonicalSymbol, Exchange, FundingRatePair, OpportunityEndHistory,
};
#[cfg(test)]
use crate::domain::{FundingRateRecord, RateSource};

/// `netReturn` threshold above which a `bestPair` becomes `opportunity-detected`
/// (spec.md §4.4 step 6). The engine's cost model already nets out fees and
/// slippage, so zero is the natural cutoff — see `FundingRatePair`'s
/// `TOTAL_COST_RATE`.
pub const MIN_PROFIT_THRESHOLD: Decimal = Decimal::ZERO;

type TripletKey = (CanonicalSymbol, Exchange, Exchange);

#[derive(Debug, Clone)]
pub struct DetectedOpportunity {
    pub symbol: CanonicalSymbol,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub spread: Decimal,
    pub annualized_return: Decimal,
}

/// Step 6 of the Funding Pair Engine: for every tracked symbol, emit its
/// `bestPair` as a detected opportunity iff profitable and price-direction
/// correct.
pub fn detect(pairs: &HashMap<CanonicalSymbol, FundingRatePair>) -> Vec<DetectedOpportunity> {
    pairs
        .values()
        .filter_map(|pair| {
            let best = pair.best_pair.as_ref()?;
            if best.net_return > MIN_PROFIT_THRESHOLD && best.is_price_direction_correct {
                Some(DetectedOpportunity {
                    symbol: pair.symbol.clone(),
                    long_exchange: best.long_exchange,
                    short_exchange: best.short_exchange,
                    spread: best.spread_percent / Decimal::from(100),
                    annualized_return: best.annualized_return,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Outcome of one tracker cycle: opportunities newly started or still
/// observed this cycle, and any that disappeared.
pub struct CycleOutcome {
    pub active: Vec<ArbitrageOpportunity>,
    pub ended: Vec<OpportunityEndHistory>,
}

pub struct Tracker {
    active: RwLock<HashMap<TripletKey, ArbitrageOpportunity>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Applies the upsert and disappearance rules for one detection cycle.
    pub fn run_cycle(&self, detected: &[DetectedOpportunity], now: DateTime<Utc>) -> CycleOutcome {
        let mut active = self.active.write();
        let mut seen: HashSet<TripletKey> = HashSet::with_capacity(detected.len());

        for d in detected {
            let key = (d.symbol.clone(), d.long_exchange, d.short_exchange);
            seen.insert(key.clone());
            match active.get_mut(&key) {
                Some(opp) => opp.observe(d.spread, d.annualized_return, now),
                None => {
                    let opp = ArbitrageOpportunity::new(
                        d.symbol.clone(),
                        d.long_exchange,
                        d.short_exchange,
                        d.spread,
                        d.annualized_return,
                        now,
                    );
                    active.insert(key, opp);
                }
            }
        }

        let stale: Vec<TripletKey> = active
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();

        let mut ended = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(mut opp) = active.remove(&key) {
                ended.push(opp.end(now));
            }
        }

        CycleOutcome {
            active: active.values().cloned().collect(),
            ended,
        }
    }

    pub fn active_opportunities(&self, symbol: Option<&CanonicalSymbol>) -> Vec<ArbitrageOpportunity> {
        let active = self.active.read();
        match symbol {
            Some(s) => active.values().filter(|o| &o.symbol == s).cloned().collect(),
            None => active.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(exchange: Exchange, rate: Decimal) -> FundingRateRecord {
        FundingRateRecord {
            exchange,
            symbol: CanonicalSymbol::new("BTCUSDT"),
            rate,
            mark_price: None,
            next_funding_time: None,
            received_at: Utc::now(),
            source: RateSource::Websocket,
            original_interval_hours: 8,
        }
    }

    #[test]
    fn scenario_s1_opportunity_appears_then_disappears_on_best_pair_change() {
        let mut pairs = HashMap::new();
        let mut pair = FundingRatePair::new(CanonicalSymbol::new("BTCUSDT"));
        pair.upsert(&record(Exchange::Binance, dec!(0.0001)));
        pair.upsert(&record(Exchange::Okx, dec!(-0.0005)));
        pair.upsert(&record(Exchange::Gateio, dec!(0.0002)));
        pairs.insert(pair.symbol.clone(), pair);

        let tracker = Tracker::new();
        let now = Utc::now();
        let detected = detect(&pairs);
        let outcome = tracker.run_cycle(&detected, now);
        assert_eq!(outcome.active.len(), 1);
        assert_eq!(outcome.active[0].long_exchange, Exchange::Okx);
        assert_eq!(outcome.active[0].short_exchange, Exchange::Binance);
        assert_eq!(outcome.active[0].initial_spread, dec!(0.0006));

        // okx's rate moves from -0.0005 to 0.0001: binance is no longer the
        // best counterparty for okx-long, so the original triplet ends.
        let mut pair = pairs.remove(&CanonicalSymbol::new("BTCUSDT")).unwrap();
        pair.upsert(&record(Exchange::Okx, dec!(0.0001)));
        pairs.insert(pair.symbol.clone(), pair);

        let later = now + chrono::Duration::seconds(30);
        let detected = detect(&pairs);
        let outcome = tracker.run_cycle(&detected, later);
        assert_eq!(outcome.ended.len(), 1);
        assert_eq!(outcome.ended[0].long_exchange, Exchange::Okx);
        assert_eq!(outcome.ended[0].short_exchange, Exchange::Binance);
        assert_eq!(outcome.ended[0].duration_ms, 30_000);
    }

    #[test]
    fn scenario_s6_unprofitable_best_pair_is_never_detected() {
        let mut pairs = HashMap::new();
        let mut pair = FundingRatePair::new(CanonicalSymbol::new("ETHUSDT"));
        pair.upsert(&record(Exchange::Binance, dec!(0.0001)));
        pair.upsert(&record(Exchange::Okx, dec!(0.0002)));
        pairs.insert(pair.symbol.clone(), pair);

        let detected = detect(&pairs);
        assert!(detected.is_empty());
    }

    #[test]
    fn observing_same_triplet_across_cycles_updates_not_duplicates() {
        let tracker = Tracker::new();
        let now = Utc::now();
        let d = DetectedOpportunity {
            symbol: CanonicalSymbol::new("BTCUSDT"),
            long_exchange: Exchange::Okx,
            short_exchange: Exchange::Binance,
            spread: dec!(0.0006),
            annualized_return: dec!(0.2),
        };
        tracker.run_cycle(&[d.clone()], now);
        let mut d2 = d;
        d2.spread = dec!(0.001);
        let outcome = tracker.run_cycle(&[d2], now + chrono::Duration::seconds(10));
        assert_eq!(outcome.active.len(), 1);
        assert_eq!(outcome.active[0].max_spread, dec!(0.001));
        assert_eq!(outcome.active[0].notification_count, 2);
    }
}
