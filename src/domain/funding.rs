use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{CanonicalInterval, CanonicalSymbol, Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Websocket,
    Rest,
}

/// Immutable record of a funding rate as received from a venue. Superseded
/// (never mutated) by the next record for the same (exchange, symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateRecord {
    pub exchange: Exchange,
    pub symbol: CanonicalSymbol,
    pub rate: Decimal,
    pub mark_price: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub source: RateSource,
    /// Hours between settlements for this (exchange, symbol) as reported by
    /// the venue: one of 1, 2, 4, 8.
    pub original_interval_hours: u32,
}

/// Latest known rate data for one exchange within a `FundingRatePair`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRateData {
    pub exchange: Exchange,
    pub rate: Decimal,
    pub mark_price: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub original_interval_hours: u32,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRateData {
    pub fn from_record(record: &FundingRateRecord) -> Self {
        Self {
            exchange: record.exchange,
            rate: record.rate,
            mark_price: record.mark_price,
            next_funding_time: record.next_funding_time,
            original_interval_hours: record.original_interval_hours,
            updated_at: record.received_at,
        }
    }

    /// Normalizes this exchange's rate to a canonical settlement interval
    /// and annualizes it (spec.md §3 invariant: `normalized[i] = rate *
    /// (i / originalInterval) * settlementsPerYear(i)`).
    pub fn normalized_apy(&self, interval: CanonicalInterval) -> Decimal {
        let original = Decimal::from(self.original_interval_hours.max(1));
        let target = Decimal::from(interval.hours());
        self.rate * (target / original) * interval.settlements_per_year()
    }
}

/// Total round-trip cost rate assumed for every pair: 0.2% trading fees
/// (4x taker @ 0.05%) + 0.1% slippage + 0.15% price-convergence +
/// 0.05% safety margin = 0.5%.
pub const TOTAL_COST_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 3);

/// Tolerance used by `isPriceDirectionCorrect`: 0.05%, intentionally
/// hardcoded and not configurable (spec.md §9 Open Question (b)).
pub const PRICE_DIRECTION_TOLERANCE: Decimal = Decimal::from_parts(5, 0, 0, false, 4);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestArbitragePair {
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub spread_percent: Decimal,
    pub annualized_return: Decimal,
    pub net_return: Decimal,
    pub is_price_direction_correct: bool,
    pub price_diff_percent: Option<Decimal>,
}

/// Per-symbol set of latest exchange rates plus the derived best pair,
/// recomputed on every new `FundingRateRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRatePair {
    pub symbol: CanonicalSymbol,
    pub rates: HashMap<Exchange, ExchangeRateData>,
    pub best_pair: Option<BestArbitragePair>,
}

impl FundingRatePair {
    pub fn new(symbol: CanonicalSymbol) -> Self {
        Self {
            symbol,
            rates: HashMap::new(),
            best_pair: None,
        }
    }

    pub fn upsert(&mut self, record: &FundingRateRecord) {
        self.rates
            .insert(record.exchange, ExchangeRateData::from_record(record));
        self.best_pair = self.recompute_best_pair();
    }

    /// Enumerates all ordered (long, short) pairs with data on both sides,
    /// scores each and picks the highest `netReturn`. Ties break on
    /// `annualizedReturn` descending, then `longExchange`/`shortExchange`
    /// lexicographically ascending (spec.md §4.4).
    fn recompute_best_pair(&self) -> Option<BestArbitragePair> {
        let mut best: Option<BestArbitragePair> = None;

        for long in self.rates.values() {
            for short in self.rates.values() {
                if long.exchange == short.exchange {
                    continue;
                }
                let candidate = score_pair(long, short);
                best = match best {
                    None => Some(candidate),
                    Some(current) => Some(pick_better(current, candidate)),
                };
            }
        }
        best
    }
}

fn score_pair(long: &ExchangeRateData, short: &ExchangeRateData) -> BestArbitragePair {
    let spread = short.rate - long.rate;
    let spread_percent = spread * Decimal::from(100);
    let min_interval_hours = long.original_interval_hours.min(short.original_interval_hours);
    let min_interval = closest_canonical(min_interval_hours);
    let annualized_return = spread * min_interval.settlements_per_year();
    let net_return = spread - TOTAL_COST_RATE;

    let (is_price_direction_correct, price_diff_percent) = match (long.mark_price, short.mark_price) {
        (Some(lp), Some(sp)) if lp != Decimal::ZERO => {
            let diff_percent = (sp - lp) / lp;
            let correct = sp >= lp * (Decimal::ONE - PRICE_DIRECTION_TOLERANCE);
            (correct, Some(diff_percent * Decimal::from(100)))
        }
        _ => (true, None),
    };

    BestArbitragePair {
        long_exchange: long.exchange,
        short_exchange: short.exchange,
        spread_percent,
        annualized_return,
        net_return,
        is_price_direction_correct,
        price_diff_percent,
    }
}

fn pick_better(current: BestArbitragePair, candidate: BestArbitragePair) -> BestArbitragePair {
    if candidate.net_return > current.net_return {
        return candidate;
    }
    if candidate.net_return < current.net_return {
        return current;
    }
    if candidate.annualized_return > current.annualized_return {
        return candidate;
    }
    if candidate.annualized_return < current.annualized_return {
        return current;
    }
    if candidate.long_exchange < current.long_exchange {
        return candidate;
    }
    if candidate.long_exchange > current.long_exchange {
        return current;
    }
    if candidate.short_exchange < current.short_exchange {
        candidate
    } else {
        current
    }
}

/// Maps an arbitrary reported interval in hours to the nearest canonical
/// interval used purely for the annualization multiplier; settlement
/// intervals themselves are never altered.
fn closest_canonical(hours: u32) -> CanonicalInterval {
    match hours {
        0..=1 => CanonicalInterval::OneHour,
        2..=4 => CanonicalInterval::FourHours,
        5..=8 => CanonicalInterval::EightHours,
        _ => CanonicalInterval::TwentyFourHours,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(exchange: Exchange, rate: Decimal, mark_price: Decimal) -> FundingRateRecord {
        FundingRateRecord {
            exchange,
            symbol: CanonicalSymbol::new("BTCUSDT"),
            rate,
            mark_price: Some(mark_price),
            next_funding_time: None,
            received_at: Utc::now(),
            source: RateSource::Websocket,
            original_interval_hours: 8,
        }
    }

    #[test]
    fn best_pair_selects_highest_net_return() {
        let mut pair = FundingRatePair::new(CanonicalSymbol::new("BTCUSDT"));
        pair.upsert(&record(Exchange::Binance, dec!(0.0001), dec!(50000)));
        pair.upsert(&record(Exchange::Okx, dec!(-0.0005), dec!(50000)));
        pair.upsert(&record(Exchange::Gateio, dec!(0.0002), dec!(50000)));

        let best = pair.best_pair.expect("best pair present");
        assert_eq!(best.long_exchange, Exchange::Okx);
        assert_eq!(best.short_exchange, Exchange::Binance);
        assert_eq!(best.spread_percent, dec!(0.06));
    }

    #[test]
    fn net_return_below_threshold_is_still_computed_but_unprofitable() {
        let mut pair = FundingRatePair::new(CanonicalSymbol::new("ETHUSDT"));
        pair.upsert(&record(Exchange::Binance, dec!(0.0001), dec!(3000)));
        pair.upsert(&record(Exchange::Okx, dec!(0.0002), dec!(3000)));

        let best = pair.best_pair.expect("best pair present");
        assert_eq!(best.long_exchange, Exchange::Binance);
        assert_eq!(best.short_exchange, Exchange::Okx);
        assert_eq!(best.net_return, dec!(0.0001) - TOTAL_COST_RATE);
        assert!(best.net_return < Decimal::ZERO);
    }

    #[test]
    fn price_direction_incorrect_when_long_priced_above_short_beyond_tolerance() {
        let mut pair = FundingRatePair::new(CanonicalSymbol::new("SOLUSDT"));
        pair.upsert(&record(Exchange::Binance, dec!(0.0001), dec!(100.00)));
        pair.upsert(&record(Exchange::Okx, dec!(-0.0005), dec!(110.00)));

        let best = pair.best_pair.expect("best pair present");
        assert_eq!(best.long_exchange, Exchange::Okx);
        assert_eq!(best.short_exchange, Exchange::Binance);
        assert!(!best.is_price_direction_correct);
    }
}
