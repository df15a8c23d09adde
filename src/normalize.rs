//! Event Normalizer (C3): maps venue payloads to the canonical event enum.
//! Each adapter module owns the pure per-payload match arm that produces
//! these variants; this module defines the shared tagged type and the
//! malformed-payload logging helper (spec.md §4.3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{CanonicalSymbol, Exchange, RateSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeReason {
    Deposit,
    Withdrawal,
    Trade,
    Funding,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CanonicalEvent {
    FundingRateReceived {
        exchange: Exchange,
        symbol: CanonicalSymbol,
        funding_rate: Option<Decimal>,
        next_funding_time: Option<DateTime<Utc>>,
        mark_price: Option<Decimal>,
        source: RateSource,
        received_at: DateTime<Utc>,
        original_interval_hours: u32,
    },
    OrderStatusChanged {
        exchange: Exchange,
        symbol: CanonicalSymbol,
        order_id: String,
        client_order_id: Option<String>,
        status: OrderStatus,
        side: OrderSide,
        position_side: PositionSide,
        order_type: OrderType,
        avg_price: Decimal,
        filled_quantity: Decimal,
        stop_price: Option<Decimal>,
        realized_pnl: Option<Decimal>,
        update_time: DateTime<Utc>,
    },
    BalanceChanged {
        exchange: Exchange,
        asset: String,
        wallet_balance: Decimal,
        balance_change: Decimal,
        change_reason: ChangeReason,
        received_at: DateTime<Utc>,
    },
}

/// Logs a malformed payload with a correlation id and swallows it — the
/// normalizer never propagates parse failures upstream (spec.md §4.3).
pub fn reject_malformed(exchange: Exchange, context: &str, raw: &str, err: impl std::fmt::Display) {
    let correlation_id = Uuid::new_v4();
    tracing::warn!(
        correlation_id = %correlation_id,
        exchange = %exchange,
        context,
        error = %err,
        raw_payload = %truncate(raw, 500),
        "rejected malformed venue payload"
    );
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[..max]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_event_serializes_with_type_tag() {
        let event = CanonicalEvent::FundingRateReceived {
            exchange: Exchange::Binance,
            symbol: CanonicalSymbol::new("BTCUSDT"),
            funding_rate: Some(Decimal::new(1, 4)),
            next_funding_time: None,
            mark_price: None,
            source: RateSource::Websocket,
            received_at: Utc::now(),
            original_interval_hours: 8,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FundingRateReceived");
    }

    #[test]
    fn negative_and_scientific_notation_rates_parse_as_decimals() {
        let negative: Decimal = "-0.0005".parse().unwrap();
        let scientific = Decimal::from_scientific("1.5E-4").unwrap();
        assert!(negative < Decimal::ZERO);
        assert_eq!(scientific, Decimal::new(15, 5));
    }
}
