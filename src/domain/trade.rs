use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Success,
    Partial,
}

/// Immutable performance record emitted on every terminal Position close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub long_entry_price: Decimal,
    pub short_entry_price: Decimal,
    pub long_exit_price: Decimal,
    pub short_exit_price: Decimal,
    pub long_size: Decimal,
    pub short_size: Decimal,
    pub holding_duration_ms: i64,
    pub price_diff_pnl: Decimal,
    pub funding_rate_pnl: Decimal,
    pub total_pnl: Decimal,
    pub roi: Decimal,
    pub status: TradeStatus,
    pub closed_at: DateTime<Utc>,
}

pub struct TradeInputs {
    pub position_id: Uuid,
    pub long_entry_price: Decimal,
    pub short_entry_price: Decimal,
    pub long_exit_price: Decimal,
    pub short_exit_price: Decimal,
    pub long_size: Decimal,
    pub short_size: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Sum of both legs' funding payments over the position's lifetime.
    /// Per spec.md §9 Open Question (a), duplicate (symbol, timestamp)
    /// entries reported by a venue are summed without dedup — preserved
    /// intentionally, not a bug.
    pub funding_rate_pnl: Decimal,
    pub fees: Decimal,
    pub margin: Decimal,
    pub status: TradeStatus,
}

impl Trade {
    /// `priceDiffPnL = (longExit-longEntry)*longSize + (shortEntry-shortExit)*shortSize`
    /// `totalPnL = priceDiffPnL + fundingRatePnL - fees`; `roi = totalPnL / margin`.
    pub fn compute(inputs: TradeInputs) -> Self {
        let price_diff_pnl = (inputs.long_exit_price - inputs.long_entry_price) * inputs.long_size
            + (inputs.short_entry_price - inputs.short_exit_price) * inputs.short_size;
        let total_pnl = price_diff_pnl + inputs.funding_rate_pnl - inputs.fees;
        let roi = if inputs.margin.is_zero() {
            Decimal::ZERO
        } else {
            total_pnl / inputs.margin
        };
        let holding_duration_ms = (inputs.closed_at - inputs.opened_at).num_milliseconds();

        Trade {
            id: Uuid::new_v4(),
            position_id: inputs.position_id,
            long_entry_price: inputs.long_entry_price,
            short_entry_price: inputs.short_entry_price,
            long_exit_price: inputs.long_exit_price,
            short_exit_price: inputs.short_exit_price,
            long_size: inputs.long_size,
            short_size: inputs.short_size,
            holding_duration_ms,
            price_diff_pnl,
            funding_rate_pnl: inputs.funding_rate_pnl,
            total_pnl,
            roi,
            status: inputs.status,
            closed_at: inputs.closed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn scenario_s2_paired_open_close_pnl() {
        let opened_at = Utc::now();
        let closed_at = opened_at + chrono::Duration::hours(8);
        let trade = Trade::compute(TradeInputs {
            position_id: Uuid::new_v4(),
            long_entry_price: dec!(50000),
            short_entry_price: dec!(50100),
            long_exit_price: dec!(51000),
            short_exit_price: dec!(51050),
            long_size: dec!(0.01),
            short_size: dec!(0.01),
            opened_at,
            closed_at,
            funding_rate_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            margin: dec!(500),
            status: TradeStatus::Success,
        });

        assert_eq!(trade.price_diff_pnl, dec!(0.5));
        assert_eq!(trade.total_pnl, dec!(0.5));
    }
}
