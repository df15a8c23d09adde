use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CanonicalSymbol, Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Partial,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    LongSlTriggered,
    LongTpTriggered,
    ShortSlTriggered,
    ShortTpTriggered,
    BothTriggered,
    UnconfirmedTrigger,
    BatchClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitSuggestedReason {
    ApyNegative,
    ProfitLockable,
}

/// Stop-loss or take-profit configuration for one leg of a position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopOrTakeConfig {
    pub enabled: bool,
    pub percent: Option<Decimal>,
    pub price: Option<Decimal>,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionalOrderStatus {
    Unset,
    Set,
}

/// The four conditional order ids tracked by the Conditional-Order Monitor
/// (spec.md §4.7); `status` gates the monitor's tick-1 position filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionalOrderState {
    pub long_sl: Option<String>,
    pub long_tp: Option<String>,
    pub short_sl: Option<String>,
    pub short_tp: Option<String>,
}

impl ConditionalOrderState {
    pub fn status(&self) -> ConditionalOrderStatus {
        if self.long_sl.is_some()
            || self.long_tp.is_some()
            || self.short_sl.is_some()
            || self.short_tp.is_some()
        {
            ConditionalOrderStatus::Set
        } else {
            ConditionalOrderStatus::Unset
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub group_id: Option<Uuid>,
    pub symbol: CanonicalSymbol,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,

    pub long_entry_price: Option<Decimal>,
    pub short_entry_price: Option<Decimal>,
    pub long_size: Option<Decimal>,
    pub short_size: Option<Decimal>,
    pub long_leverage: Decimal,
    pub short_leverage: Decimal,

    pub open_funding_rate_long: Option<Decimal>,
    pub open_funding_rate_short: Option<Decimal>,

    pub status: PositionStatus,
    pub long_stop_loss: StopOrTakeConfig,
    pub long_take_profit: StopOrTakeConfig,
    pub short_stop_loss: StopOrTakeConfig,
    pub short_take_profit: StopOrTakeConfig,
    pub conditional_orders: ConditionalOrderState,

    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub long_exit_price: Option<Decimal>,
    pub short_exit_price: Option<Decimal>,

    pub cached_funding_pnl: Option<Decimal>,
    pub exit_suggested: bool,
    pub exit_suggested_reason: Option<ExitSuggestedReason>,

    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Position {
    pub fn new_pending(
        user_id: Uuid,
        symbol: CanonicalSymbol,
        long_exchange: Exchange,
        short_exchange: Exchange,
        long_leverage: Decimal,
        short_leverage: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            group_id: None,
            symbol,
            long_exchange,
            short_exchange,
            long_entry_price: None,
            short_entry_price: None,
            long_size: None,
            short_size: None,
            long_leverage,
            short_leverage,
            open_funding_rate_long: None,
            open_funding_rate_short: None,
            status: PositionStatus::Pending,
            long_stop_loss: StopOrTakeConfig::default(),
            long_take_profit: StopOrTakeConfig::default(),
            short_stop_loss: StopOrTakeConfig::default(),
            short_take_profit: StopOrTakeConfig::default(),
            conditional_orders: ConditionalOrderState::default(),
            close_reason: None,
            closed_at: None,
            long_exit_price: None,
            short_exit_price: None,
            cached_funding_pnl: None,
            exit_suggested: false,
            exit_suggested_reason: None,
            failure_reason: None,
            created_at: now,
        }
    }

    pub fn entry_price_for(&self, side: PositionSide) -> Option<Decimal> {
        match side {
            PositionSide::Long => self.long_entry_price,
            PositionSide::Short => self.short_entry_price,
        }
    }

    pub fn exchange_for(&self, side: PositionSide) -> Exchange {
        match side {
            PositionSide::Long => self.long_exchange,
            PositionSide::Short => self.short_exchange,
        }
    }
}

/// Maps a single-side conditional order trigger to the `CloseReason` used
/// when closing the opposite leg (spec.md §4.7 step 5).
pub fn close_reason_for_trigger(side: PositionSide, is_stop_loss: bool) -> CloseReason {
    match (side, is_stop_loss) {
        (PositionSide::Long, true) => CloseReason::LongSlTriggered,
        (PositionSide::Long, false) => CloseReason::LongTpTriggered,
        (PositionSide::Short, true) => CloseReason::ShortSlTriggered,
        (PositionSide::Short, false) => CloseReason::ShortTpTriggered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_side_maps_correctly() {
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
        assert_eq!(PositionSide::Short.opposite(), PositionSide::Long);
    }

    #[test]
    fn conditional_order_state_reports_set_once_any_id_present() {
        let mut state = ConditionalOrderState::default();
        assert_eq!(state.status(), ConditionalOrderStatus::Unset);
        state.long_sl = Some("abc".to_string());
        assert_eq!(state.status(), ConditionalOrderStatus::Set);
    }

    #[test]
    fn close_reason_mapping_matches_trigger_table() {
        assert_eq!(
            close_reason_for_trigger(PositionSide::Long, true),
            CloseReason::LongSlTriggered
        );
        assert_eq!(
            close_reason_for_trigger(PositionSide::Short, false),
            CloseReason::ShortTpTriggered
        );
    }
}
