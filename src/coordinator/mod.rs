//! Position Coordinator (C6): opens and closes hedged pairs across two
//! venues, serialized per `(userId, symbol)` by a distributed lock
//! (spec.md §4.6).

pub mod lock;

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::domain::{
    CloseReason, Position, PositionSide, PositionStatus, Trade, TradeInputs, TradeStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::exchange::{ExchangeAdapter, OrderSide};
use crate::store::Store;
use lock::{DistributedLock, InProcessLock, LockHandle};

/// Order fill deadline per spec.md §4.6 step 4.
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Coordinator {
    store: Store,
    adapters: HashMap<crate::domain::Exchange, Arc<dyn ExchangeAdapter>>,
    credentials: Arc<CredentialStore>,
    lock: Arc<InProcessLock>,
}

#[derive(Debug, Clone)]
pub struct PositionOutcome {
    pub position_id: Uuid,
    pub closed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchCloseResult {
    pub total_positions: usize,
    pub closed_positions: usize,
    pub failed_positions: usize,
    pub outcomes: Vec<PositionOutcome>,
}

impl Coordinator {
    pub fn new(
        store: Store,
        adapters: HashMap<crate::domain::Exchange, Arc<dyn ExchangeAdapter>>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            store,
            adapters,
            credentials,
            lock: Arc::new(InProcessLock::new()),
        }
    }

    fn adapter(&self, exchange: crate::domain::Exchange) -> EngineResult<Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(&exchange)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("no adapter registered for {exchange}")))
    }

    async fn lock_key(&self, user_id: Uuid, symbol: &str) -> EngineResult<LockHandle> {
        let key = format!("{user_id}:{symbol}");
        self.lock
            .clone()
            .try_acquire(key)
            .await
            .ok_or(EngineError::PositionInProgress)
    }

    /// spec.md §4.6 `openPair`.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_pair(
        &self,
        user_id: Uuid,
        symbol: crate::domain::CanonicalSymbol,
        long_exchange: crate::domain::Exchange,
        short_exchange: crate::domain::Exchange,
        qty: Decimal,
        leverage: Decimal,
    ) -> EngineResult<Position> {
        let _guard = self.lock_key(user_id, symbol.as_str()).await?;

        let long_adapter = self.adapter(long_exchange)?;
        let short_adapter = self.adapter(short_exchange)?;
        let long_creds = self
            .credentials
            .get_credentials(user_id, long_exchange)
            .await?
            .ok_or(EngineError::NoApiKey)?;
        let short_creds = self
            .credentials
            .get_credentials(user_id, short_exchange)
            .await?
            .ok_or(EngineError::NoApiKey)?;

        let mut position =
            Position::new_pending(user_id, symbol.clone(), long_exchange, short_exchange, leverage, leverage);

        let long_rate = long_adapter.fetch_funding_rate(&symbol).await?;
        let short_rate = short_adapter.fetch_funding_rate(&symbol).await?;
        position.open_funding_rate_long = Some(long_rate.rate);
        position.open_funding_rate_short = Some(short_rate.rate);

        long_adapter.set_leverage(&long_creds, &symbol, leverage).await?;
        short_adapter.set_leverage(&short_creds, &symbol, leverage).await?;

        let (long_result, short_result) = tokio::join!(
            timeout(
                ORDER_TIMEOUT,
                long_adapter.create_market_order(&long_creds, &symbol, OrderSide::Buy, qty, false)
            ),
            timeout(
                ORDER_TIMEOUT,
                short_adapter.create_market_order(&short_creds, &symbol, OrderSide::Sell, qty, false)
            ),
        );

        let long_fill = long_result.map_err(|_| EngineError::ExchangeConnection("order timed out".into()));
        let short_fill = short_result.map_err(|_| EngineError::ExchangeConnection("order timed out".into()));

        match (long_fill, short_fill) {
            (Ok(Ok(long)), Ok(Ok(short))) => {
                position.status = PositionStatus::Open;
                position.long_entry_price = Some(long.avg_price);
                position.short_entry_price = Some(short.avg_price);
                position.long_size = Some(long.filled_qty);
                position.short_size = Some(short.filled_qty);
            }
            (Ok(Ok(long)), _) => {
                // Long leg filled, short leg failed: unwind the long leg.
                let _ = long_adapter
                    .create_market_order(&long_creds, &symbol, OrderSide::Sell, long.filled_qty, true)
                    .await;
                position.status = PositionStatus::Failed;
                position.failure_reason = Some("short leg failed to fill; long leg unwound".to_string());
            }
            (_, Ok(Ok(short))) => {
                let _ = short_adapter
                    .create_market_order(&short_creds, &symbol, OrderSide::Buy, short.filled_qty, true)
                    .await;
                position.status = PositionStatus::Failed;
                position.failure_reason = Some("long leg failed to fill; short leg unwound".to_string());
            }
            _ => {
                position.status = PositionStatus::Failed;
                position.failure_reason = Some("both legs failed to fill".to_string());
            }
        }

        self.store.upsert_position(&position).await.map_err(EngineError::Internal)?;
        Ok(position)
    }

    /// spec.md §4.6 `closeSingleSide`.
    pub async fn close_single_side(
        &self,
        position_id: Uuid,
        side: PositionSide,
        close_reason: CloseReason,
    ) -> EngineResult<Position> {
        let mut position = self
            .store
            .get_position(position_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or(EngineError::PositionNotFound(position_id))?;

        let exchange = position.exchange_for(side);
        let adapter = self.adapter(exchange)?;
        let creds = self
            .credentials
            .get_credentials(position.user_id, exchange)
            .await?
            .ok_or(EngineError::NoApiKey)?;

        let size = match side {
            PositionSide::Long => position.long_size,
            PositionSide::Short => position.short_size,
        }
        .ok_or_else(|| EngineError::Validation("leg has no recorded size".to_string()))?;

        let order_side = match side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let fill = adapter
            .create_market_order(&creds, &position.symbol, order_side, size, true)
            .await?;

        self.cancel_leg_conditionals(&adapter, &creds, &mut position, side).await;

        match side {
            PositionSide::Long => position.long_exit_price = Some(fill.avg_price),
            PositionSide::Short => position.short_exit_price = Some(fill.avg_price),
        }
        position.close_reason = Some(close_reason);

        if position.long_exit_price.is_some() && position.short_exit_price.is_some() {
            self.finalize_closed(&mut position).await?;
        } else {
            position.status = PositionStatus::Closing;
        }

        self.store.upsert_position(&position).await.map_err(EngineError::Internal)?;
        Ok(position)
    }

    async fn cancel_leg_conditionals(
        &self,
        adapter: &Arc<dyn ExchangeAdapter>,
        creds: &crate::exchange::ApiCredentials,
        position: &mut Position,
        side: PositionSide,
    ) {
        let order_ids: Vec<Option<String>> = match side {
            PositionSide::Long => vec![
                position.conditional_orders.long_sl.take(),
                position.conditional_orders.long_tp.take(),
            ],
            PositionSide::Short => vec![
                position.conditional_orders.short_sl.take(),
                position.conditional_orders.short_tp.take(),
            ],
        };
        for order_id in order_ids.into_iter().flatten() {
            let _ = adapter.cancel_order(creds, &order_id).await;
        }
    }

    /// Both legs' exit prices are known: compute and persist the Trade, and
    /// mark the position CLOSED.
    async fn finalize_closed(&self, position: &mut Position) -> EngineResult<()> {
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());

        let funding_rate_pnl = self.funding_fee_pnl(position).await.unwrap_or(Decimal::ZERO);
        let (Some(long_entry), Some(short_entry), Some(long_exit), Some(short_exit), Some(long_size), Some(short_size)) = (
            position.long_entry_price,
            position.short_entry_price,
            position.long_exit_price,
            position.short_exit_price,
            position.long_size,
            position.short_size,
        ) else {
            return Ok(());
        };

        let margin = (long_entry * long_size + short_entry * short_size) / position.long_leverage.max(Decimal::ONE);
        let trade = Trade::compute(TradeInputs {
            position_id: position.id,
            long_entry_price: long_entry,
            short_entry_price: short_entry,
            long_exit_price: long_exit,
            short_exit_price: short_exit,
            long_size,
            short_size,
            opened_at: position.created_at,
            closed_at: position.closed_at.unwrap(),
            funding_rate_pnl,
            fees: Decimal::ZERO,
            margin,
            status: TradeStatus::Success,
        });
        self.store.insert_trade(&trade).await.map_err(EngineError::Internal)?;
        Ok(())
    }

    /// Funding Fee Query: sums both legs' funding history over the
    /// position's lifetime (spec.md §4.6 Trade emission). Per spec.md §9
    /// Open Question (a), duplicate (symbol, timestamp) entries reported by
    /// a venue are summed without dedup.
    async fn funding_fee_pnl(&self, position: &Position) -> EngineResult<Decimal> {
        let closed_at = position.closed_at.unwrap_or_else(Utc::now);
        let long_adapter = self.adapter(position.long_exchange)?;
        let short_adapter = self.adapter(position.short_exchange)?;

        let long_history = long_adapter
            .fetch_funding_history(&position.symbol, position.created_at, closed_at)
            .await
            .unwrap_or_default();
        let short_history = short_adapter
            .fetch_funding_history(&position.symbol, position.created_at, closed_at)
            .await
            .unwrap_or_default();

        let long_size = position.long_size.unwrap_or(Decimal::ZERO);
        let short_size = position.short_size.unwrap_or(Decimal::ZERO);

        // A long position pays when the rate is positive; a short position
        // receives. Net funding PnL favors the short leg's receipts.
        let long_paid: Decimal = long_history.iter().map(|r| r.rate * long_size).sum();
        let short_received: Decimal = short_history.iter().map(|r| r.rate * short_size).sum();
        Ok(short_received - long_paid)
    }

    /// Both legs already closed out venue-side (spec.md §4.7 step 5,
    /// `BOTH` detection): no counterparty close call is issued, the
    /// position is marked CLOSED directly. `OrderHistoryEntry` carries no
    /// fill price, so the exit price is approximated from the current mark
    /// price, falling back to the entry price if unavailable.
    pub async fn close_both_triggered(&self, position_id: Uuid) -> EngineResult<Position> {
        let mut position = self
            .store
            .get_position(position_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or(EngineError::PositionNotFound(position_id))?;

        let long_adapter = self.adapter(position.long_exchange)?;
        let short_adapter = self.adapter(position.short_exchange)?;
        let long_mark = long_adapter
            .fetch_funding_rate(&position.symbol)
            .await
            .ok()
            .and_then(|r| r.mark_price);
        let short_mark = short_adapter
            .fetch_funding_rate(&position.symbol)
            .await
            .ok()
            .and_then(|r| r.mark_price);

        position.long_exit_price = long_mark.or(position.long_entry_price);
        position.short_exit_price = short_mark.or(position.short_entry_price);
        position.close_reason = Some(CloseReason::BothTriggered);
        self.finalize_closed(&mut position).await?;
        self.store.upsert_position(&position).await.map_err(EngineError::Internal)?;
        Ok(position)
    }

    /// spec.md §4.6 `closeBatch`.
    pub async fn close_batch(&self, _user_id: Uuid, group_id: Uuid) -> EngineResult<BatchCloseResult> {
        let positions = self
            .store
            .list_positions_in_group(group_id)
            .await
            .map_err(EngineError::Internal)?;
        let open_positions: Vec<_> = positions
            .into_iter()
            .filter(|p| p.status == PositionStatus::Open)
            .collect();

        let mut result = BatchCloseResult {
            total_positions: open_positions.len(),
            ..Default::default()
        };

        for position in open_positions {
            let long_result = self
                .close_single_side(position.id, PositionSide::Long, CloseReason::BatchClose)
                .await;
            let outcome = match long_result {
                Ok(_) => {
                    match self
                        .close_single_side(position.id, PositionSide::Short, CloseReason::BatchClose)
                        .await
                    {
                        Ok(_) => {
                            result.closed_positions += 1;
                            PositionOutcome {
                                position_id: position.id,
                                closed: true,
                                error: None,
                            }
                        }
                        Err(e) => {
                            result.failed_positions += 1;
                            PositionOutcome {
                                position_id: position.id,
                                closed: false,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
                Err(e) => {
                    result.failed_positions += 1;
                    PositionOutcome {
                        position_id: position.id,
                        closed: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            result.outcomes.push(outcome);
        }

        Ok(result)
    }

    /// `PATCH /positions/group/{groupId}/mark-closed`: force
    /// {OPEN,PARTIAL,FAILED}→CLOSED with reason MANUAL, bypassing the venue.
    pub async fn mark_closed(&self, group_id: Uuid) -> EngineResult<usize> {
        let positions = self
            .store
            .list_positions_in_group(group_id)
            .await
            .map_err(EngineError::Internal)?;
        let mut count = 0;
        for mut position in positions {
            if matches!(
                position.status,
                PositionStatus::Open | PositionStatus::Partial | PositionStatus::Failed
            ) {
                position.status = PositionStatus::Closed;
                position.close_reason = Some(CloseReason::Manual);
                position.closed_at = Some(Utc::now());
                self.store.upsert_position(&position).await.map_err(EngineError::Internal)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Environment;
    use crate::domain::{CanonicalSymbol, Exchange, FundingRateRecord, RateSource};
    use crate::exchange::{ApiCredentials, ConditionalKind, OrderFill, OrderHistoryEntry, OrderHistoryStatus, PositionSideKind};
    use crate::normalize::CanonicalEvent;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct FakeAdapter {
        exchange: Exchange,
        fail_orders: bool,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
            Ok(FundingRateRecord {
                exchange: self.exchange,
                symbol: symbol.clone(),
                rate: dec!(0.0001),
                mark_price: Some(dec!(50000)),
                next_funding_time: None,
                received_at: Utc::now(),
                source: RateSource::Rest,
                original_interval_hours: 8,
            })
        }

        async fn fetch_funding_history(
            &self,
            _symbol: &CanonicalSymbol,
            _from: chrono::DateTime<Utc>,
            _to: chrono::DateTime<Utc>,
        ) -> EngineResult<Vec<FundingRateRecord>> {
            Ok(Vec::new())
        }

        async fn create_market_order(
            &self,
            _creds: &ApiCredentials,
            _symbol: &CanonicalSymbol,
            _side: OrderSide,
            qty: Decimal,
            _reduce_only: bool,
        ) -> EngineResult<OrderFill> {
            if self.fail_orders {
                return Err(EngineError::ExchangeReject { code: "REJECTED".into() });
            }
            Ok(OrderFill {
                order_id: "order-1".to_string(),
                avg_price: dec!(50000),
                filled_qty: qty,
                fee: Decimal::ZERO,
            })
        }

        async fn set_leverage(&self, _creds: &ApiCredentials, _symbol: &CanonicalSymbol, _leverage: Decimal) -> EngineResult<()> {
            Ok(())
        }

        async fn place_conditional(
            &self,
            _creds: &ApiCredentials,
            _symbol: &CanonicalSymbol,
            _kind: ConditionalKind,
            _trigger_price: Decimal,
            _position_side: PositionSideKind,
        ) -> EngineResult<String> {
            Ok("cond-1".to_string())
        }

        async fn cancel_order(&self, _creds: &ApiCredentials, _order_id: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn check_order_exists(&self, _creds: &ApiCredentials, _order_id: &str) -> EngineResult<bool> {
            Ok(true)
        }

        async fn fetch_order_history(&self, _creds: &ApiCredentials, _order_id: &str) -> EngineResult<OrderHistoryEntry> {
            Ok(OrderHistoryEntry {
                order_id: "order-1".to_string(),
                status: OrderHistoryStatus::Filled,
                updated_at: Utc::now(),
            })
        }

        async fn run_mark_price_stream(
            &self,
            _symbols: Vec<CanonicalSymbol>,
            _tx: mpsc::Sender<CanonicalEvent>,
            _cancel: tokio_util::sync::CancellationToken,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn run_user_data_stream(
            &self,
            _creds: &ApiCredentials,
            _tx: mpsc::Sender<CanonicalEvent>,
            _cancel: tokio_util::sync::CancellationToken,
        ) -> EngineResult<()> {
            Ok(())
        }
    }

    async fn test_coordinator(fail_short: bool) -> (Coordinator, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let credentials = Arc::new(CredentialStore::new(store.clone(), "test-key").unwrap());
        let user_id = Uuid::new_v4();
        credentials
            .save_credentials(user_id, Exchange::Binance, "k", "s", None, Environment::Testnet)
            .await
            .unwrap();
        credentials
            .save_credentials(user_id, Exchange::Okx, "k", "s", None, Environment::Testnet)
            .await
            .unwrap();

        let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Exchange::Binance, Arc::new(FakeAdapter { exchange: Exchange::Binance, fail_orders: false }));
        adapters.insert(Exchange::Okx, Arc::new(FakeAdapter { exchange: Exchange::Okx, fail_orders: fail_short }));

        (Coordinator::new(store, adapters, credentials), user_id)
    }

    #[tokio::test]
    async fn scenario_s2_open_pair_then_close_produces_trade() {
        let (coordinator, user_id) = test_coordinator(false).await;
        let position = coordinator
            .open_pair(user_id, CanonicalSymbol::new("BTCUSDT"), Exchange::Binance, Exchange::Okx, dec!(0.01), dec!(1))
            .await
            .unwrap();
        assert_eq!(position.status, PositionStatus::Open);

        let position = coordinator
            .close_single_side(position.id, PositionSide::Long, CloseReason::Manual)
            .await
            .unwrap();
        assert_eq!(position.status, PositionStatus::Closing);

        let position = coordinator
            .close_single_side(position.id, PositionSide::Short, CloseReason::Manual)
            .await
            .unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn scenario_invariant_5_single_leg_fill_results_in_failed() {
        let (coordinator, user_id) = test_coordinator(true).await;
        let position = coordinator
            .open_pair(user_id, CanonicalSymbol::new("BTCUSDT"), Exchange::Binance, Exchange::Okx, dec!(0.01), dec!(1))
            .await
            .unwrap();
        assert_eq!(position.status, PositionStatus::Failed);
        assert!(position.failure_reason.is_some());
    }

    #[tokio::test]
    async fn scenario_s4_batch_close_skips_already_closed_positions() {
        let (coordinator, user_id) = test_coordinator(false).await;
        let group_id = Uuid::new_v4();

        let mut positions = Vec::new();
        for _ in 0..3 {
            let mut p = coordinator
                .open_pair(user_id, CanonicalSymbol::new("BTCUSDT"), Exchange::Binance, Exchange::Okx, dec!(0.01), dec!(1))
                .await
                .unwrap();
            p.group_id = Some(group_id);
            coordinator.store.upsert_position(&p).await.unwrap();
            positions.push(p);
        }
        // second position already closed out of band
        coordinator.mark_closed_single_for_test(positions[1].id).await;

        let result = coordinator.close_batch(user_id, group_id).await.unwrap();
        assert_eq!(result.total_positions, 2);
        assert_eq!(result.closed_positions, 2);
        assert_eq!(result.failed_positions, 0);
    }

    impl Coordinator {
        async fn mark_closed_single_for_test(&self, position_id: Uuid) {
            let mut p = self.store.get_position(position_id).await.unwrap().unwrap();
            p.status = PositionStatus::Closed;
            self.store.upsert_position(&p).await.unwrap();
        }
    }
}
