//! Conditional-Order Monitor (C7): singleton background loop polling for
//! stop-loss/take-profit triggers (spec.md §4.7).

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::domain::{close_reason_for_trigger, CloseReason, Exchange, Position, PositionSide};
use crate::error::EngineResult;
use crate::exchange::ExchangeAdapter;
use crate::store::Store;
use crate::coordinator::Coordinator;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    LongSl,
    LongTp,
    ShortSl,
    ShortTp,
    Both,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    TriggerDetected { position_id: Uuid, trigger: TriggerType },
    TriggerCloseProgress { position_id: Uuid },
    TriggerCloseSuccess { position_id: Uuid },
    TriggerCloseFailed { position_id: Uuid, reason: String },
}

pub struct Monitor {
    store: Store,
    adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
    credentials: Arc<CredentialStore>,
    coordinator: Arc<Coordinator>,
    seen: RwLock<HashSet<(Exchange, String)>>,
    events: broadcast::Sender<MonitorEvent>,
    running: AtomicBool,
    initialized: AtomicBool,
}

pub struct MonitorStatus {
    pub initialized: bool,
    pub is_running: bool,
    pub interval_ms: u64,
}

impl Monitor {
    pub fn new(
        store: Store,
        adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
        credentials: Arc<CredentialStore>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            adapters,
            credentials,
            coordinator,
            seen: RwLock::new(HashSet::new()),
            events,
            running: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            is_running: self.running.load(Ordering::SeqCst),
            interval_ms: MONITOR_INTERVAL.as_millis() as u64,
        }
    }

    /// Runs the 30 s polling loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        self.initialized.store(true, Ordering::SeqCst);
        let mut ticker = interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.running.store(true, Ordering::SeqCst);
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "conditional-order monitor tick failed");
                    }
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// One monitor tick (spec.md §4.7 steps 1-6).
    pub async fn tick(&self) -> EngineResult<()> {
        let positions = self.store.list_open_positions_with_conditional_orders_set().await
            .map_err(crate::error::EngineError::Internal)?;
        for position in positions {
            if let Err(e) = self.check_position(&position).await {
                tracing::warn!(position_id = %position.id, error = %e, "conditional-order check failed");
            }
        }
        Ok(())
    }

    async fn check_position(&self, position: &Position) -> EngineResult<()> {
        let long_adapter = self.adapters.get(&position.long_exchange).cloned();
        let short_adapter = self.adapters.get(&position.short_exchange).cloned();
        let (Some(long_adapter), Some(short_adapter)) = (long_adapter, short_adapter) else {
            return Ok(());
        };
        let long_creds = self.credentials.get_credentials(position.user_id, position.long_exchange).await?;
        let short_creds = self.credentials.get_credentials(position.user_id, position.short_exchange).await?;
        let (Some(long_creds), Some(short_creds)) = (long_creds, short_creds) else {
            return Ok(());
        };

        let mut missing: Vec<(TriggerType, Exchange, String)> = Vec::new();
        for (slot, order_id) in [
            (TriggerType::LongSl, &position.conditional_orders.long_sl),
            (TriggerType::LongTp, &position.conditional_orders.long_tp),
        ] {
            if let Some(id) = order_id {
                if !long_adapter.check_order_exists(&long_creds, id).await.unwrap_or(true) {
                    missing.push((slot, position.long_exchange, id.clone()));
                }
            }
        }
        for (slot, order_id) in [
            (TriggerType::ShortSl, &position.conditional_orders.short_sl),
            (TriggerType::ShortTp, &position.conditional_orders.short_tp),
        ] {
            if let Some(id) = order_id {
                if !short_adapter.check_order_exists(&short_creds, id).await.unwrap_or(true) {
                    missing.push((slot, position.short_exchange, id.clone()));
                }
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        let is_long_side_missing = missing.iter().any(|(t, ..)| matches!(t, TriggerType::LongSl | TriggerType::LongTp));
        let is_short_side_missing = missing.iter().any(|(t, ..)| matches!(t, TriggerType::ShortSl | TriggerType::ShortTp));
        let trigger = if is_long_side_missing && is_short_side_missing {
            TriggerType::Both
        } else {
            missing[0].0
        };

        // Confirm every missing order via order history; any order that
        // isn't TRIGGERED/FILLED (e.g. CANCELED/EXPIRED) aborts this tick's
        // action for the whole position, matching "confirm via fetchOrderHistory".
        for (_, exchange, order_id) in &missing {
            let adapter = if *exchange == position.long_exchange { &long_adapter } else { &short_adapter };
            let creds = if *exchange == position.long_exchange { &long_creds } else { &short_creds };
            let confirmed = adapter
                .fetch_order_history(creds, order_id)
                .await
                .map(|entry| entry.status.confirms_trigger())
                .unwrap_or(false);
            if !confirmed {
                return Ok(());
            }
        }

        // Dedup: a (exchange, orderId) pair already acted upon must not
        // trigger again across ticks.
        {
            let mut seen = self.seen.write();
            let all_seen = missing.iter().all(|(_, ex, id)| seen.contains(&(*ex, id.clone())));
            if all_seen {
                return Ok(());
            }
            for (_, ex, id) in &missing {
                seen.insert((*ex, id.clone()));
            }
        }

        let _ = self.events.send(MonitorEvent::TriggerDetected { position_id: position.id, trigger });
        let _ = self.events.send(MonitorEvent::TriggerCloseProgress { position_id: position.id });

        let outcome = match trigger {
            TriggerType::Both => self.coordinator.close_both_triggered(position.id).await,
            TriggerType::LongSl => self.coordinator.close_single_side(position.id, PositionSide::Short, close_reason_for_trigger(PositionSide::Long, true)).await,
            TriggerType::LongTp => self.coordinator.close_single_side(position.id, PositionSide::Short, close_reason_for_trigger(PositionSide::Long, false)).await,
            TriggerType::ShortSl => self.coordinator.close_single_side(position.id, PositionSide::Long, close_reason_for_trigger(PositionSide::Short, true)).await,
            TriggerType::ShortTp => self.coordinator.close_single_side(position.id, PositionSide::Long, close_reason_for_trigger(PositionSide::Short, false)).await,
        };

        match outcome {
            Ok(_) => {
                let _ = self.events.send(MonitorEvent::TriggerCloseSuccess { position_id: position.id });
            }
            Err(e) => {
                // Failure policy: leave the position PARTIAL, emit an
                // emergency notification, and do not retry automatically —
                // the next tick re-detects.
                let _ = self.events.send(MonitorEvent::TriggerCloseFailed { position_id: position.id, reason: e.to_string() });
                tracing::error!(position_id = %position.id, error = %e, "emergency: conditional-order close failed, leaving PARTIAL");
                if let Ok(Some(mut p)) = self.store.get_position(position.id).await {
                    p.status = crate::domain::PositionStatus::Partial;
                    let _ = self.store.upsert_position(&p).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Environment;
    use crate::domain::{CanonicalSymbol, FundingRateRecord, PositionStatus, RateSource};
    use crate::exchange::{ApiCredentials, ConditionalKind, OrderFill, OrderHistoryEntry, OrderHistoryStatus, OrderSide, PositionSideKind};
    use crate::normalize::CanonicalEvent;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct ScriptedAdapter {
        exchange: Exchange,
        missing_order_ids: HashSet<String>,
        history_status: OrderHistoryStatus,
    }

    #[async_trait]
    impl ExchangeAdapter for ScriptedAdapter {
        fn exchange(&self) -> Exchange {
            self.exchange
        }
        async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
            Ok(FundingRateRecord {
                exchange: self.exchange,
                symbol: symbol.clone(),
                rate: Decimal::ZERO,
                mark_price: Some(dec!(50000)),
                next_funding_time: None,
                received_at: Utc::now(),
                source: RateSource::Rest,
                original_interval_hours: 8,
            })
        }
        async fn fetch_funding_history(&self, _s: &CanonicalSymbol, _f: chrono::DateTime<Utc>, _t: chrono::DateTime<Utc>) -> EngineResult<Vec<FundingRateRecord>> {
            Ok(Vec::new())
        }
        async fn create_market_order(&self, _c: &ApiCredentials, _s: &CanonicalSymbol, _side: OrderSide, qty: Decimal, _r: bool) -> EngineResult<OrderFill> {
            Ok(OrderFill { order_id: "x".into(), avg_price: dec!(50000), filled_qty: qty, fee: Decimal::ZERO })
        }
        async fn set_leverage(&self, _c: &ApiCredentials, _s: &CanonicalSymbol, _l: Decimal) -> EngineResult<()> {
            Ok(())
        }
        async fn place_conditional(&self, _c: &ApiCredentials, _s: &CanonicalSymbol, _k: ConditionalKind, _t: Decimal, _p: PositionSideKind) -> EngineResult<String> {
            Ok("cond".into())
        }
        async fn cancel_order(&self, _c: &ApiCredentials, _o: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn check_order_exists(&self, _c: &ApiCredentials, order_id: &str) -> EngineResult<bool> {
            Ok(!self.missing_order_ids.contains(order_id))
        }
        async fn fetch_order_history(&self, _c: &ApiCredentials, order_id: &str) -> EngineResult<OrderHistoryEntry> {
            Ok(OrderHistoryEntry { order_id: order_id.to_string(), status: self.history_status, updated_at: Utc::now() })
        }
        async fn run_mark_price_stream(&self, _s: Vec<CanonicalSymbol>, _tx: mpsc::Sender<CanonicalEvent>, _c: tokio_util::sync::CancellationToken) -> EngineResult<()> {
            Ok(())
        }
        async fn run_user_data_stream(&self, _c: &ApiCredentials, _tx: mpsc::Sender<CanonicalEvent>, _cancel: tokio_util::sync::CancellationToken) -> EngineResult<()> {
            Ok(())
        }
    }

    async fn setup(missing_long_sl: bool, history_status: OrderHistoryStatus) -> (Monitor, Uuid, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let credentials = Arc::new(CredentialStore::new(store.clone(), "k").unwrap());
        let user_id = Uuid::new_v4();
        credentials.save_credentials(user_id, Exchange::Binance, "k", "s", None, Environment::Testnet).await.unwrap();
        credentials.save_credentials(user_id, Exchange::Okx, "k", "s", None, Environment::Testnet).await.unwrap();

        let mut missing = HashSet::new();
        if missing_long_sl {
            missing.insert("long-sl-1".to_string());
        }
        let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Exchange::Binance, Arc::new(ScriptedAdapter { exchange: Exchange::Binance, missing_order_ids: missing, history_status }));
        adapters.insert(Exchange::Okx, Arc::new(ScriptedAdapter { exchange: Exchange::Okx, missing_order_ids: HashSet::new(), history_status }));

        let coordinator = Arc::new(Coordinator::new(store.clone(), adapters.clone(), credentials.clone()));

        let mut position = Position::new_pending(user_id, CanonicalSymbol::new("BTCUSDT"), Exchange::Binance, Exchange::Okx, dec!(1), dec!(1));
        position.status = PositionStatus::Open;
        position.long_entry_price = Some(dec!(50000));
        position.short_entry_price = Some(dec!(50100));
        position.long_size = Some(dec!(0.01));
        position.short_size = Some(dec!(0.01));
        position.conditional_orders.long_sl = Some("long-sl-1".to_string());
        position.conditional_orders.short_sl = Some("short-sl-1".to_string());
        let position_id = position.id;
        store.upsert_position(&position).await.unwrap();

        (Monitor::new(store, adapters, credentials, coordinator), position_id, user_id)
    }

    #[tokio::test]
    async fn scenario_s3_confirmed_long_sl_trigger_closes_short_leg() {
        let (monitor, position_id, _user_id) = setup(true, OrderHistoryStatus::Triggered).await;
        monitor.tick().await.unwrap();
        let position = monitor.store.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(position.close_reason, Some(CloseReason::LongSlTriggered));
    }

    #[tokio::test]
    async fn unconfirmed_missing_order_does_not_trigger_a_close() {
        let (monitor, position_id, _user_id) = setup(true, OrderHistoryStatus::Canceled).await;
        monitor.tick().await.unwrap();
        let position = monitor.store.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(position.close_reason, None);
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_trigger_the_same_order_twice() {
        let (monitor, position_id, _user_id) = setup(true, OrderHistoryStatus::Triggered).await;
        monitor.tick().await.unwrap();
        let after_first = monitor.store.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(after_first.close_reason, Some(CloseReason::LongSlTriggered));

        // Second tick: dedup set already contains this (exchange, orderId).
        monitor.tick().await.unwrap();
        let after_second = monitor.store.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(after_second.status, after_first.status);
    }
}
