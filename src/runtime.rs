//! The in-process facade (spec.md §2, §6: "external HTTP entry points call
//! C6/C4 via an in-process façade that the HTTP collaborator holds").
//! `Runtime` owns every process-wide singleton named in spec.md §9
//! (Conditional-Order Monitor, encryption key holder, funding-rate-pair
//! table, caches) and is constructed once in `Runtime::init` — nothing here
//! relies on lazy module-load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{AccountType, RateLimiter, TtlCache, ACCOUNT_TYPE_CACHE_TTL, MARKETS_CACHE_TTL};
use crate::config::Config;
use crate::coordinator::{BatchCloseResult, Coordinator};
use crate::credentials::CredentialStore;
use crate::domain::{
    ArbitrageOpportunity, CanonicalSymbol, Exchange, FundingRatePair, OpportunityEndHistory,
    Position, Trade,
};
use crate::error::{EngineError, EngineResult};
use crate::exchange::bingx::BingxAdapter;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::gateio::GateioAdapter;
use crate::exchange::mexc::MexcAdapter;
use crate::exchange::okx::OkxAdapter;
use crate::exchange::ExchangeAdapter;
use crate::monitor::{Monitor, MonitorStatus};
use crate::normalize::CanonicalEvent;
use crate::store::Store;
use crate::tracker::{self, Tracker};
use crate::ws::{ConnectionManagerState, ConnectionState, SharedConnectionManager};

/// Symbol universe the funding-rate fan-in tracks. A real deployment would
/// load this from the out-of-scope "static symbol-group configuration"
/// collaborator (spec.md §1); the engine pins a representative default set.
pub const TRACKED_SYMBOLS: [&str; 5] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT"];

/// Periodic cadence of the funding-pair detection → tracker sweep cycle.
pub const DETECTION_CYCLE_INTERVAL: Duration = Duration::from_secs(5);

pub struct PerConnectionHealth {
    pub exchange: Exchange,
    pub state: ConnectionState,
    pub health: crate::ws::health::HealthState,
}

pub struct Runtime {
    pub config: Config,
    pub store: Store,
    pub credentials: Arc<CredentialStore>,
    pub adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
    pub coordinator: Arc<Coordinator>,
    pub monitor: Arc<Monitor>,
    pub tracker: Arc<Tracker>,
    pub pairs: RwLock<HashMap<CanonicalSymbol, FundingRatePair>>,
    pub connections: RwLock<HashMap<Exchange, SharedConnectionManager>>,
    pub rate_limiter: RateLimiter,
    pub markets_cache: TtlCache<Exchange, Arc<Vec<String>>>,
    pub account_type_cache: TtlCache<(Uuid, Exchange), AccountType>,
    cancel: CancellationToken,
}

impl Runtime {
    /// `Runtime.init()` sequence (spec.md §9): builds every process-wide
    /// singleton once, in dependency order, and returns a handle the caller
    /// keeps for the life of the process.
    pub fn init(config: Config) -> EngineResult<Arc<Self>> {
        let store = Store::open(&config.database_url).map_err(EngineError::Internal)?;
        let credentials = Arc::new(CredentialStore::new(store.clone(), &config.encryption_key)?);

        let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Exchange::Binance, Arc::new(BinanceAdapter::new()));
        adapters.insert(Exchange::Okx, Arc::new(OkxAdapter::new()));
        adapters.insert(Exchange::Gateio, Arc::new(GateioAdapter::new()));
        adapters.insert(Exchange::Mexc, Arc::new(MexcAdapter::new()));
        adapters.insert(Exchange::Bingx, Arc::new(BingxAdapter::new()));

        let coordinator = Arc::new(Coordinator::new(store.clone(), adapters.clone(), credentials.clone()));
        let monitor = Arc::new(Monitor::new(store.clone(), adapters.clone(), credentials.clone(), coordinator.clone()));
        let tracker = Arc::new(Tracker::new());

        let mut connections = HashMap::new();
        for exchange in Exchange::ALL {
            connections.insert(exchange, Arc::new(ConnectionManagerState::new(Default::default())));
        }

        Ok(Arc::new(Self {
            config,
            store,
            credentials,
            adapters,
            coordinator,
            monitor,
            tracker,
            pairs: RwLock::new(HashMap::new()),
            connections: RwLock::new(connections),
            rate_limiter: RateLimiter::new(),
            markets_cache: TtlCache::new(MARKETS_CACHE_TTL),
            account_type_cache: TtlCache::new(ACCOUNT_TYPE_CACHE_TTL),
            cancel: CancellationToken::new(),
        }))
    }

    /// Spawns every background worker named in spec.md §5: one per venue
    /// WS connection, the Opportunity Tracker's sweep, and the singleton
    /// Conditional-Order Monitor. Returns their join handles so the caller
    /// can await a graceful shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for exchange in Exchange::ALL {
            let rt = self.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                rt.run_mark_price_fanin(exchange, cancel).await;
            }));
        }

        {
            let rt = self.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                rt.run_detection_cycle(cancel).await;
            }));
        }

        {
            let monitor = self.monitor.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                monitor.run(cancel).await;
            }));
        }

        handles
    }

    /// One venue's WS Connection Manager (C2) wrapping its adapter's
    /// `run_mark_price_stream` (C1), with reconnect/backoff/resubscribe
    /// driven by `crate::ws` (spec.md §4.2).
    async fn run_mark_price_fanin(self: Arc<Self>, exchange: Exchange, cancel: CancellationToken) {
        let Some(adapter) = self.adapters.get(&exchange).cloned() else {
            return;
        };
        let manager = self.connections.read().get(&exchange).cloned();
        let Some(manager) = manager else { return };
        let symbols: Vec<CanonicalSymbol> = TRACKED_SYMBOLS.iter().map(|s| CanonicalSymbol::new(*s)).collect();
        for symbol in &symbols {
            manager.subscriptions.write().subscribe(
                format!("{}@markPrice", symbol.as_str()),
                serde_json::json!({ "symbol": symbol.as_str() }),
            );
        }

        loop {
            if cancel.is_cancelled() {
                manager.transition_disconnected();
                return;
            }
            manager.transition_connecting();
            let (tx, mut rx) = tokio::sync::mpsc::channel::<CanonicalEvent>(1024);
            let was_reconnecting = manager.transition_connected();
            let _ = crate::ws::resubscribe_after_reconnect(&manager, was_reconnecting).await;

            let stream_cancel = cancel.clone();
            let stream_adapter = adapter.clone();
            let stream_symbols = symbols.clone();
            let stream_task = tokio::spawn(async move {
                stream_adapter.run_mark_price_stream(stream_symbols, tx, stream_cancel).await
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stream_task.abort();
                        manager.transition_disconnected();
                        return;
                    }
                    event = rx.recv() => {
                        match event {
                            Some(CanonicalEvent::FundingRateReceived { exchange, symbol, funding_rate, next_funding_time, mark_price, source, received_at, original_interval_hours }) => {
                                manager.on_message_received();
                                if let Some(rate) = funding_rate {
                                    self.apply_funding_rate(crate::domain::FundingRateRecord {
                                        exchange, symbol, rate, mark_price, next_funding_time,
                                        received_at, source, original_interval_hours,
                                    }).await;
                                }
                            }
                            Some(_) => manager.on_message_received(),
                            None => break,
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                manager.transition_disconnected();
                return;
            }
            if !crate::ws::await_reconnect_delay(&manager).await {
                tracing::error!(exchange = %exchange, "mark-price stream exhausted reconnect attempts");
                return;
            }
        }
    }

    async fn apply_funding_rate(&self, record: crate::domain::FundingRateRecord) {
        let mut pairs = self.pairs.write();
        pairs
            .entry(record.symbol.clone())
            .or_insert_with(|| FundingRatePair::new(record.symbol.clone()))
            .upsert(&record);
    }

    /// The Funding Pair Engine's detection cycle (C4) feeding the
    /// Opportunity Tracker (C5), run on a fixed cadence rather than solely
    /// on each WS message, so the periodic disappearance sweep (spec.md
    /// §4.5) has a regular heartbeat even during quiet periods.
    async fn run_detection_cycle(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(DETECTION_CYCLE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let detected = {
                        let pairs = self.pairs.read();
                        tracker::detect(&pairs)
                    };
                    let outcome = self.tracker.run_cycle(&detected, Utc::now());
                    for opp in &outcome.active {
                        if let Err(e) = self.store.upsert_opportunity(opp).await {
                            tracing::warn!(error = %e, "failed to persist active opportunity");
                        }
                    }
                    for ended in &outcome.ended {
                        if let Err(e) = self.store.insert_opportunity_end_history(ended).await {
                            tracing::warn!(error = %e, "failed to persist opportunity end history");
                        }
                    }
                }
            }
        }
    }

    // ---- Façade methods consumed by the HTTP collaborator --------------

    pub fn funding_rates_snapshot(&self) -> Vec<FundingRatePair> {
        self.pairs.read().values().cloned().collect()
    }

    pub fn active_opportunities(&self, symbol: Option<&CanonicalSymbol>, limit: usize) -> Vec<ArbitrageOpportunity> {
        let mut opps = self.tracker.active_opportunities(symbol);
        opps.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        opps.truncate(limit);
        opps
    }

    pub async fn public_opportunity_history(
        &self,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<OpportunityEndHistory>> {
        self.store
            .list_opportunity_end_history(limit, offset)
            .await
            .map_err(EngineError::Internal)
    }

    pub async fn refresh_market_data(
        &self,
        symbol: &CanonicalSymbol,
        exchanges: &[Exchange],
    ) -> EngineResult<Vec<crate::domain::FundingRateRecord>> {
        let mut out = Vec::with_capacity(exchanges.len());
        for exchange in exchanges {
            if let Some(adapter) = self.adapters.get(exchange) {
                let record = adapter.fetch_funding_rate(symbol).await?;
                self.apply_funding_rate(record.clone()).await;
                out.push(record);
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open_pair(
        &self,
        user_id: Uuid,
        symbol: CanonicalSymbol,
        long_exchange: Exchange,
        short_exchange: Exchange,
        qty: Decimal,
        leverage: Decimal,
    ) -> EngineResult<Position> {
        self.coordinator
            .open_pair(user_id, symbol, long_exchange, short_exchange, qty, leverage)
            .await
    }

    pub async fn close_position(&self, position_id: Uuid) -> EngineResult<Position> {
        let position = self
            .store
            .get_position(position_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or(EngineError::PositionNotFound(position_id))?;
        self.coordinator
            .close_single_side(position_id, crate::domain::PositionSide::Long, crate::domain::CloseReason::Manual)
            .await?;
        self.coordinator
            .close_single_side(position_id, crate::domain::PositionSide::Short, crate::domain::CloseReason::Manual)
            .await
            .map_err(|e| {
                tracing::warn!(position_id = %position.id, error = %e, "short leg close failed after long leg closed");
                e
            })
    }

    pub async fn close_batch(&self, user_id: Uuid, group_id: Uuid) -> EngineResult<BatchCloseResult> {
        self.coordinator.close_batch(user_id, group_id).await
    }

    pub async fn mark_group_closed(&self, group_id: Uuid) -> EngineResult<usize> {
        self.coordinator.mark_closed(group_id).await
    }

    pub async fn list_trades(&self, limit: i64, offset: i64) -> EngineResult<Vec<Trade>> {
        self.store.list_trades(limit, offset).await.map_err(EngineError::Internal)
    }

    pub async fn trade_funding_details(&self, trade_id: Uuid) -> EngineResult<Trade> {
        self.store
            .get_trade(trade_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or(EngineError::TradeNotFound(trade_id))
    }

    pub fn monitor_status(&self) -> MonitorStatus {
        self.monitor.status()
    }

    pub fn ws_status(&self) -> Vec<PerConnectionHealth> {
        self.connections
            .read()
            .iter()
            .map(|(exchange, manager)| PerConnectionHealth {
                exchange: *exchange,
                state: manager.current_state(),
                health: manager.health(),
            })
            .collect()
    }

    /// Graceful shutdown (spec.md §5): cancel every worker, then wait up to
    /// 5s for them to drain in-flight work before returning.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        self.cancel.cancel();
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        let joined = futures_util::future::join_all(handles);
        tokio::select! {
            _ = joined => {}
            _ = &mut deadline => {
                tracing::warn!("graceful shutdown deadline elapsed with workers still draining");
            }
        }
    }
}
