//! Exchange Adapter (C1): per-venue REST + WS client exposing a uniform
//! capability set (spec.md §4.1).

pub mod bingx;
pub mod binance;
pub mod gateio;
pub mod mexc;
pub mod okx;
pub mod signing;
pub mod symbol;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{CanonicalSymbol, Exchange, FundingRateRecord};
use crate::error::EngineResult;
use crate::normalize::CanonicalEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionalKind {
    StopMarket,
    TakeProfitMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSideKind {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: Decimal,
    pub filled_qty: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderHistoryStatus {
    New,
    PartiallyFilled,
    Filled,
    Triggered,
    Canceled,
    Expired,
}

impl OrderHistoryStatus {
    /// Only `TRIGGERED`/`FILLED` confirm a conditional-order trigger
    /// (spec.md §4.7 step 4); `CANCELED`/`EXPIRED` do not.
    pub fn confirms_trigger(&self) -> bool {
        matches!(self, OrderHistoryStatus::Triggered | OrderHistoryStatus::Filled)
    }
}

#[derive(Debug, Clone)]
pub struct OrderHistoryEntry {
    pub order_id: String,
    pub status: OrderHistoryStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

/// Per-venue REST + WS capability set. Object-safe so adapters can be held
/// as `Arc<dyn ExchangeAdapter>` behind a single `Runtime` registry.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord>;

    async fn fetch_funding_history(
        &self,
        symbol: &CanonicalSymbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<FundingRateRecord>>;

    async fn create_market_order(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> EngineResult<OrderFill>;

    async fn set_leverage(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        leverage: Decimal,
    ) -> EngineResult<()>;

    async fn place_conditional(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        kind: ConditionalKind,
        trigger_price: Decimal,
        position_side: PositionSideKind,
    ) -> EngineResult<String>;

    async fn cancel_order(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<()>;

    async fn check_order_exists(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<bool>;

    async fn fetch_order_history(
        &self,
        creds: &ApiCredentials,
        order_id: &str,
    ) -> EngineResult<OrderHistoryEntry>;

    /// Opens a raw websocket subscription for mark price / funding rate
    /// updates and forwards normalized events on `tx`. Runs until the
    /// manager cancels it; see `crate::ws`.
    async fn run_mark_price_stream(
        &self,
        symbols: Vec<CanonicalSymbol>,
        tx: tokio::sync::mpsc::Sender<CanonicalEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> EngineResult<()>;

    /// Opens the private user-data stream (order updates, balance changes)
    /// for one user, managing listen-key lifecycle where applicable.
    async fn run_user_data_stream(
        &self,
        creds: &ApiCredentials,
        tx: tokio::sync::mpsc::Sender<CanonicalEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> EngineResult<()>;
}
