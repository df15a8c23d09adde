//! Binance USD-M futures adapter. Uses a listen-key for the private
//! user-data stream (refreshed every 25 min) and standard WS ping/pong
//! frames for the public mark-price stream.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{
    symbol, ApiCredentials, ConditionalKind, ExchangeAdapter, OrderFill, OrderHistoryEntry,
    OrderHistoryStatus, OrderSide, PositionSideKind,
};
use crate::domain::{CanonicalSymbol, Exchange, FundingRateRecord, RateSource};
use crate::error::{EngineError, EngineResult};
use crate::normalize::CanonicalEvent;

const REST_BASE: &str = "https://fapi.binance.com";
const WS_BASE: &str = "wss://fstream.binance.com/stream";
const LISTEN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(25 * 60);

pub struct BinanceAdapter {
    http: reqwest::Client,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
        }
    }

    fn sign_query(creds: &ApiCredentials, query: &str) -> String {
        super::signing::hmac_sha256_hex(&creds.api_secret, query)
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct PremiumIndexResponse {
    symbol: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct FundingRateHistoryEntry {
    symbol: String,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "fundingTime")]
    funding_time: i64,
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
        let venue_symbol = super::symbol::to_venue(symbol, Exchange::Binance)?;
        let url = format!("{REST_BASE}/fapi/v1/premiumIndex?symbol={venue_symbol}");
        let resp: PremiumIndexResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let rate: Decimal = resp
            .last_funding_rate
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
        let mark_price: Decimal = resp
            .mark_price
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_PRICE".into() })?;
        let next_funding_time = millis_to_datetime(resp.next_funding_time);

        Ok(FundingRateRecord {
            exchange: Exchange::Binance,
            symbol: symbol::from_venue(&resp.symbol, Exchange::Binance)?,
            rate,
            mark_price: Some(mark_price),
            next_funding_time,
            received_at: Utc::now(),
            source: RateSource::Rest,
            original_interval_hours: 8,
        })
    }

    async fn fetch_funding_history(
        &self,
        symbol: &CanonicalSymbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<FundingRateRecord>> {
        let venue_symbol = symbol::to_venue(symbol, Exchange::Binance)?;
        let url = format!(
            "{REST_BASE}/fapi/v1/fundingRate?symbol={venue_symbol}&startTime={}&endTime={}&limit=1000",
            from.timestamp_millis(),
            to.timestamp_millis()
        );
        let entries: Vec<FundingRateHistoryEntry> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        entries
            .into_iter()
            .map(|entry| {
                let rate: Decimal = entry
                    .funding_rate
                    .parse()
                    .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
                Ok(FundingRateRecord {
                    exchange: Exchange::Binance,
                    symbol: symbol::from_venue(&entry.symbol, Exchange::Binance)?,
                    rate,
                    mark_price: None,
                    next_funding_time: None,
                    received_at: millis_to_datetime(entry.funding_time).unwrap_or_else(Utc::now),
                    source: RateSource::Rest,
                    original_interval_hours: 8,
                })
            })
            .collect()
    }

    async fn create_market_order(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> EngineResult<OrderFill> {
        let venue_symbol = symbol::to_venue(symbol, Exchange::Binance)?;
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let timestamp = Utc::now().timestamp_millis();
        let query = format!(
            "symbol={venue_symbol}&side={side_str}&type=MARKET&quantity={qty}&reduceOnly={reduce_only}&timestamp={timestamp}"
        );
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/fapi/v1/order?{query}&signature={signature}");

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EngineError::ExchangeReject {
                code: format!("HTTP_{}", resp.status().as_u16()),
            });
        }

        #[derive(Deserialize)]
        struct OrderResponse {
            #[serde(rename = "orderId")]
            order_id: i64,
            #[serde(rename = "avgPrice")]
            avg_price: String,
            #[serde(rename = "executedQty")]
            executed_qty: String,
        }
        let parsed: OrderResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        Ok(OrderFill {
            order_id: parsed.order_id.to_string(),
            avg_price: parsed.avg_price.parse().unwrap_or(Decimal::ZERO),
            filled_qty: parsed.executed_qty.parse().unwrap_or(Decimal::ZERO),
            fee: Decimal::ZERO,
        })
    }

    async fn set_leverage(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        leverage: Decimal,
    ) -> EngineResult<()> {
        let venue_symbol = symbol::to_venue(symbol, Exchange::Binance)?;
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("symbol={venue_symbol}&leverage={leverage}&timestamp={timestamp}");
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/fapi/v1/leverage?{query}&signature={signature}");
        self.http
            .post(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(())
    }

    async fn place_conditional(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        kind: ConditionalKind,
        trigger_price: Decimal,
        position_side: PositionSideKind,
    ) -> EngineResult<String> {
        let venue_symbol = symbol::to_venue(symbol, Exchange::Binance)?;
        let order_type = match kind {
            ConditionalKind::StopMarket => "STOP_MARKET",
            ConditionalKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        };
        let close_side = match position_side {
            PositionSideKind::Long => "SELL",
            PositionSideKind::Short => "BUY",
        };
        let timestamp = Utc::now().timestamp_millis();
        let query = format!(
            "symbol={venue_symbol}&side={close_side}&type={order_type}&stopPrice={trigger_price}&closePosition=true&timestamp={timestamp}"
        );
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/fapi/v1/order?{query}&signature={signature}");

        #[derive(Deserialize)]
        struct OrderResponse {
            #[serde(rename = "orderId")]
            order_id: i64,
        }
        let resp: OrderResponse = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(resp.order_id.to_string())
    }

    async fn cancel_order(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<()> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("orderId={order_id}&timestamp={timestamp}");
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/fapi/v1/order?{query}&signature={signature}");
        self.http
            .delete(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(())
    }

    async fn check_order_exists(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<bool> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("orderId={order_id}&timestamp={timestamp}");
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/fapi/v1/openOrder?{query}&signature={signature}");
        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    async fn fetch_order_history(
        &self,
        creds: &ApiCredentials,
        order_id: &str,
    ) -> EngineResult<OrderHistoryEntry> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("orderId={order_id}&timestamp={timestamp}");
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/fapi/v1/order?{query}&signature={signature}");

        #[derive(Deserialize)]
        struct OrderResponse {
            status: String,
            #[serde(rename = "updateTime")]
            update_time: i64,
        }
        let resp: OrderResponse = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let status = match resp.status.as_str() {
            "NEW" => OrderHistoryStatus::New,
            "PARTIALLY_FILLED" => OrderHistoryStatus::PartiallyFilled,
            "FILLED" => OrderHistoryStatus::Filled,
            "CANCELED" => OrderHistoryStatus::Canceled,
            "EXPIRED" => OrderHistoryStatus::Expired,
            "NEW_INSURANCE" | "NEW_ADL" => OrderHistoryStatus::Triggered,
            _ => OrderHistoryStatus::Canceled,
        };

        Ok(OrderHistoryEntry {
            order_id: order_id.to_string(),
            status,
            updated_at: millis_to_datetime(resp.update_time).unwrap_or_else(Utc::now),
        })
    }

    async fn run_mark_price_stream(
        &self,
        symbols: Vec<CanonicalSymbol>,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let streams: Vec<String> = symbols
            .iter()
            .filter_map(|s| symbol::to_venue(s, Exchange::Binance).ok())
            .map(|s| format!("{}@markPrice@1s", s.to_lowercase()))
            .collect();
        let url = format!("{WS_BASE}?streams={}", streams.join("/"));

        run_public_stream(&url, tx, cancel).await
    }

    async fn run_user_data_stream(
        &self,
        creds: &ApiCredentials,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let listen_key = create_listen_key(&self.http, creds).await?;
        let url = format!("wss://fstream.binance.com/ws/{listen_key}");

        let refresh_http = self.http.clone();
        let refresh_creds = creds.clone();
        let refresh_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(LISTEN_KEY_REFRESH_INTERVAL) => {
                        let _ = refresh_listen_key(&refresh_http, &refresh_creds).await;
                    }
                    _ = refresh_cancel.cancelled() => break,
                }
            }
        });

        let result = run_public_stream(&url, tx, cancel).await;
        let _ = delete_listen_key(&self.http, creds).await;
        result
    }
}

async fn create_listen_key(http: &reqwest::Client, creds: &ApiCredentials) -> EngineResult<String> {
    #[derive(Deserialize)]
    struct Resp {
        #[serde(rename = "listenKey")]
        listen_key: String,
    }
    let resp: Resp = http
        .post(format!("{REST_BASE}/fapi/v1/listenKey"))
        .header("X-MBX-APIKEY", &creds.api_key)
        .send()
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
        .json()
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    Ok(resp.listen_key)
}

async fn refresh_listen_key(http: &reqwest::Client, creds: &ApiCredentials) -> EngineResult<()> {
    http.put(format!("{REST_BASE}/fapi/v1/listenKey"))
        .header("X-MBX-APIKEY", &creds.api_key)
        .send()
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    Ok(())
}

async fn delete_listen_key(http: &reqwest::Client, creds: &ApiCredentials) -> EngineResult<()> {
    http.delete(format!("{REST_BASE}/fapi/v1/listenKey"))
        .header("X-MBX-APIKEY", &creds.api_key)
        .send()
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    Ok(())
}

/// Shared raw-tungstenite loop for Binance's standard-WS-ping venues:
/// replies to control-frame pings automatically (handled by
/// tokio-tungstenite) and forwards text frames to the caller for
/// normalization. Grounded on the teacher's `dome_websocket.rs` client
/// loop shape.
async fn run_public_stream(
    url: &str,
    tx: Sender<CanonicalEvent>,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let request = url
        .into_client_request()
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = forward_raw_payload(Exchange::Binance, &text, &tx).await {
                            crate::normalize::reject_malformed(Exchange::Binance, "mark_price_stream", &text, err);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    Ok(())
}

async fn forward_raw_payload(
    exchange: Exchange,
    text: &str,
    tx: &Sender<CanonicalEvent>,
) -> Result<(), String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let data = value.get("data").unwrap_or(&value);
    if data.get("e").and_then(|v| v.as_str()) == Some("markPriceUpdate") {
        let symbol_raw = data.get("s").and_then(|v| v.as_str()).ok_or("missing symbol")?;
        let rate_raw = data.get("r").and_then(|v| v.as_str());
        let mark_price_raw = data.get("p").and_then(|v| v.as_str());
        let next_funding_time = data
            .get("T")
            .and_then(|v| v.as_i64())
            .and_then(millis_to_datetime);

        let event = CanonicalEvent::FundingRateReceived {
            exchange,
            symbol: symbol::from_venue(symbol_raw, exchange).map_err(|e| e.to_string())?,
            funding_rate: rate_raw.and_then(|r| r.parse().ok()),
            next_funding_time,
            mark_price: mark_price_raw.and_then(|p| p.parse().ok()),
            source: RateSource::Websocket,
            received_at: Utc::now(),
            original_interval_hours: 8,
        };
        let _ = tx.send(event).await;
    }
    Ok(())
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_query_is_deterministic_hex() {
        let creds = ApiCredentials {
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: None,
        };
        let sig = BinanceAdapter::sign_query(&creds, "symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig.len(), 64);
    }
}
