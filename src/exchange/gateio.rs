//! Gate.io adapter. Private REST requests sign with HMAC-SHA512; the
//! public WS channel uses `{op: "ping"}` / `{op: "pong"}` frames, the
//! second of the two non-standard ping schemes named in spec.md §4.1.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha512};
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

const REST_BASE: &str = "https://api.gateio.ws";
const WS_URL: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";
const APP_PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct GateioAdapter {
    http: reqwest::Client,
}

impl GateioAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// Gate.io's signed string is `{method}\n{path}\n{query}\n{sha512(body)}\n{timestamp}`.
    fn sign_request(
        creds: &ApiCredentials,
        method: &str,
        path: &str,
        query: &str,
        body: &str,
    ) -> (String, String) {
        let timestamp = Utc::now().timestamp().to_string();
        let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
        let signed_str = format!("{method}\n{path}\n{query}\n{body_hash}\n{timestamp}");
        let signature = super::signing::hmac_sha512_hex(&creds.api_secret, &signed_str);
        (timestamp, signature)
    }
}

impl Default for GateioAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct GateioFundingRate {
    contract: String,
    #[serde(rename = "funding_rate")]
    funding_rate: String,
    #[serde(rename = "funding_next_apply")]
    funding_next_apply: i64,
    #[serde(rename = "mark_price")]
    mark_price: String,
}

#[async_trait]
impl ExchangeAdapter for GateioAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Gateio
    }

    async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
        let contract = symbol::to_venue(symbol, Exchange::Gateio)?;
        let url = format!("{REST_BASE}/api/v4/futures/usdt/contracts/{contract}");
        let resp: GateioFundingRate = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let rate: Decimal = resp
            .funding_rate
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
        let mark_price: Decimal = resp
            .mark_price
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_PRICE".into() })?;

        Ok(FundingRateRecord {
            exchange: Exchange::Gateio,
            symbol: symbol::from_venue(&resp.contract, Exchange::Gateio)?,
            rate,
            mark_price: Some(mark_price),
            next_funding_time: Utc.timestamp_opt(resp.funding_next_apply, 0).single(),
            received_at: Utc::now(),
            source: RateSource::Rest,
            original_interval_hours: 8,
        })
    }

    async fn fetch_funding_history(
        &self,
        symbol: &CanonicalSymbol,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> EngineResult<Vec<FundingRateRecord>> {
        let contract = symbol::to_venue(symbol, Exchange::Gateio)?;
        let url = format!("{REST_BASE}/api/v4/futures/usdt/funding_rate?contract={contract}&limit=100");

        #[derive(Deserialize)]
        struct Entry {
            r: String,
            t: i64,
        }
        let entries: Vec<Entry> = self
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
                    .r
                    .parse()
                    .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
                Ok(FundingRateRecord {
                    exchange: Exchange::Gateio,
                    symbol: symbol.clone(),
                    rate,
                    mark_price: None,
                    next_funding_time: None,
                    received_at: Utc.timestamp_opt(entry.t, 0).single().unwrap_or_else(Utc::now),
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
        let contract = symbol::to_venue(symbol, Exchange::Gateio)?;
        let signed_size = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let body = json!({
            "contract": contract,
            "size": signed_size.to_string(),
            "price": "0",
            "tif": "ioc",
            "reduce_only": reduce_only,
        })
        .to_string();
        let path = "/api/v4/futures/usdt/orders";
        let (timestamp, signature) = Self::sign_request(creds, "POST", path, "", &body);

        #[derive(Deserialize)]
        struct Resp {
            id: i64,
            #[serde(rename = "fill_price")]
            fill_price: Option<String>,
            size: i64,
        }
        let resp: Resp = self
            .http
            .post(format!("{REST_BASE}{path}"))
            .header("KEY", &creds.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        Ok(OrderFill {
            order_id: resp.id.to_string(),
            avg_price: resp
                .fill_price
                .and_then(|p| p.parse().ok())
                .unwrap_or(Decimal::ZERO),
            filled_qty: Decimal::from(resp.size.abs()),
            fee: Decimal::ZERO,
        })
    }

    async fn set_leverage(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        leverage: Decimal,
    ) -> EngineResult<()> {
        let contract = symbol::to_venue(symbol, Exchange::Gateio)?;
        let path = format!("/api/v4/futures/usdt/positions/{contract}/leverage");
        let query = format!("leverage={leverage}");
        let (timestamp, signature) = Self::sign_request(creds, "POST", &path, &query, "");
        self.http
            .post(format!("{REST_BASE}{path}?{query}"))
            .header("KEY", &creds.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp)
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
        let contract = symbol::to_venue(symbol, Exchange::Gateio)?;
        let rule = match (kind, position_side) {
            (ConditionalKind::StopMarket, PositionSideKind::Long) => 2,
            (ConditionalKind::StopMarket, PositionSideKind::Short) => 1,
            (ConditionalKind::TakeProfitMarket, PositionSideKind::Long) => 1,
            (ConditionalKind::TakeProfitMarket, PositionSideKind::Short) => 2,
        };
        let body = json!({
            "initial": { "contract": contract, "size": 0, "price": "0", "tif": "ioc" },
            "trigger": { "strategy_type": 0, "price_type": 0, "price": trigger_price.to_string(), "rule": rule },
        })
        .to_string();
        let path = "/api/v4/futures/usdt/price_orders";
        let (timestamp, signature) = Self::sign_request(creds, "POST", path, "", &body);

        #[derive(Deserialize)]
        struct Resp {
            id: i64,
        }
        let resp: Resp = self
            .http
            .post(format!("{REST_BASE}{path}"))
            .header("KEY", &creds.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(resp.id.to_string())
    }

    async fn cancel_order(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<()> {
        let path = format!("/api/v4/futures/usdt/price_orders/{order_id}");
        let (timestamp, signature) = Self::sign_request(creds, "DELETE", &path, "", "");
        self.http
            .delete(format!("{REST_BASE}{path}"))
            .header("KEY", &creds.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(())
    }

    async fn check_order_exists(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<bool> {
        let path = format!("/api/v4/futures/usdt/price_orders/{order_id}");
        let (timestamp, signature) = Self::sign_request(creds, "GET", &path, "", "");
        let resp = self
            .http
            .get(format!("{REST_BASE}{path}"))
            .header("KEY", &creds.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp)
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
        let path = format!("/api/v4/futures/usdt/price_orders/{order_id}");
        let (timestamp, signature) = Self::sign_request(creds, "GET", &path, "", "");

        #[derive(Deserialize)]
        struct Resp {
            status: String,
            #[serde(rename = "finish_time")]
            finish_time: Option<i64>,
        }
        let resp: Resp = self
            .http
            .get(format!("{REST_BASE}{path}"))
            .header("KEY", &creds.api_key)
            .header("SIGN", signature)
            .header("Timestamp", timestamp)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let status = match resp.status.as_str() {
            "open" => OrderHistoryStatus::New,
            "finished" => OrderHistoryStatus::Triggered,
            "cancelled" => OrderHistoryStatus::Canceled,
            "failed" => OrderHistoryStatus::Expired,
            _ => OrderHistoryStatus::Canceled,
        };

        Ok(OrderHistoryEntry {
            order_id: order_id.to_string(),
            status,
            updated_at: resp
                .finish_time
                .and_then(|t| Utc.timestamp_opt(t, 0).single())
                .unwrap_or_else(Utc::now),
        })
    }

    async fn run_mark_price_stream(
        &self,
        symbols: Vec<CanonicalSymbol>,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let contracts: Vec<String> = symbols
            .iter()
            .filter_map(|s| symbol::to_venue(s, Exchange::Gateio).ok())
            .collect();
        let subscribe_msg = json!({
            "time": Utc::now().timestamp(),
            "channel": "futures.funding_rate",
            "event": "subscribe",
            "payload": contracts,
        });
        run_stream(subscribe_msg, tx, cancel).await
    }

    async fn run_user_data_stream(
        &self,
        creds: &ApiCredentials,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let timestamp = Utc::now().timestamp();
        let signed_str = format!("channel=futures.orders&event=subscribe&time={timestamp}");
        let signature = super::signing::hmac_sha512_hex(&creds.api_secret, &signed_str);
        let subscribe_msg = json!({
            "time": timestamp,
            "channel": "futures.orders",
            "event": "subscribe",
            "auth": { "method": "api_key", "KEY": creds.api_key, "SIGN": signature },
        });
        run_stream(subscribe_msg, tx, cancel).await
    }
}

async fn run_stream(
    subscribe_msg: serde_json::Value,
    tx: Sender<CanonicalEvent>,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let request = WS_URL
        .into_client_request()
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();
    let _ = write.send(Message::Text(subscribe_msg.to_string())).await;

    let mut ping_timer = tokio::time::interval(APP_PING_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping_timer.tick() => {
                let ping = json!({ "time": Utc::now().timestamp(), "channel": "futures.ping" });
                let _ = write.send(Message::Text(ping.to_string())).await;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = forward_raw_payload(&text, &tx).await {
                            crate::normalize::reject_malformed(Exchange::Gateio, "ws_stream", &text, err);
                        }
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

async fn forward_raw_payload(text: &str, tx: &Sender<CanonicalEvent>) -> Result<(), String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    if value.get("channel").and_then(|v| v.as_str()) != Some("futures.funding_rate") {
        return Ok(());
    }
    let Some(result) = value.get("result") else { return Ok(()) };
    let entries: Vec<&serde_json::Value> = match result.as_array() {
        Some(arr) => arr.iter().collect(),
        None => vec![result],
    };
    for entry in entries {
        let contract = entry.get("contract").and_then(|v| v.as_str()).ok_or("missing contract")?;
        let rate = entry
            .get("r")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let event = CanonicalEvent::FundingRateReceived {
            exchange: Exchange::Gateio,
            symbol: symbol::from_venue(contract, Exchange::Gateio).map_err(|e| e.to_string())?,
            funding_rate: rate,
            next_funding_time: None,
            mark_price: None,
            source: RateSource::Websocket,
            received_at: Utc::now(),
            original_interval_hours: 8,
        };
        let _ = tx.send(event).await;
    }
    Ok(())
}
