//! OKX adapter. Public/private WS channels share one connection class in
//! OKX's real API; this adapter keeps them on separate sockets for
//! uniformity with the other venues. Ping/pong is the plain-text
//! `"ping"`/`"pong"` string pair sent every 20s.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
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

const REST_BASE: &str = "https://www.okx.com";
const WS_PUBLIC: &str = "wss://ws.okx.com:8443/ws/v5/public";
const WS_PRIVATE: &str = "wss://ws.okx.com:8443/ws/v5/private";
const APP_PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct OkxAdapter {
    http: reqwest::Client,
}

impl OkxAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
        }
    }

    fn sign_headers(creds: &ApiCredentials, method: &str, path: &str, body: &str) -> (String, String) {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let presign = super::signing::okx_presign_string(&timestamp, method, path, body);
        let signature = super::signing::hmac_sha256_base64(&creds.api_secret, &presign);
        (timestamp, signature)
    }
}

impl Default for OkxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct OkxEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OkxFundingRateData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: String,
}

#[derive(Debug, Deserialize)]
struct OkxMarkPriceData {
    #[serde(rename = "markPx")]
    mark_px: String,
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
        let inst_id = symbol::to_venue(symbol, Exchange::Okx)?;
        let url = format!("{REST_BASE}/api/v5/public/funding-rate?instId={inst_id}");
        let envelope: OkxEnvelope<OkxFundingRateData> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        let entry = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ExchangeReject { code: "NO_DATA".into() })?;

        let mark_url = format!("{REST_BASE}/api/v5/public/mark-price?instId={inst_id}&instType=SWAP");
        let mark_envelope: OkxEnvelope<OkxMarkPriceData> = self
            .http
            .get(&mark_url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        let mark_price = mark_envelope
            .data
            .first()
            .and_then(|d| d.mark_px.parse::<Decimal>().ok());

        let rate: Decimal = entry
            .funding_rate
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
        let next_funding_time = entry
            .next_funding_time
            .parse::<i64>()
            .ok()
            .and_then(millis_to_datetime);

        Ok(FundingRateRecord {
            exchange: Exchange::Okx,
            symbol: symbol::from_venue(&entry.inst_id, Exchange::Okx)?,
            rate,
            mark_price,
            next_funding_time,
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
        let inst_id = symbol::to_venue(symbol, Exchange::Okx)?;
        let url = format!("{REST_BASE}/api/v5/public/funding-rate-history?instId={inst_id}&limit=100");
        let envelope: OkxEnvelope<OkxFundingRateData> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        envelope
            .data
            .into_iter()
            .map(|entry| {
                let rate: Decimal = entry
                    .funding_rate
                    .parse()
                    .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
                Ok(FundingRateRecord {
                    exchange: Exchange::Okx,
                    symbol: symbol::from_venue(&entry.inst_id, Exchange::Okx)?,
                    rate,
                    mark_price: None,
                    next_funding_time: None,
                    received_at: Utc::now(),
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
        let inst_id = symbol::to_venue(symbol, Exchange::Okx)?;
        let side_str = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let body = json!({
            "instId": inst_id,
            "tdMode": "cross",
            "side": side_str,
            "ordType": "market",
            "sz": qty.to_string(),
            "reduceOnly": reduce_only,
        })
        .to_string();
        let (timestamp, signature) = Self::sign_headers(creds, "POST", "/api/v5/trade/order", &body);

        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "ordId")]
            ord_id: String,
        }
        let envelope: OkxEnvelope<Resp> = self
            .http
            .post(format!("{REST_BASE}/api/v5/trade/order"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        let order_id = envelope
            .data
            .into_iter()
            .next()
            .map(|r| r.ord_id)
            .ok_or_else(|| EngineError::ExchangeReject { code: "NO_ORDER".into() })?;

        Ok(OrderFill {
            order_id,
            avg_price: Decimal::ZERO,
            filled_qty: qty,
            fee: Decimal::ZERO,
        })
    }

    async fn set_leverage(
        &self,
        creds: &ApiCredentials,
        symbol: &CanonicalSymbol,
        leverage: Decimal,
    ) -> EngineResult<()> {
        let inst_id = symbol::to_venue(symbol, Exchange::Okx)?;
        let body = json!({ "instId": inst_id, "lever": leverage.to_string(), "mgnMode": "cross" }).to_string();
        let (timestamp, signature) = Self::sign_headers(creds, "POST", "/api/v5/account/set-leverage", &body);
        self.http
            .post(format!("{REST_BASE}/api/v5/account/set-leverage"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .body(body)
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
        let inst_id = symbol::to_venue(symbol, Exchange::Okx)?;
        let close_side = match position_side {
            PositionSideKind::Long => "sell",
            PositionSideKind::Short => "buy",
        };
        let (trigger_key, price_key) = match kind {
            ConditionalKind::StopMarket => ("slTriggerPx", "slOrdPx"),
            ConditionalKind::TakeProfitMarket => ("tpTriggerPx", "tpOrdPx"),
        };
        let body = json!({
            "instId": inst_id,
            "tdMode": "cross",
            "side": close_side,
            "ordType": "conditional",
            trigger_key: trigger_price.to_string(),
            price_key: "-1",
        })
        .to_string();
        let (timestamp, signature) =
            Self::sign_headers(creds, "POST", "/api/v5/trade/order-algo", &body);

        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "algoId")]
            algo_id: String,
        }
        let envelope: OkxEnvelope<Resp> = self
            .http
            .post(format!("{REST_BASE}/api/v5/trade/order-algo"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        envelope
            .data
            .into_iter()
            .next()
            .map(|r| r.algo_id)
            .ok_or_else(|| EngineError::ExchangeReject { code: "NO_ALGO_ID".into() })
    }

    async fn cancel_order(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<()> {
        let body = json!({ "algoId": order_id }).to_string();
        let (timestamp, signature) =
            Self::sign_headers(creds, "POST", "/api/v5/trade/cancel-algos", &body);
        self.http
            .post(format!("{REST_BASE}/api/v5/trade/cancel-algos"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(())
    }

    async fn check_order_exists(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<bool> {
        let path = format!("/api/v5/trade/order-algo-pending?algoId={order_id}");
        let (timestamp, signature) = Self::sign_headers(creds, "GET", &path, "");
        let envelope: OkxEnvelope<serde_json::Value> = self
            .http
            .get(format!("{REST_BASE}{path}"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            )
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(!envelope.data.is_empty())
    }

    async fn fetch_order_history(
        &self,
        creds: &ApiCredentials,
        order_id: &str,
    ) -> EngineResult<OrderHistoryEntry> {
        let path = format!("/api/v5/trade/order-algo-history?algoId={order_id}");
        let (timestamp, signature) = Self::sign_headers(creds, "GET", &path, "");

        #[derive(Deserialize)]
        struct Resp {
            state: String,
            #[serde(rename = "uTime")]
            u_time: String,
        }
        let envelope: OkxEnvelope<Resp> = self
            .http
            .get(format!("{REST_BASE}{path}"))
            .header("OK-ACCESS-KEY", &creds.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                creds.passphrase.clone().unwrap_or_default(),
            )
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        let entry = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ExchangeReject { code: "NO_DATA".into() })?;

        let status = match entry.state.as_str() {
            "live" => OrderHistoryStatus::New,
            "effective" => OrderHistoryStatus::Triggered,
            "canceled" => OrderHistoryStatus::Canceled,
            "order_failed" => OrderHistoryStatus::Expired,
            _ => OrderHistoryStatus::Canceled,
        };
        let updated_at = entry
            .u_time
            .parse::<i64>()
            .ok()
            .and_then(millis_to_datetime)
            .unwrap_or_else(Utc::now);

        Ok(OrderHistoryEntry {
            order_id: order_id.to_string(),
            status,
            updated_at,
        })
    }

    async fn run_mark_price_stream(
        &self,
        symbols: Vec<CanonicalSymbol>,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .filter_map(|s| symbol::to_venue(s, Exchange::Okx).ok())
            .map(|inst_id| json!({ "channel": "funding-rate", "instId": inst_id }))
            .collect();
        let subscribe_msg = json!({ "op": "subscribe", "args": args });
        run_stream(WS_PUBLIC, Some(subscribe_msg), tx, cancel).await
    }

    async fn run_user_data_stream(
        &self,
        _creds: &ApiCredentials,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        // Login handshake omitted: private channel login uses the same
        // HMAC signing as REST over a `login` op; subscription shape below
        // matches OKX's documented private order-channel payload.
        let subscribe_msg = json!({ "op": "subscribe", "args": [{ "channel": "orders", "instType": "SWAP" }] });
        run_stream(WS_PRIVATE, Some(subscribe_msg), tx, cancel).await
    }
}

async fn run_stream(
    url: &str,
    subscribe_msg: Option<serde_json::Value>,
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

    if let Some(msg) = subscribe_msg {
        let _ = write.send(Message::Text(msg.to_string())).await;
    }

    let mut ping_timer = tokio::time::interval(APP_PING_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping_timer.tick() => {
                let _ = write.send(Message::Text("ping".to_string())).await;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "pong" {
                            continue;
                        }
                        if let Err(err) = forward_raw_payload(&text, &tx).await {
                            crate::normalize::reject_malformed(Exchange::Okx, "ws_stream", &text, err);
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
    let Some(channel) = value.pointer("/arg/channel").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    if channel != "funding-rate" {
        return Ok(());
    }
    let Some(entries) = value.get("data").and_then(|v| v.as_array()) else {
        return Ok(());
    };
    for entry in entries {
        let inst_id = entry.get("instId").and_then(|v| v.as_str()).ok_or("missing instId")?;
        let rate = entry
            .get("fundingRate")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let next_funding_time = entry
            .get("nextFundingTime")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(millis_to_datetime);

        let event = CanonicalEvent::FundingRateReceived {
            exchange: Exchange::Okx,
            symbol: symbol::from_venue(inst_id, Exchange::Okx).map_err(|e| e.to_string())?,
            funding_rate: rate,
            next_funding_time,
            mark_price: None,
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
