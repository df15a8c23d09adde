//! MEXC adapter. Public WS channel expects an application-layer
//! `{"method":"ping"}` every 20s, replying `{"method":"pong"}` — the first
//! of the two non-standard ping schemes named in spec.md §4.1.

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

const REST_BASE: &str = "https://contract.mexc.com";
const WS_URL: &str = "wss://contract.mexc.com/edge";
const APP_PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct MexcAdapter {
    http: reqwest::Client,
}

impl MexcAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// MEXC signs `accessKey + timestamp + paramString`.
    fn sign(creds: &ApiCredentials, timestamp: &str, param_string: &str) -> String {
        let payload = format!("{}{timestamp}{param_string}", creds.api_key);
        super::signing::hmac_sha256_hex(&creds.api_secret, &payload)
    }
}

impl Default for MexcAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct MexcFundingRateData {
    symbol: String,
    #[serde(rename = "fundingRate")]
    funding_rate: f64,
    #[serde(rename = "nextSettleTime")]
    next_settle_time: i64,
}

#[derive(Debug, Deserialize)]
struct MexcEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct MexcTicker {
    #[serde(rename = "fairPrice")]
    fair_price: f64,
}

#[async_trait]
impl ExchangeAdapter for MexcAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
    }

    async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
        let venue_symbol = symbol::to_venue(symbol, Exchange::Mexc)?;
        let url = format!("{REST_BASE}/api/v1/contract/funding_rate/{venue_symbol}");
        let envelope: MexcEnvelope<MexcFundingRateData> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let ticker_url = format!("{REST_BASE}/api/v1/contract/ticker?symbol={venue_symbol}");
        let ticker_envelope: MexcEnvelope<MexcTicker> = self
            .http
            .get(&ticker_url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let rate = Decimal::try_from(envelope.data.funding_rate)
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
        let mark_price = Decimal::try_from(ticker_envelope.data.fair_price).ok();

        Ok(FundingRateRecord {
            exchange: Exchange::Mexc,
            symbol: symbol::from_venue(&envelope.data.symbol, Exchange::Mexc)?,
            rate,
            mark_price,
            next_funding_time: millis_to_datetime(envelope.data.next_settle_time),
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Mexc)?;
        let url = format!(
            "{REST_BASE}/api/v1/contract/funding_rate/history?symbol={venue_symbol}&page_size=100"
        );

        #[derive(Deserialize)]
        struct Entry {
            symbol: String,
            #[serde(rename = "fundingRate")]
            funding_rate: f64,
            #[serde(rename = "settleTime")]
            settle_time: i64,
        }
        #[derive(Deserialize)]
        struct HistoryData {
            #[serde(rename = "resultList")]
            result_list: Vec<Entry>,
        }
        let envelope: MexcEnvelope<HistoryData> = self
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
            .result_list
            .into_iter()
            .map(|entry| {
                let rate = Decimal::try_from(entry.funding_rate)
                    .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
                Ok(FundingRateRecord {
                    exchange: Exchange::Mexc,
                    symbol: symbol::from_venue(&entry.symbol, Exchange::Mexc)?,
                    rate,
                    mark_price: None,
                    next_funding_time: None,
                    received_at: millis_to_datetime(entry.settle_time).unwrap_or_else(Utc::now),
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Mexc)?;
        let side_code = match side {
            OrderSide::Buy => 1,
            OrderSide::Sell => 3,
        };
        let body = json!({
            "symbol": venue_symbol,
            "side": side_code,
            "type": 5,
            "vol": qty.to_string(),
            "openType": 2,
            "reduceOnly": reduce_only,
        })
        .to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = Self::sign(creds, &timestamp, &body);

        #[derive(Deserialize)]
        struct OrderData {
            #[serde(rename = "orderId")]
            order_id: String,
        }
        let envelope: MexcEnvelope<OrderData> = self
            .http
            .post(format!("{REST_BASE}/api/v1/private/order/submit"))
            .header("ApiKey", &creds.api_key)
            .header("Request-Time", &timestamp)
            .header("Signature", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        Ok(OrderFill {
            order_id: envelope.data.order_id,
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Mexc)?;
        let body = json!({ "symbol": venue_symbol, "leverage": leverage.to_string(), "openType": 2 }).to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = Self::sign(creds, &timestamp, &body);
        self.http
            .post(format!("{REST_BASE}/api/v1/private/position/change_leverage"))
            .header("ApiKey", &creds.api_key)
            .header("Request-Time", &timestamp)
            .header("Signature", signature)
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Mexc)?;
        let close_side = match position_side {
            PositionSideKind::Long => 2,
            PositionSideKind::Short => 4,
        };
        let execute_cycle = match kind {
            ConditionalKind::StopMarket => "loss",
            ConditionalKind::TakeProfitMarket => "profit",
        };
        let body = json!({
            "symbol": venue_symbol,
            "side": close_side,
            "triggerPrice": trigger_price.to_string(),
            "executeCycle": execute_cycle,
            "trend": 1,
            "orderType": 5,
        })
        .to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = Self::sign(creds, &timestamp, &body);

        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "orderId")]
            order_id: String,
        }
        let envelope: MexcEnvelope<Resp> = self
            .http
            .post(format!("{REST_BASE}/api/v1/private/planorder/place"))
            .header("ApiKey", &creds.api_key)
            .header("Request-Time", &timestamp)
            .header("Signature", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(envelope.data.order_id)
    }

    async fn cancel_order(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<()> {
        let body = json!([order_id]).to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = Self::sign(creds, &timestamp, &body);
        self.http
            .post(format!("{REST_BASE}/api/v1/private/planorder/cancel"))
            .header("ApiKey", &creds.api_key)
            .header("Request-Time", &timestamp)
            .header("Signature", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(())
    }

    async fn check_order_exists(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<bool> {
        let param_string = format!("order_id={order_id}");
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = Self::sign(creds, &timestamp, &param_string);
        let resp = self
            .http
            .get(format!("{REST_BASE}/api/v1/private/planorder/list/current?{param_string}"))
            .header("ApiKey", &creds.api_key)
            .header("Request-Time", &timestamp)
            .header("Signature", signature)
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
        let param_string = format!("order_id={order_id}");
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = Self::sign(creds, &timestamp, &param_string);

        #[derive(Deserialize)]
        struct Entry {
            state: i32,
            #[serde(rename = "updateTime")]
            update_time: i64,
        }
        let envelope: MexcEnvelope<Vec<Entry>> = self
            .http
            .get(format!("{REST_BASE}/api/v1/private/planorder/list/history?{param_string}"))
            .header("ApiKey", &creds.api_key)
            .header("Request-Time", &timestamp)
            .header("Signature", signature)
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

        // MEXC plan-order states: 1=uninformed, 2=uninformed(fail), 3=executed, 4=canceled, 5=invalid.
        let status = match entry.state {
            3 => OrderHistoryStatus::Triggered,
            4 => OrderHistoryStatus::Canceled,
            5 => OrderHistoryStatus::Expired,
            _ => OrderHistoryStatus::New,
        };

        Ok(OrderHistoryEntry {
            order_id: order_id.to_string(),
            status,
            updated_at: millis_to_datetime(entry.update_time).unwrap_or_else(Utc::now),
        })
    }

    async fn run_mark_price_stream(
        &self,
        symbols: Vec<CanonicalSymbol>,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let venue_symbols: Vec<String> = symbols
            .iter()
            .filter_map(|s| symbol::to_venue(s, Exchange::Mexc).ok())
            .collect();
        run_stream(venue_symbols, tx, cancel).await
    }

    async fn run_user_data_stream(
        &self,
        _creds: &ApiCredentials,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        run_stream(Vec::new(), tx, cancel).await
    }
}

async fn run_stream(
    symbols: Vec<String>,
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

    for venue_symbol in &symbols {
        let subscribe_msg = json!({ "method": "sub.funding.rate", "param": { "symbol": venue_symbol } });
        let _ = write.send(Message::Text(subscribe_msg.to_string())).await;
    }

    let mut ping_timer = tokio::time::interval(APP_PING_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping_timer.tick() => {
                let _ = write.send(Message::Text(json!({ "method": "ping" }).to_string())).await;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.contains("\"pong\"") {
                            continue;
                        }
                        if let Err(err) = forward_raw_payload(&text, &tx).await {
                            crate::normalize::reject_malformed(Exchange::Mexc, "ws_stream", &text, err);
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
    if value.get("channel").and_then(|v| v.as_str()) != Some("push.funding.rate") {
        return Ok(());
    }
    let data = value.get("data").ok_or("missing data")?;
    let venue_symbol = data.get("symbol").and_then(|v| v.as_str()).ok_or("missing symbol")?;
    let rate = data
        .get("fundingRate")
        .and_then(|v| v.as_f64())
        .and_then(|f| Decimal::try_from(f).ok());

    let event = CanonicalEvent::FundingRateReceived {
        exchange: Exchange::Mexc,
        symbol: symbol::from_venue(venue_symbol, Exchange::Mexc).map_err(|e| e.to_string())?,
        funding_rate: rate,
        next_funding_time: None,
        mark_price: None,
        source: RateSource::Websocket,
        received_at: Utc::now(),
        original_interval_hours: 8,
    };
    let _ = tx.send(event).await;
    Ok(())
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
