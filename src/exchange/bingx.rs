//! BingX perpetual-swap adapter. WS payloads arrive gzip-compressed; the
//! adapter tries gunzip first and falls back to raw UTF-8 if that fails
//! (spec.md §4.1). Listen-key lifecycle mirrors Binance's. A single socket
//! accepts at most 50 subscribed channels, so callers with more symbols get
//! sharded across multiple connections.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::io::Read;
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

const REST_BASE: &str = "https://open-api.bingx.com";
const WS_MARKET_URL: &str = "wss://open-api-swap.bingx.com/swap-market";
const WS_USER_URL: &str = "wss://open-api-swap.bingx.com/swap-market";
const LISTEN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(25 * 60);
const MAX_CHANNELS_PER_SOCKET: usize = 50;

pub struct BingxAdapter {
    http: reqwest::Client,
}

impl BingxAdapter {
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

impl Default for BingxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct BingxEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct BingxPremiumIndex {
    symbol: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[async_trait]
impl ExchangeAdapter for BingxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bingx
    }

    async fn fetch_funding_rate(&self, symbol: &CanonicalSymbol) -> EngineResult<FundingRateRecord> {
        let venue_symbol = symbol::to_venue(symbol, Exchange::Bingx)?;
        let url = format!("{REST_BASE}/openApi/swap/v2/quote/premiumIndex?symbol={venue_symbol}");
        let envelope: BingxEnvelope<BingxPremiumIndex> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let rate: Decimal = envelope
            .data
            .last_funding_rate
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_RATE".into() })?;
        let mark_price: Decimal = envelope
            .data
            .mark_price
            .parse()
            .map_err(|_| EngineError::ExchangeReject { code: "BAD_PRICE".into() })?;

        Ok(FundingRateRecord {
            exchange: Exchange::Bingx,
            symbol: symbol::from_venue(&envelope.data.symbol, Exchange::Bingx)?,
            rate,
            mark_price: Some(mark_price),
            next_funding_time: millis_to_datetime(envelope.data.next_funding_time),
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Bingx)?;
        let url = format!(
            "{REST_BASE}/openApi/swap/v2/quote/fundingRate?symbol={venue_symbol}&startTime={}&endTime={}&limit=1000",
            from.timestamp_millis(),
            to.timestamp_millis()
        );

        #[derive(Deserialize)]
        struct Entry {
            symbol: String,
            #[serde(rename = "fundingRate")]
            funding_rate: String,
            #[serde(rename = "fundingTime")]
            funding_time: i64,
        }
        let envelope: BingxEnvelope<Vec<Entry>> = self
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
                    exchange: Exchange::Bingx,
                    symbol: symbol::from_venue(&entry.symbol, Exchange::Bingx)?,
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Bingx)?;
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let timestamp = Utc::now().timestamp_millis();
        let query = format!(
            "symbol={venue_symbol}&side={side_str}&type=MARKET&quantity={qty}&reduceOnly={reduce_only}&timestamp={timestamp}"
        );
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/openApi/swap/v2/trade/order?{query}&signature={signature}");

        #[derive(Deserialize)]
        struct OrderData {
            #[serde(rename = "orderId")]
            order_id: i64,
        }
        let envelope: BingxEnvelope<OrderData> = self
            .http
            .post(&url)
            .header("X-BX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        Ok(OrderFill {
            order_id: envelope.data.order_id.to_string(),
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Bingx)?;
        let timestamp = Utc::now().timestamp_millis();
        let query = format!(
            "symbol={venue_symbol}&side=BOTH&leverage={leverage}&timestamp={timestamp}"
        );
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/openApi/swap/v2/trade/leverage?{query}&signature={signature}");
        self.http
            .post(&url)
            .header("X-BX-APIKEY", &creds.api_key)
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
        let venue_symbol = symbol::to_venue(symbol, Exchange::Bingx)?;
        let order_type = match kind {
            ConditionalKind::StopMarket => "STOP_MARKET",
            ConditionalKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        };
        let (close_side, position_side_str) = match position_side {
            PositionSideKind::Long => ("SELL", "LONG"),
            PositionSideKind::Short => ("BUY", "SHORT"),
        };
        let timestamp = Utc::now().timestamp_millis();
        let query = format!(
            "symbol={venue_symbol}&side={close_side}&positionSide={position_side_str}&type={order_type}&stopPrice={trigger_price}&timestamp={timestamp}"
        );
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/openApi/swap/v2/trade/order?{query}&signature={signature}");

        #[derive(Deserialize)]
        struct OrderData {
            #[serde(rename = "orderId")]
            order_id: i64,
        }
        let envelope: BingxEnvelope<OrderData> = self
            .http
            .post(&url)
            .header("X-BX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(envelope.data.order_id.to_string())
    }

    async fn cancel_order(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<()> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("orderId={order_id}&timestamp={timestamp}");
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/openApi/swap/v2/trade/order?{query}&signature={signature}");
        self.http
            .delete(&url)
            .header("X-BX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
        Ok(())
    }

    async fn check_order_exists(&self, creds: &ApiCredentials, order_id: &str) -> EngineResult<bool> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("orderId={order_id}&timestamp={timestamp}");
        let signature = Self::sign_query(creds, &query);
        let url = format!("{REST_BASE}/openApi/swap/v2/trade/openOrder?{query}&signature={signature}");
        let resp = self
            .http
            .get(&url)
            .header("X-BX-APIKEY", &creds.api_key)
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
        let url = format!("{REST_BASE}/openApi/swap/v2/trade/order?{query}&signature={signature}");

        #[derive(Deserialize)]
        struct OrderData {
            status: String,
            #[serde(rename = "updateTime")]
            update_time: i64,
        }
        let envelope: BingxEnvelope<OrderData> = self
            .http
            .get(&url)
            .header("X-BX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
            .json()
            .await
            .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;

        let status = match envelope.data.status.as_str() {
            "NEW" => OrderHistoryStatus::New,
            "PARTIALLY_FILLED" => OrderHistoryStatus::PartiallyFilled,
            "FILLED" => OrderHistoryStatus::Filled,
            "CANCELLED" | "CANCELED" => OrderHistoryStatus::Canceled,
            "EXPIRED" => OrderHistoryStatus::Expired,
            "TRIGGERED" => OrderHistoryStatus::Triggered,
            _ => OrderHistoryStatus::Canceled,
        };

        Ok(OrderHistoryEntry {
            order_id: order_id.to_string(),
            status,
            updated_at: millis_to_datetime(envelope.data.update_time).unwrap_or_else(Utc::now),
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
            .filter_map(|s| symbol::to_venue(s, Exchange::Bingx).ok())
            .collect();

        // Shard into socket-sized batches and run them concurrently under
        // one cancellation token; a failure in one shard does not bring
        // down the others.
        let shards: Vec<Vec<String>> = venue_symbols
            .chunks(MAX_CHANNELS_PER_SOCKET)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut handles = Vec::new();
        for shard in shards {
            let shard_tx = tx.clone();
            let shard_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _ = run_market_shard(shard, shard_tx, shard_cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn run_user_data_stream(
        &self,
        creds: &ApiCredentials,
        tx: Sender<CanonicalEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let listen_key = create_listen_key(&self.http, creds).await?;
        let url = format!("{WS_USER_URL}?listenKey={listen_key}");

        let refresh_http = self.http.clone();
        let refresh_creds = creds.clone();
        let refresh_cancel = cancel.clone();
        let refresh_listen_key_val = listen_key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(LISTEN_KEY_REFRESH_INTERVAL) => {
                        let _ = refresh_listen_key(&refresh_http, &refresh_creds, &refresh_listen_key_val).await;
                    }
                    _ = refresh_cancel.cancelled() => break,
                }
            }
        });

        let result = run_stream(&url, Vec::new(), tx, cancel).await;
        let _ = delete_listen_key(&self.http, creds, &listen_key).await;
        result
    }
}

async fn create_listen_key(http: &reqwest::Client, creds: &ApiCredentials) -> EngineResult<String> {
    let timestamp = Utc::now().timestamp_millis();
    let query = format!("timestamp={timestamp}");
    let signature = BingxAdapter::sign_query(creds, &query);
    #[derive(Deserialize)]
    struct Resp {
        #[serde(rename = "listenKey")]
        listen_key: String,
    }
    let envelope: BingxEnvelope<Resp> = http
        .post(format!(
            "{REST_BASE}/openApi/user/auth/userDataStream?{query}&signature={signature}"
        ))
        .header("X-BX-APIKEY", &creds.api_key)
        .send()
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?
        .json()
        .await
        .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    Ok(envelope.data.listen_key)
}

async fn refresh_listen_key(
    http: &reqwest::Client,
    creds: &ApiCredentials,
    listen_key: &str,
) -> EngineResult<()> {
    let timestamp = Utc::now().timestamp_millis();
    let query = format!("listenKey={listen_key}&timestamp={timestamp}");
    let signature = BingxAdapter::sign_query(creds, &query);
    http.put(format!(
        "{REST_BASE}/openApi/user/auth/userDataStream?{query}&signature={signature}"
    ))
    .header("X-BX-APIKEY", &creds.api_key)
    .send()
    .await
    .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    Ok(())
}

async fn delete_listen_key(
    http: &reqwest::Client,
    creds: &ApiCredentials,
    listen_key: &str,
) -> EngineResult<()> {
    let timestamp = Utc::now().timestamp_millis();
    let query = format!("listenKey={listen_key}&timestamp={timestamp}");
    let signature = BingxAdapter::sign_query(creds, &query);
    http.delete(format!(
        "{REST_BASE}/openApi/user/auth/userDataStream?{query}&signature={signature}"
    ))
    .header("X-BX-APIKEY", &creds.api_key)
    .send()
    .await
    .map_err(|e| EngineError::ExchangeConnection(e.to_string()))?;
    Ok(())
}

async fn run_market_shard(
    venue_symbols: Vec<String>,
    tx: Sender<CanonicalEvent>,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let channels: Vec<String> = venue_symbols
        .iter()
        .map(|s| format!("{s}@markPrice"))
        .collect();
    run_stream(WS_MARKET_URL, channels, tx, cancel).await
}

/// Shared raw-tungstenite loop. BingX frames arrive as binary gzip; the
/// decoder tries gunzip first and falls back to treating the frame as raw
/// UTF-8 text if that fails. Standard WS control-frame pings are answered
/// automatically by tokio-tungstenite.
async fn run_stream(
    url: &str,
    channels: Vec<String>,
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

    for channel in &channels {
        let subscribe_msg = json!({ "id": uuid_like(), "reqType": "sub", "dataType": channel });
        let _ = write.send(Message::Text(subscribe_msg.to_string())).await;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = decode_payload(&bytes);
                        if text.trim() == "Ping" {
                            let _ = write.send(Message::Text("Pong".into())).await;
                            continue;
                        }
                        if let Err(err) = forward_raw_payload(&text, &tx).await {
                            crate::normalize::reject_malformed(Exchange::Bingx, "ws_stream", &text, err);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.trim() == "Ping" {
                            let _ = write.send(Message::Text("Pong".into())).await;
                            continue;
                        }
                        if let Err(err) = forward_raw_payload(&text, &tx).await {
                            crate::normalize::reject_malformed(Exchange::Bingx, "ws_stream", &text, err);
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

/// Tries gunzip first, falls back to raw UTF-8 on decode failure.
fn decode_payload(bytes: &[u8]) -> String {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    match decoder.read_to_string(&mut out) {
        Ok(_) => out,
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

async fn forward_raw_payload(text: &str, tx: &Sender<CanonicalEvent>) -> Result<(), String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let data_type = value.get("dataType").and_then(|v| v.as_str()).unwrap_or("");
    if !data_type.ends_with("@markPrice") {
        return Ok(());
    }
    let data = value.get("data").ok_or("missing data")?;
    let venue_symbol = data.get("s").and_then(|v| v.as_str()).ok_or("missing symbol")?;
    let rate = data
        .get("r")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Decimal>().ok());
    let mark_price = data
        .get("p")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Decimal>().ok());
    let next_funding_time = data.get("T").and_then(|v| v.as_i64()).and_then(millis_to_datetime);

    let event = CanonicalEvent::FundingRateReceived {
        exchange: Exchange::Bingx,
        symbol: symbol::from_venue(venue_symbol, Exchange::Bingx).map_err(|e| e.to_string())?,
        funding_rate: rate,
        next_funding_time,
        mark_price,
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

/// Cheap monotonic-ish request id for subscribe frames; BingX does not
/// require uniqueness beyond distinguishing requests in logs.
fn uuid_like() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_payload_falls_back_to_utf8_for_non_gzip_bytes() {
        let raw = b"{\"dataType\":\"BTC-USDT@markPrice\"}";
        assert_eq!(decode_payload(raw), String::from_utf8_lossy(raw));
    }

    #[test]
    fn channel_sharding_respects_fifty_per_socket_limit() {
        let symbols: Vec<String> = (0..120).map(|i| format!("SYM{i}")).collect();
        let shards: Vec<Vec<String>> = symbols
            .chunks(MAX_CHANNELS_PER_SOCKET)
            .map(|c| c.to_vec())
            .collect();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].len(), 50);
        assert_eq!(shards[2].len(), 20);
    }
}
