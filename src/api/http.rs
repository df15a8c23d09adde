//! HTTP route handlers (spec.md §6). Every handler only translates its
//! request into a `Runtime` facade call and wraps the result in the
//! `{success,data}` / `{success:false,error}` envelope — no business logic
//! lives here.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api::AuthUser;
use crate::domain::{CanonicalInterval, CanonicalSymbol, Exchange};
use crate::error::{EngineError, EngineResult};
use crate::middleware::{market_data_refresh_rate_limit, public_opportunities_rate_limit, request_logging};
use crate::runtime::Runtime;

pub fn router(runtime: Arc<Runtime>) -> Router {
    let public_opportunities = Router::new()
        .route("/public/opportunities", get(public_opportunities))
        .layer(axum_middleware::from_fn_with_state(
            runtime.clone(),
            public_opportunities_rate_limit,
        ));

    let market_data_refresh = Router::new()
        .route("/market-data/refresh", get(refresh_market_data))
        .layer(axum_middleware::from_fn_with_state(
            runtime.clone(),
            market_data_refresh_rate_limit,
        ));

    Router::new()
        .route("/funding-rates", get(funding_rates))
        .route("/opportunities", get(active_opportunities))
        .merge(public_opportunities)
        .merge(market_data_refresh)
        .route("/positions/open", post(open_position))
        .route("/positions/:id/close", post(close_position))
        .route("/positions/group/:group_id/batch-close", post(batch_close))
        .route("/positions/group/:group_id/mark-closed", patch(mark_group_closed))
        .route("/trades", get(list_trades))
        .route("/trades/:id/funding-details", get(trade_funding_details))
        .route("/monitor/status", get(monitor_status))
        .route("/ws-status", get(ws_status))
        .layer(axum_middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    Json(json!({ "success": true, "data": data }))
}

fn parse_exchange(s: &str) -> EngineResult<Exchange> {
    s.parse()
}

// ---- GET /funding-rates -------------------------------------------------

#[derive(Serialize)]
struct NormalizedApy {
    #[serde(rename = "1h")]
    one_hour: Decimal,
    #[serde(rename = "4h")]
    four_hours: Decimal,
    #[serde(rename = "8h")]
    eight_hours: Decimal,
    #[serde(rename = "24h")]
    twenty_four_hours: Decimal,
}

#[derive(Serialize)]
struct ExchangeRateDto {
    exchange: Exchange,
    rate: Decimal,
    mark_price: Option<Decimal>,
    original_interval_hours: u32,
    normalized: NormalizedApy,
}

#[derive(Serialize)]
struct FundingRatePairDto {
    symbol: String,
    rates: Vec<ExchangeRateDto>,
    best_pair: Option<crate::domain::BestArbitragePair>,
}

async fn funding_rates(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let pairs: Vec<FundingRatePairDto> = runtime
        .funding_rates_snapshot()
        .into_iter()
        .map(|pair| FundingRatePairDto {
            symbol: pair.symbol.as_str().to_string(),
            rates: pair
                .rates
                .values()
                .map(|r| ExchangeRateDto {
                    exchange: r.exchange,
                    rate: r.rate,
                    mark_price: r.mark_price,
                    original_interval_hours: r.original_interval_hours,
                    normalized: NormalizedApy {
                        one_hour: r.normalized_apy(CanonicalInterval::OneHour),
                        four_hours: r.normalized_apy(CanonicalInterval::FourHours),
                        eight_hours: r.normalized_apy(CanonicalInterval::EightHours),
                        twenty_four_hours: r.normalized_apy(CanonicalInterval::TwentyFourHours),
                    },
                })
                .collect(),
            best_pair: pair.best_pair,
        })
        .collect();
    ok(pairs)
}

// ---- GET /opportunities --------------------------------------------------

#[derive(Deserialize)]
struct OpportunitiesQuery {
    symbol: Option<String>,
    limit: Option<usize>,
}

async fn active_opportunities(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<OpportunitiesQuery>,
) -> impl IntoResponse {
    let symbol = query.symbol.map(CanonicalSymbol::new);
    let limit = query.limit.unwrap_or(50);
    ok(runtime.active_opportunities(symbol.as_ref(), limit))
}

// ---- GET /public/opportunities (de-identified, rate-limited) ------------

#[derive(Deserialize)]
struct PublicOpportunitiesQuery {
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn public_opportunities(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<PublicOpportunitiesQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;
    // `OpportunityEndHistory` carries no `userId`/`notificationCount` by
    // construction (spec.md §3), so the de-identification guarantee holds
    // without any field-stripping here.
    let rows = runtime.public_opportunity_history(limit, offset).await?;
    Ok(ok(rows))
}

// ---- GET /market-data/refresh (rate-limited per user) -------------------

#[derive(Deserialize)]
struct RefreshQuery {
    symbol: String,
    exchanges: String,
}

async fn refresh_market_data(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<RefreshQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let symbol = CanonicalSymbol::new(query.symbol);
    let exchanges: Vec<Exchange> = query
        .exchanges
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_exchange)
        .collect::<EngineResult<_>>()?;
    let records = runtime.refresh_market_data(&symbol, &exchanges).await?;
    Ok(ok(records))
}

// ---- POST /positions/open ------------------------------------------------

#[derive(Deserialize)]
struct OpenPositionRequest {
    symbol: String,
    long_exchange: String,
    short_exchange: String,
    qty: Decimal,
    leverage: Decimal,
}

async fn open_position(
    State(runtime): State<Arc<Runtime>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<OpenPositionRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let long_exchange = parse_exchange(&body.long_exchange)?;
    let short_exchange = parse_exchange(&body.short_exchange)?;
    if long_exchange == short_exchange {
        return Err(EngineError::Validation("long and short exchange must differ".into()));
    }
    let position = runtime
        .open_pair(
            user_id,
            CanonicalSymbol::new(body.symbol),
            long_exchange,
            short_exchange,
            body.qty,
            body.leverage,
        )
        .await?;
    Ok(ok(position))
}

// ---- POST /positions/{id}/close ------------------------------------------

async fn close_position(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, EngineError> {
    let position = runtime.close_position(id).await?;
    Ok(ok(position))
}

// ---- POST /positions/group/{groupId}/batch-close -------------------------

async fn batch_close(
    State(runtime): State<Arc<Runtime>>,
    AuthUser(user_id): AuthUser,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, EngineError> {
    let result = runtime.close_batch(user_id, group_id).await?;
    Ok(ok(json!({
        "totalPositions": result.total_positions,
        "closedPositions": result.closed_positions,
        "failedPositions": result.failed_positions,
    })))
}

// ---- PATCH /positions/group/{groupId}/mark-closed ------------------------

async fn mark_group_closed(
    State(runtime): State<Arc<Runtime>>,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, EngineError> {
    let count = runtime.mark_group_closed(group_id).await?;
    Ok(ok(json!({ "updated": count })))
}

// ---- GET /trades ----------------------------------------------------------

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_trades(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<TradesQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let trades = runtime.list_trades(limit, offset).await?;
    Ok(ok(trades))
}

// ---- GET /trades/{id}/funding-details --------------------------------------

async fn trade_funding_details(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, EngineError> {
    let trade = runtime.trade_funding_details(id).await?;
    Ok(ok(json!({
        "tradeId": trade.id,
        "fundingRatePnl": trade.funding_rate_pnl,
        "longEntryPrice": trade.long_entry_price,
        "shortEntryPrice": trade.short_entry_price,
    })))
}

// ---- GET /monitor/status ---------------------------------------------------

async fn monitor_status(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let status = runtime.monitor_status();
    ok(json!({
        "initialized": status.initialized,
        "isRunning": status.is_running,
        "intervalMs": status.interval_ms,
    }))
}

// ---- GET /ws-status ---------------------------------------------------------

async fn ws_status(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let statuses: Vec<_> = runtime
        .ws_status()
        .into_iter()
        .map(|s| {
            json!({
                "exchange": s.exchange,
                "state": format!("{:?}", s.state).to_lowercase(),
                "health": format!("{:?}", s.health).to_lowercase(),
            })
        })
        .collect();
    ok(statuses)
}
