//! Integration tests exercising the thin HTTP collaborator end to end
//! against a real `Runtime` (in-memory-backed sqlite store, no network
//! background workers spawned). Covers the HTTP-surface testable
//! properties from spec.md §8 that unit tests colocated with individual
//! modules can't reach: the `{success,data}` envelope, de-identification
//! of `/public/opportunities`, and the sliding-window rate limiter's
//! 30th/31st-request boundary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal_macros::dec;
use tower::ServiceExt;

use funding_arb_engine::config::{Config, TestnetCredentials};
use funding_arb_engine::domain::{CanonicalSymbol, Exchange, FundingRateRecord, RateSource};
use funding_arb_engine::runtime::Runtime;

fn test_config(db_path: &std::path::Path) -> Config {
    Config {
        database_url: db_path.to_string_lossy().into_owned(),
        encryption_key: "integration-test-key".to_string(),
        next_public_base_url: "http://localhost:3000".to_string(),
        run_integration_tests: false,
        run_trading_integration_tests: false,
        performance_test: false,
        http_port: 0,
        testnet_credentials: TestnetCredentials::default(),
    }
}

fn record(exchange: Exchange, symbol: &str, rate: rust_decimal::Decimal, mark_price: rust_decimal::Decimal) -> FundingRateRecord {
    FundingRateRecord {
        exchange,
        symbol: CanonicalSymbol::new(symbol),
        rate,
        mark_price: Some(mark_price),
        next_funding_time: None,
        received_at: chrono::Utc::now(),
        source: RateSource::Websocket,
        original_interval_hours: 8,
    }
}

async fn boot_runtime() -> (Arc<Runtime>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("engine.sqlite3");
    let runtime = Runtime::init(test_config(&db_path)).expect("runtime init");
    (runtime, dir)
}

fn get(path: &str) -> Request<Body> {
    let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
    req.extensions_mut().insert(axum::extract::ConnectInfo(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        9999,
    )));
    req
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body");
    serde_json::from_slice(&bytes).expect("valid json body")
}

#[tokio::test]
async fn funding_rates_endpoint_returns_success_envelope_with_normalized_apy() {
    let (runtime, _dir) = boot_runtime().await;
    {
        let mut pairs = runtime.pairs.write();
        let pair = pairs
            .entry(CanonicalSymbol::new("BTCUSDT"))
            .or_insert_with(|| funding_arb_engine::domain::FundingRatePair::new(CanonicalSymbol::new("BTCUSDT")));
        pair.upsert(&record(Exchange::Binance, "BTCUSDT", dec!(0.0001), dec!(50000)));
        pair.upsert(&record(Exchange::Okx, "BTCUSDT", dec!(-0.0005), dec!(50000)));
    }

    let router = funding_arb_engine::api::http::router(runtime);
    let response = router.oneshot(get("/funding-rates")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], serde_json::json!(true));
    let pairs = body["data"].as_array().expect("data is array");
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0]["symbol"], serde_json::json!("BTCUSDT"));
    let best = &pairs[0]["best_pair"];
    assert_eq!(best["long_exchange"], serde_json::json!("okx"));
    assert_eq!(best["short_exchange"], serde_json::json!("binance"));
}

#[tokio::test]
async fn public_opportunities_omit_user_id_and_notification_count() {
    let (runtime, _dir) = boot_runtime().await;
    let now = chrono::Utc::now();
    let mut opp = funding_arb_engine::domain::ArbitrageOpportunity::new(
        CanonicalSymbol::new("BTCUSDT"),
        Exchange::Okx,
        Exchange::Binance,
        dec!(0.0006),
        dec!(0.2190),
        now,
    );
    let history = opp.end(now + chrono::Duration::seconds(30));
    // Persist the ended row directly through the store facade the detection
    // cycle would otherwise have used.
    runtime
        .store
        .insert_opportunity_end_history(&history)
        .await
        .expect("insert end history");

    let router = funding_arb_engine::api::http::router(runtime);
    let response = router.oneshot(get("/public/opportunities")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let rows = body["data"].as_array().expect("data is array");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].get("user_id").is_none());
    assert!(rows[0].get("userId").is_none());
    assert!(rows[0].get("notification_count").is_none());
    assert!(rows[0].get("notificationCount").is_none());
    assert!(rows[0].get("settlement_records").is_none());
}

#[tokio::test]
async fn public_opportunities_rate_limit_allows_30_then_rejects_31st() {
    let (runtime, _dir) = boot_runtime().await;
    let router = funding_arb_engine::api::http::router(runtime);

    for i in 1..=30 {
        let response = router.clone().oneshot(get("/public/opportunities")).await.unwrap();
        assert_eq!(
            response.status(),
            StatusCode::OK,
            "request {i} of 30 should be allowed"
        );
        if i == 30 {
            assert_eq!(
                response.headers().get("X-RateLimit-Remaining").unwrap(),
                "0"
            );
        }
    }

    let response = router.oneshot(get("/public/opportunities")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("Retry-After").unwrap(), "60");
    assert_eq!(
        response.headers().get("X-RateLimit-Remaining").unwrap(),
        "0"
    );
}

#[tokio::test]
async fn monitor_status_and_ws_status_are_reachable() {
    let (runtime, _dir) = boot_runtime().await;
    let router = funding_arb_engine::api::http::router(runtime);

    let response = router.clone().oneshot(get("/monitor/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["isRunning"], serde_json::json!(false));

    let response = router.oneshot(get("/ws-status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let statuses = body["data"].as_array().expect("data is array");
    assert_eq!(statuses.len(), Exchange::ALL.len());
}

#[tokio::test]
async fn unauthenticated_position_open_is_forbidden() {
    let (runtime, _dir) = boot_runtime().await;
    let router = funding_arb_engine::api::http::router(runtime);
    let request = Request::builder()
        .method("POST")
        .uri("/positions/open")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "symbol": "BTCUSDT",
                "long_exchange": "okx",
                "short_exchange": "binance",
                "qty": "0.01",
                "leverage": "1"
            })
            .to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["success"], serde_json::json!(false));
    assert_eq!(body["error"]["code"], serde_json::json!("FORBIDDEN"));
}
