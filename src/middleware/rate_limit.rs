//! HTTP-facing rate limiting (spec.md §6, §9 Rate Limiter + Cache): wraps
//! `crate::cache::RateLimiter` with the two concrete policies named in the
//! external interface — per-IP on `/public/opportunities` (30 req/min) and
//! per-user on `/market-data/refresh` (1 req/5s).

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::Runtime;

pub const PUBLIC_OPPORTUNITIES_LIMIT: u32 = 30;
pub const PUBLIC_OPPORTUNITIES_WINDOW: Duration = Duration::from_secs(60);

/// Per-IP limiter for `GET /public/opportunities` (testable property 9).
pub async fn public_opportunities_rate_limit(
    State(runtime): State<Arc<Runtime>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = format!("public_opportunities:{}", addr.ip());
    let decision = runtime
        .rate_limiter
        .check(&key, PUBLIC_OPPORTUNITIES_LIMIT, PUBLIC_OPPORTUNITIES_WINDOW);

    if !decision.allowed {
        let mut response = axum::response::IntoResponse::into_response(crate::error::EngineError::RateLimited {
            retry_after_secs: decision.retry_after.as_secs(),
        });
        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    response
}

/// Per-user limiter for `GET /market-data/refresh` (1 req / 5s per user).
pub async fn market_data_refresh_rate_limit(
    State(runtime): State<Arc<Runtime>>,
    crate::api::AuthUser(user_id): crate::api::AuthUser,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = format!("market_data_refresh:{user_id}");
    let decision = runtime.rate_limiter.check(&key, 1, Duration::from_secs(5));
    if !decision.allowed {
        return axum::response::IntoResponse::into_response(crate::error::EngineError::RateLimited {
            retry_after_secs: decision.retry_after.as_secs(),
        });
    }
    next.run(request).await
}
