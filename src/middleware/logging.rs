//! Request logging middleware: one structured `tracing` span per HTTP
//! request, correlation id included (spec.md §7: "correlation id threaded
//! through every log line").

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use uuid::Uuid;

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let correlation_id = Uuid::new_v4();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed = start.elapsed();
    if status.is_server_error() {
        tracing::error!(correlation_id = %correlation_id, %method, path, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "request failed");
    } else if status.is_client_error() {
        tracing::warn!(correlation_id = %correlation_id, %method, path, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "request rejected");
    } else {
        tracing::info!(correlation_id = %correlation_id, %method, path, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "request handled");
    }
    response
}
