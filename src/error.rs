//! Error taxonomy shared by every engine component.
//!
//! Four classes, matching the error handling design: transient errors are
//! retried internally and never escape a component; permanent and business
//! errors propagate to callers as a typed `EngineError`; fatal errors abort
//! startup via `main`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Business,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("exchange connection error: {0}")]
    ExchangeConnection(String),

    #[error("exchange rejected request: {code}")]
    ExchangeReject { code: String },

    #[error("rate limited by venue, retry after {retry_after_secs}s")]
    VenueRateLimit { retry_after_secs: u64 },

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("position already has an operation in progress")]
    PositionInProgress,

    #[error("no eligible positions")]
    NoEligiblePositions,

    #[error("trade not found: {0}")]
    TradeNotFound(Uuid),

    #[error("position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("credentials absent for this exchange")]
    NoApiKey,

    #[error("encryption key missing or invalid")]
    EncryptionKeyMissing,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        use EngineError::*;
        match self {
            ExchangeConnection(_) | VenueRateLimit { .. } => ErrorClass::Transient,
            ExchangeReject { .. } | InvalidSymbol(_) => ErrorClass::Permanent,
            InsufficientBalance
            | PositionInProgress
            | NoEligiblePositions
            | TradeNotFound(_)
            | PositionNotFound(_)
            | Forbidden
            | RateLimited { .. }
            | Validation(_)
            | NoApiKey => ErrorClass::Business,
            EncryptionKeyMissing => ErrorClass::Fatal,
            Internal(_) => ErrorClass::Permanent,
        }
    }

    /// Stable string code surfaced in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        use EngineError::*;
        match self {
            ExchangeConnection(_) => "EXCHANGE_CONNECTION_ERROR",
            ExchangeReject { .. } => "EXCHANGE_REJECTED",
            VenueRateLimit { .. } => "VENUE_RATE_LIMITED",
            InvalidSymbol(_) => "INVALID_SYMBOL",
            InsufficientBalance => "INSUFFICIENT_BALANCE",
            PositionInProgress => "POSITION_IN_PROGRESS",
            NoEligiblePositions => "NO_ELIGIBLE_POSITIONS",
            TradeNotFound(_) => "TRADE_NOT_FOUND",
            PositionNotFound(_) => "POSITION_NOT_FOUND",
            Forbidden => "FORBIDDEN",
            RateLimited { .. } => "RATE_LIMITED",
            Validation(_) => "VALIDATION_ERROR",
            NoApiKey => "NO_API_KEY",
            EncryptionKeyMissing => "ENCRYPTION_KEY_MISSING",
            Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        use EngineError::*;
        match self {
            Validation(_) | InvalidSymbol(_) => StatusCode::BAD_REQUEST,
            Forbidden => StatusCode::FORBIDDEN,
            TradeNotFound(_) | PositionNotFound(_) => StatusCode::NOT_FOUND,
            PositionInProgress => StatusCode::CONFLICT,
            RateLimited { .. } | VenueRateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            InsufficientBalance | NoEligiblePositions | NoApiKey | ExchangeReject { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ExchangeConnection(_) | EncryptionKeyMissing | Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();
        let mut response = Json(json!({
            "success": false,
            "error": { "code": code, "message": message },
        }))
        .into_response();
        *response.status_mut() = status;
        if let EngineError::RateLimited { retry_after_secs }
        | EngineError::VenueRateLimit { retry_after_secs } = &self
        {
            response.headers_mut().insert(
                "Retry-After",
                (*retry_after_secs).to_string().parse().unwrap(),
            );
        }
        response
    }
}
