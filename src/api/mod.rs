//! Thin HTTP collaborator (spec.md §6): handlers only translate HTTP ⇄
//! `Runtime` facade calls, no business logic lives here. JWT/session
//! validation is out of scope (spec.md §1) — `AuthUser` stands in for it.

pub mod http;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use uuid::Uuid;

use crate::error::EngineError;

/// Minimal stand-in for the out-of-scope authentication layer: the
/// identified user is read from an `X-User-Id` header. A real deployment
/// sits this behind the JWT/cookie auth collaborator named in spec.md §1;
/// this crate only needs *a* user identity to drive the facade.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .ok_or(EngineError::Forbidden)?;
        let user_id = Uuid::parse_str(header).map_err(|_| EngineError::Validation("invalid X-User-Id header".into()))?;
        Ok(AuthUser(user_id))
    }
}
