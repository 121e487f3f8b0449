//! Service-token authentication for the billing RPC surface
//!
//! Internal callers present `Authorization: Bearer <token>`. The Stripe
//! webhook authenticates by signature instead and is not behind this layer.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = extract_bearer_token(&request)
        .map(|token| bool::from(token.as_bytes().ct_eq(state.service_token.as_bytes())))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(
            path = %request.uri().path(),
            "Rejected billing request without a valid service token"
        );
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}
