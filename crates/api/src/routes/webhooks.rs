//! Stripe webhook intake

use axum::{extract::State, http::HeaderMap, Json};
use meterline_billing::WebhookAction;
use serde::Serialize;

use super::WithWarnings;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub received: bool,
    pub event_id: String,
    pub action: WebhookAction,
}

/// Verify and dispatch a Stripe event. A non-2xx response makes Stripe
/// redeliver, so handler failures are returned as errors.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WithWarnings<WebhookResponse>>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingSignature)?;

    let webhooks = &state.billing.webhooks;
    let event = webhooks.verify_event(&body, signature)?;
    let outcome = webhooks.handle_event(&event).await?;

    Ok(Json(WithWarnings::from_outcome(outcome, |action| {
        WebhookResponse {
            received: true,
            event_id: event.id.clone(),
            action,
        }
    })))
}
