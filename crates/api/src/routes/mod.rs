//! API routes

mod billing;
mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use meterline_billing::{Outcome, Warning};
use serde::Serialize;

use crate::{auth::require_service_token, state::AppState};

/// Response body plus the advisory warnings raised while producing it
#[derive(Debug, Serialize)]
pub struct WithWarnings<T> {
    #[serde(flatten)]
    pub body: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

impl<T> WithWarnings<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            warnings: Vec::new(),
        }
    }

    pub fn from_outcome<U>(outcome: Outcome<U>, f: impl FnOnce(U) -> T) -> Self {
        Self {
            body: f(outcome.value),
            warnings: outcome.warnings,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/billing/v1", billing_routes(state.clone()))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .with_state(state)
}

fn billing_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/GetStripeCustomer", post(billing::get_stripe_customer))
        .route("/CreateStripeCustomer", post(billing::create_stripe_customer))
        .route(
            "/CreateStripeSubscription",
            post(billing::create_stripe_subscription),
        )
        .route("/CancelSubscription", post(billing::cancel_subscription))
        .route("/ReconcileInvoices", post(billing::reconcile_invoices))
        .route("/FinalizeInvoice", post(billing::finalize_invoice))
        .route("/OnChargeDispute", post(billing::on_charge_dispute))
        .route("/GetPriceInformation", post(billing::get_price_information))
        .route("/GetBalance", post(billing::get_balance))
        .route("/GetCostCenter", post(billing::get_cost_center))
        .route("/SetSpendingLimit", post(billing::set_spending_limit))
        .route("/ListUsage", post(billing::list_usage))
        .route_layer(middleware::from_fn_with_state(state, require_service_token))
}
