//! Billing RPC handlers
//!
//! Every method is a `POST /billing/v1/<Method>` with a camelCase JSON body.

use axum::{extract::State, Json};
use meterline_billing::{
    parse_attribution_id, CostCenter, CreateCustomerRequest, DisputeEnforcement,
    ExternalCustomer, ListUsageRequest, ProcessorSubscription, ReconcileSummary, Settlement,
    SortOrder, UsagePage,
};
use meterline_shared::{AttributionId, CreditCents};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::WithWarnings;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStripeCustomerRequest {
    pub attribution_id: Option<String>,
    pub stripe_customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStripeCustomerRequest {
    #[serde(default)]
    pub attribution_id: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub billing_creator_user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CustomerResponse {
    pub customer: ExternalCustomer,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStripeSubscriptionRequest {
    #[serde(default)]
    pub attribution_id: String,
    #[serde(default)]
    pub setup_intent_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: ProcessorSubscription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSubscriptionRequest {
    #[serde(default)]
    pub subscription_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostCenterResponse {
    pub cost_center: CostCenter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeInvoiceRequest {
    #[serde(default)]
    pub invoice_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChargeDisputeRequest {
    #[serde(default)]
    pub dispute_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionRequest {
    #[serde(default)]
    pub attribution_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceInformationResponse {
    pub human_readable_description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub attribution_id: AttributionId,
    pub credit_cents: CreditCents,
    pub credits: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSpendingLimitRequest {
    #[serde(default)]
    pub attribution_id: String,
    pub spending_limit: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUsageRpcRequest {
    #[serde(default)]
    pub attribution_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub pagination: PaginationRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationRequest {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
}

impl Default for PaginationRequest {
    fn default() -> Self {
        Self {
            page: first_page(),
            per_page: 0,
        }
    }
}

fn first_page() -> u32 {
    1
}

// =============================================================================
// Customers
// =============================================================================

/// Look up a customer by exactly one of attribution or Stripe customer id
pub async fn get_stripe_customer(
    State(state): State<AppState>,
    Json(req): Json<GetStripeCustomerRequest>,
) -> ApiResult<Json<WithWarnings<CustomerResponse>>> {
    let customers = &state.billing.customers;

    let outcome = match (req.attribution_id, req.stripe_customer_id) {
        (Some(attribution), None) => {
            let attribution_id = parse_attribution_id(&attribution)?;
            customers.resolve_by_attribution(&attribution_id).await?
        }
        (None, Some(customer_id)) => customers.resolve_by_processor_id(&customer_id).await?,
        _ => {
            return Err(ApiError::Validation(
                "exactly one of attributionId or stripeCustomerId is required".to_string(),
            ))
        }
    };

    Ok(Json(WithWarnings::from_outcome(outcome, |customer| {
        CustomerResponse { customer }
    })))
}

pub async fn create_stripe_customer(
    State(state): State<AppState>,
    Json(req): Json<CreateStripeCustomerRequest>,
) -> ApiResult<Json<WithWarnings<CustomerResponse>>> {
    let request = CreateCustomerRequest {
        attribution_id: parse_attribution_id(&req.attribution_id)?,
        currency: req.currency,
        email: req.email,
        name: req.name,
        billing_creator_user_id: req.billing_creator_user_id,
    };

    let outcome = state.billing.customers.create(request).await?;
    Ok(Json(WithWarnings::from_outcome(outcome, |customer| {
        CustomerResponse { customer }
    })))
}

// =============================================================================
// Subscriptions
// =============================================================================

pub async fn create_stripe_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateStripeSubscriptionRequest>,
) -> ApiResult<Json<WithWarnings<SubscriptionResponse>>> {
    let outcome = state
        .billing
        .subscriptions
        .create_subscription(&req.attribution_id, &req.setup_intent_id)
        .await?;

    Ok(Json(WithWarnings::from_outcome(outcome, |subscription| {
        SubscriptionResponse { subscription }
    })))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<CancelSubscriptionRequest>,
) -> ApiResult<Json<WithWarnings<CostCenterResponse>>> {
    let outcome = state
        .billing
        .subscriptions
        .cancel_subscription(&req.subscription_id)
        .await?;

    Ok(Json(WithWarnings::from_outcome(outcome, |cost_center| {
        CostCenterResponse { cost_center }
    })))
}

// =============================================================================
// Reconciliation
// =============================================================================

pub async fn reconcile_invoices(
    State(state): State<AppState>,
) -> ApiResult<Json<WithWarnings<ReconcileSummary>>> {
    let outcome = state.billing.reconciliation.reconcile_all().await?;
    Ok(Json(WithWarnings::from_outcome(outcome, |summary| summary)))
}

pub async fn finalize_invoice(
    State(state): State<AppState>,
    Json(req): Json<FinalizeInvoiceRequest>,
) -> ApiResult<Json<WithWarnings<Settlement>>> {
    let outcome = state
        .billing
        .reconciliation
        .settle_invoice(&req.invoice_id)
        .await?;
    Ok(Json(WithWarnings::from_outcome(outcome, |settlement| {
        settlement
    })))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Json(req): Json<AttributionRequest>,
) -> ApiResult<Json<WithWarnings<BalanceResponse>>> {
    let attribution_id = parse_attribution_id(&req.attribution_id)?;
    let outcome = state
        .billing
        .reconciliation
        .get_balance(&attribution_id)
        .await?;

    Ok(Json(WithWarnings::from_outcome(outcome, |credit_cents| {
        BalanceResponse {
            attribution_id,
            credit_cents,
            credits: credit_cents.to_credits(),
        }
    })))
}

pub async fn list_usage(
    State(state): State<AppState>,
    Json(req): Json<ListUsageRpcRequest>,
) -> ApiResult<Json<WithWarnings<UsagePage>>> {
    let request = ListUsageRequest {
        attribution_id: parse_attribution_id(&req.attribution_id)?,
        from: req.from,
        to: req.to,
        order: req.order,
        page: req.pagination.page,
        per_page: req.pagination.per_page,
    };

    let outcome = state.billing.usage.list_usage(request).await?;
    Ok(Json(WithWarnings::from_outcome(outcome, |page| page)))
}

// =============================================================================
// Disputes
// =============================================================================

pub async fn on_charge_dispute(
    State(state): State<AppState>,
    Json(req): Json<OnChargeDisputeRequest>,
) -> ApiResult<Json<WithWarnings<DisputeEnforcement>>> {
    let outcome = state
        .billing
        .disputes
        .on_charge_dispute(&req.dispute_id)
        .await?;
    Ok(Json(WithWarnings::from_outcome(outcome, |enforcement| {
        enforcement
    })))
}

// =============================================================================
// Pricing & Cost Centers
// =============================================================================

pub async fn get_price_information(
    State(state): State<AppState>,
    Json(req): Json<AttributionRequest>,
) -> ApiResult<Json<WithWarnings<PriceInformationResponse>>> {
    let attribution_id = parse_attribution_id(&req.attribution_id)?;
    let outcome = state
        .billing
        .pricing
        .get_price_information(&attribution_id)
        .await?;

    Ok(Json(WithWarnings::from_outcome(outcome, |description| {
        PriceInformationResponse {
            human_readable_description: description,
        }
    })))
}

pub async fn get_cost_center(
    State(state): State<AppState>,
    Json(req): Json<AttributionRequest>,
) -> ApiResult<Json<WithWarnings<CostCenterResponse>>> {
    let attribution_id = parse_attribution_id(&req.attribution_id)?;
    let cost_center = state
        .billing
        .cost_centers
        .get_or_create_cost_center(&attribution_id)
        .await?;

    Ok(Json(WithWarnings::new(CostCenterResponse { cost_center })))
}

pub async fn set_spending_limit(
    State(state): State<AppState>,
    Json(req): Json<SetSpendingLimitRequest>,
) -> ApiResult<Json<WithWarnings<CostCenterResponse>>> {
    let attribution_id = parse_attribution_id(&req.attribution_id)?;
    let cost_center = state
        .billing
        .cost_centers
        .set_spending_limit(&attribution_id, req.spending_limit)
        .await?;

    tracing::info!(
        attribution_id = %attribution_id,
        spending_limit = req.spending_limit,
        "Spending limit updated"
    );

    Ok(Json(WithWarnings::new(CostCenterResponse { cost_center })))
}
