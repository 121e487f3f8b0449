//! Subscription lifecycle
//!
//! An attribution moves through `NoSubscription -> PaymentVerified -> Active
//! -> Canceled`. Any processor status other than `canceled` counts as active
//! and blocks creating another subscription.

use std::sync::Arc;

use meterline_shared::AttributionId;
use serde::Serialize;

use crate::client::PriceIds;
use crate::cost_center::CostCenterManager;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::outcome::{Outcome, WarningKind};
use crate::processor::{
    PaymentHoldResult, PaymentProcessor, ProcessorCustomer, ProcessorSubscription,
};
use crate::store::{BillingStrategy, CostCenter};

/// Amount authorized and released to prove a payment method works
pub const PAYMENT_VERIFICATION_HOLD_CENTS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    NoSubscription,
    PaymentVerified,
    Active,
    Canceled,
}

impl SubscriptionState {
    /// State as observed on the processor. `PaymentVerified` is transient
    /// within subscription creation and never observed.
    pub fn of(customer: &ProcessorCustomer) -> Self {
        if customer.active_subscription().is_some() {
            SubscriptionState::Active
        } else if customer.subscriptions.is_empty() {
            SubscriptionState::NoSubscription
        } else {
            SubscriptionState::Canceled
        }
    }
}

/// Subscription service
#[derive(Clone)]
pub struct SubscriptionService {
    processor: Arc<dyn PaymentProcessor>,
    customers: CustomerService,
    cost_centers: CostCenterManager,
    prices: PriceIds,
}

impl SubscriptionService {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        customers: CustomerService,
        cost_centers: CostCenterManager,
        prices: PriceIds,
    ) -> Self {
        Self {
            processor,
            customers,
            cost_centers,
            prices,
        }
    }

    /// Verify the payment method from `setup_intent_id` and subscribe the
    /// attribution's customer to its usage price
    pub async fn create_subscription(
        &self,
        attribution_id: &str,
        setup_intent_id: &str,
    ) -> BillingResult<Outcome<ProcessorSubscription>> {
        let attribution_id = AttributionId::parse(attribution_id)
            .map_err(|e| BillingError::InvalidArgument(e.to_string()))?;
        if setup_intent_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "setup intent id must not be empty".to_string(),
            ));
        }

        let mut outcome = Outcome::new(());
        let resolved = self.customers.resolve_by_attribution(&attribution_id).await?;
        let external = outcome.absorb(resolved);
        let customer_id = external.processor_customer_id;

        self.processor
            .set_default_payment_for_customer(&customer_id, setup_intent_id)
            .await
            .map_err(|e| {
                tracing::warn!(
                    customer_id = %customer_id,
                    setup_intent_id = %setup_intent_id,
                    error = %e,
                    "Failed to set default payment method"
                );
                BillingError::InvalidArgument(format!(
                    "Failed to set default payment method: {}",
                    e
                ))
            })?;

        let customer = self
            .processor
            .get_customer(&customer_id)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to reload customer: {}", e)))?;

        if SubscriptionState::of(&customer) == SubscriptionState::Active {
            return Err(BillingError::AlreadyExists(format!(
                "{} already has an active subscription",
                attribution_id
            )));
        }

        let price_id = outcome.absorb(
            self.prices
                .resolve(attribution_id.kind(), customer.preferred_currency()),
        );

        let automatic_tax = customer.automatic_tax_supported();
        if !automatic_tax {
            tracing::warn!(
                customer_id = %customer_id,
                status = ?customer.automatic_tax,
                "Automatic tax not supported for customer"
            );
            outcome.warn(
                WarningKind::AutomaticTaxUnsupported,
                format!(
                    "automatic tax unsupported ({})",
                    customer.automatic_tax.as_deref().unwrap_or("unknown")
                ),
            );
        }

        let hold = match self
            .processor
            .try_hold_amount(&customer, PAYMENT_VERIFICATION_HOLD_CENTS)
            .await
        {
            Ok(hold) => hold,
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to place payment verification hold"
                );
                PaymentHoldResult::Failed
            }
        };
        if hold != PaymentHoldResult::Succeeded {
            tracing::info!(
                customer_id = %customer_id,
                result = %hold,
                "Payment method verification failed"
            );
            return Err(BillingError::InvalidArgument(format!(
                "payment method invalid ({})",
                hold
            )));
        }
        tracing::debug!(customer_id = %customer_id, "Payment method verified");

        let subscription = self
            .processor
            .create_subscription(&customer_id, &price_id, automatic_tax)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to create subscription: {}", e)))?;

        tracing::info!(
            attribution_id = %attribution_id,
            subscription_id = %subscription.id,
            price_id = %price_id,
            "Created subscription"
        );

        if let Err(e) = self.mark_processor_billed(&attribution_id).await {
            tracing::warn!(
                attribution_id = %attribution_id,
                error = %e,
                "Failed to switch cost center to processor billing"
            );
            outcome.warn(WarningKind::CostCenterNotUpdated, e.to_string());
        }

        Ok(outcome.map(|_| subscription))
    }

    /// Stop processor billing for the subscription's owner. Repeated calls
    /// leave the cost center unchanged.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Outcome<CostCenter>> {
        if subscription_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "subscription id must not be empty".to_string(),
            ));
        }

        let attribution_id = self.subscription_owner(subscription_id).await?;
        let cost_center = self
            .cost_centers
            .get_or_create_cost_center(&attribution_id)
            .await?;
        let updated = self
            .cost_centers
            .update_cost_center(
                &attribution_id,
                BillingStrategy::Other,
                cost_center.spending_limit,
            )
            .await?;

        tracing::info!(
            attribution_id = %attribution_id,
            subscription_id = %subscription_id,
            "Subscription cancelled, cost center billed out of band"
        );

        Ok(Outcome::new(updated))
    }

    /// Mark the owner of a newly created subscription as processor billed
    pub async fn on_subscription_created(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Outcome<CostCenter>> {
        if subscription_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "subscription id must not be empty".to_string(),
            ));
        }

        let attribution_id = self.subscription_owner(subscription_id).await?;
        let updated = self.mark_processor_billed(&attribution_id).await?;
        Ok(Outcome::new(updated))
    }

    async fn subscription_owner(&self, subscription_id: &str) -> BillingResult<AttributionId> {
        let found = self
            .processor
            .get_subscription_with_customer(subscription_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    BillingError::NotFound(format!("Subscription {} not found", subscription_id))
                } else {
                    BillingError::Internal(format!(
                        "Failed to load subscription {}: {}",
                        subscription_id, e
                    ))
                }
            })?;

        found
            .customer
            .attribution_id()
            .map_err(|e| BillingError::Internal(e.to_string()))
    }

    async fn mark_processor_billed(
        &self,
        attribution_id: &AttributionId,
    ) -> BillingResult<CostCenter> {
        let cost_center = self
            .cost_centers
            .get_or_create_cost_center(attribution_id)
            .await?;
        self.cost_centers
            .update_cost_center(
                attribution_id,
                BillingStrategy::ProcessorBilled,
                cost_center.spending_limit,
            )
            .await
    }
}
