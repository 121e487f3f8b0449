// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Meterline Billing Module
//!
//! Reconciles usage-based charges with Stripe and manages the lifecycle of
//! Stripe customers and subscriptions.
//!
//! ## Features
//!
//! - **Customer Directory**: Attribution to Stripe customer mapping with a local cache
//! - **Cost Centers**: Billing strategy, spending limits and billing cycles
//! - **Subscriptions**: Payment method verification and subscription creation/cancellation
//! - **Reconciliation**: Push ledger balances to Stripe, settle finalized invoices
//! - **Usage**: Paged ledger listing per attribution
//! - **Disputes**: Block responsible accounts when a charge is disputed
//! - **Webhooks**: Handle Stripe events

use std::sync::Arc;

use meterline_shared::AttributionId;
use sqlx::PgPool;

pub mod client;
pub mod cost_center;
pub mod customer;
pub mod disputes;
pub mod error;
pub mod identity;
pub mod outcome;
pub mod postgres;
pub mod pricing;
pub mod processor;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Client
pub use client::{CurrencyPrices, PriceIds, StripeClient, StripeConfig};

// Cost centers
pub use cost_center::{CostCenterDefaults, CostCenterManager};

// Customer
pub use customer::{CreateCustomerRequest, CustomerService};

// Disputes
pub use disputes::{DisputeEnforcement, DisputeService};

// Error
pub use error::{BillingError, BillingResult, ErrorCode};

// Identity
pub use identity::{HttpIdentityGateway, IdentityConfig, IdentityGateway, TeamMember, TeamRole};

// Outcome
pub use outcome::{Outcome, Warning, WarningKind};

// Persistence
pub use postgres::PgUsageStore;
pub use store::{
    Balance, BillingStrategy, CostCenter, ExternalCustomer, SortOrder, UsageKind, UsageQuery,
    UsageRecord, UsageStore,
};

// Pricing
pub use pricing::PricingService;

// Processor
pub use processor::{PaymentProcessor, ProcessorSubscription};

// Reconciliation
pub use reconcile::{ReconcileSummary, ReconciliationService, Settlement};

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionState};

// Usage
pub use usage::{ListUsageRequest, Pagination, UsagePage, UsageService};

// Webhooks
pub use webhooks::{WebhookAction, WebhookEvent, WebhookHandler};

/// Settings shared by the billing services
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub price_ids: PriceIds,
    pub webhook_secret: String,
    pub cost_center_defaults: CostCenterDefaults,
}

/// Parse a caller-supplied attribution token
pub fn parse_attribution_id(token: &str) -> BillingResult<AttributionId> {
    AttributionId::parse(token).map_err(|e| BillingError::InvalidArgument(e.to_string()))
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub cost_centers: CostCenterManager,
    pub customers: CustomerService,
    pub disputes: DisputeService,
    pub pricing: PricingService,
    pub reconciliation: ReconciliationService,
    pub subscriptions: SubscriptionService,
    pub usage: UsageService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create the billing service from environment configuration
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe_config = StripeConfig::from_env()?;
        let config = BillingConfig {
            price_ids: stripe_config.price_ids.clone(),
            webhook_secret: stripe_config.webhook_secret.clone(),
            cost_center_defaults: CostCenterDefaults::from_env()?,
        };
        let identity = HttpIdentityGateway::new(IdentityConfig::from_env()?);

        Ok(Self::new(
            Arc::new(PgUsageStore::new(pool)),
            Arc::new(StripeClient::new(stripe_config)),
            Arc::new(identity),
            config,
        ))
    }

    /// Create a billing service over explicit collaborators
    pub fn new(
        store: Arc<dyn UsageStore>,
        processor: Arc<dyn PaymentProcessor>,
        identity: Arc<dyn IdentityGateway>,
        config: BillingConfig,
    ) -> Self {
        let cost_centers = CostCenterManager::new(store.clone(), config.cost_center_defaults);
        let customers = CustomerService::new(store.clone(), processor.clone());
        let pricing = PricingService::new(
            processor.clone(),
            customers.clone(),
            config.price_ids.clone(),
        );
        let subscriptions = SubscriptionService::new(
            processor.clone(),
            customers.clone(),
            cost_centers.clone(),
            config.price_ids,
        );
        let usage = UsageService::new(store.clone());
        let reconciliation =
            ReconciliationService::new(store, processor.clone(), cost_centers.clone());
        let disputes = DisputeService::new(processor, identity);
        let webhooks = WebhookHandler::new(
            config.webhook_secret,
            subscriptions.clone(),
            reconciliation.clone(),
            disputes.clone(),
        );

        Self {
            cost_centers,
            customers,
            disputes,
            pricing,
            reconciliation,
            subscriptions,
            usage,
            webhooks,
        }
    }
}
