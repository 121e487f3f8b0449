//! Payment processor boundary
//!
//! Everything the engine needs from the processor, expressed in processor
//! neutral types. [`crate::client::StripeClient`] implements it against the
//! Stripe API.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use meterline_shared::{AttributionId, ParseAttributionIdError};
use serde::Serialize;
use time::OffsetDateTime;

/// Customer metadata key carrying the attribution token
pub const ATTRIBUTION_ID_METADATA_KEY: &str = "attributionId";
/// Customer metadata key carrying the preferred billing currency
pub const PREFERRED_CURRENCY_METADATA_KEY: &str = "preferredCurrency";
/// Customer metadata key carrying the user who set up billing
pub const BILLING_CREATOR_METADATA_KEY: &str = "billingCreatorUserId";

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor resource not found: {0}")]
    NotFound(String),

    #[error("processor rejected request: {0}")]
    InvalidRequest(String),

    #[error("processor response missing {0}")]
    Malformed(String),

    #[error("processor api error: {0}")]
    Api(String),
}

impl ProcessorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessorError::NotFound(_))
    }
}

/// Why a customer's attribution could not be read
#[derive(Debug, thiserror::Error)]
pub enum CustomerAttributionError {
    #[error("customer {0} has no attribution metadata")]
    Missing(String),

    #[error("customer {customer_id} has invalid attribution metadata: {source}")]
    Invalid {
        customer_id: String,
        #[source]
        source: ParseAttributionIdError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    pub status: String,
}

impl ProcessorSubscription {
    pub fn is_canceled(&self) -> bool {
        self.status == "canceled"
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub created: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
    pub subscriptions: Vec<ProcessorSubscription>,
    /// Stripe's automatic tax status (`supported`, `unrecognized_location`, ...)
    pub automatic_tax: Option<String>,
    pub default_payment_method: Option<String>,
}

impl ProcessorCustomer {
    pub fn attribution_id(&self) -> Result<AttributionId, CustomerAttributionError> {
        let token = self
            .metadata
            .get(ATTRIBUTION_ID_METADATA_KEY)
            .ok_or_else(|| CustomerAttributionError::Missing(self.id.clone()))?;

        AttributionId::parse(token).map_err(|source| CustomerAttributionError::Invalid {
            customer_id: self.id.clone(),
            source,
        })
    }

    pub fn preferred_currency(&self) -> Option<&str> {
        self.metadata
            .get(PREFERRED_CURRENCY_METADATA_KEY)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }

    pub fn automatic_tax_supported(&self) -> bool {
        self.automatic_tax.as_deref() == Some("supported")
    }

    /// First subscription not in the canceled state
    pub fn active_subscription(&self) -> Option<&ProcessorSubscription> {
        self.subscriptions.iter().find(|s| !s.is_canceled())
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionWithCustomer {
    pub subscription: ProcessorSubscription,
    pub customer: ProcessorCustomer,
}

#[derive(Debug, Clone)]
pub struct InvoiceLine {
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct ProcessorInvoice {
    pub id: String,
    pub customer: Option<ProcessorCustomer>,
    pub finalized_at: Option<OffsetDateTime>,
    pub lines: Vec<InvoiceLine>,
}

impl ProcessorInvoice {
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

#[derive(Debug, Clone)]
pub struct DisputedPayment {
    pub payment_intent_id: String,
    pub customer: Option<ProcessorCustomer>,
}

#[derive(Debug, Clone)]
pub struct ProcessorDispute {
    pub id: String,
    pub payment_intent: Option<DisputedPayment>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorPrice {
    pub id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub attribution_id: AttributionId,
    pub currency: String,
    pub email: String,
    pub name: String,
    pub billing_creator_user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentHoldResult {
    Succeeded,
    RequiresAction,
    Failed,
}

impl std::fmt::Display for PaymentHoldResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentHoldResult::Succeeded => "succeeded",
            PaymentHoldResult::RequiresAction => "requires_action",
            PaymentHoldResult::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> Result<ProcessorCustomer, ProcessorError>;

    async fn get_customer_by_attribution_id(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<ProcessorCustomer, ProcessorError>;

    async fn create_customer(&self, params: &NewCustomer)
        -> Result<ProcessorCustomer, ProcessorError>;

    /// Attach the setup intent's payment method and make it the invoice default
    async fn set_default_payment_for_customer(
        &self,
        customer_id: &str,
        setup_intent_id: &str,
    ) -> Result<ProcessorCustomer, ProcessorError>;

    /// Authorize and immediately release `amount_cents` on the default payment method
    async fn try_hold_amount(
        &self,
        customer: &ProcessorCustomer,
        amount_cents: i64,
    ) -> Result<PaymentHoldResult, ProcessorError>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        automatic_tax: bool,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    async fn get_invoice_with_customer(
        &self,
        invoice_id: &str,
    ) -> Result<ProcessorInvoice, ProcessorError>;

    async fn get_subscription_with_customer(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionWithCustomer, ProcessorError>;

    async fn get_dispute(&self, dispute_id: &str) -> Result<ProcessorDispute, ProcessorError>;

    async fn get_price_information(&self, price_id: &str)
        -> Result<ProcessorPrice, ProcessorError>;

    /// Set the metered quantity (whole credits) for each attribution
    async fn update_usage(
        &self,
        credits_by_attribution: &BTreeMap<AttributionId, i64>,
    ) -> Result<(), ProcessorError>;
}
