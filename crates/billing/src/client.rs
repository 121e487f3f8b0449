//! Stripe client wrapper

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use meterline_shared::AttributionId;
use serde::{Deserialize, Serialize};
use stripe::{
    AttachPaymentMethod, Client, CreateCustomer, CreateSubscription,
    CreateSubscriptionAutomaticTax, CreateSubscriptionItems, CreateUsageRecord, Customer,
    CustomerId, CustomerInvoiceSettings, Dispute, DisputeId, Expandable, Invoice, InvoiceId, List,
    PaymentMethod, PaymentMethodId, SetupIntent, SetupIntentId, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateCustomer, UsageRecord, UsageRecordAction,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    DisputedPayment, InvoiceLine, NewCustomer, PaymentHoldResult, PaymentProcessor,
    ProcessorCustomer, ProcessorDispute, ProcessorError, ProcessorInvoice, ProcessorPrice,
    ProcessorSubscription, SubscriptionWithCustomer, ATTRIBUTION_ID_METADATA_KEY,
    BILLING_CREATOR_METADATA_KEY, PREFERRED_CURRENCY_METADATA_KEY,
};

/// Stripe's search endpoint accepts at most this many OR clauses per query
const SEARCH_BATCH_SIZE: usize = 10;

/// Price ids for one usage product, per currency
#[derive(Debug, Clone, Default)]
pub struct CurrencyPrices {
    pub usd: String,
    pub eur: String,
}

/// Usage price ids for each kind of billable entity
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub individual_usage: CurrencyPrices,
    pub team_usage: CurrencyPrices,
}

impl PriceIds {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            individual_usage: CurrencyPrices {
                usd: required_env("STRIPE_PRICE_INDIVIDUAL_USD")?,
                eur: required_env("STRIPE_PRICE_INDIVIDUAL_EUR")?,
            },
            team_usage: CurrencyPrices {
                usd: required_env("STRIPE_PRICE_TEAM_USD")?,
                eur: required_env("STRIPE_PRICE_TEAM_EUR")?,
            },
        })
    }
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds::from_env()?,
        })
    }
}

fn required_env(key: &str) -> BillingResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} not set", key)))
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn search_customers(&self, query: String) -> Result<Vec<Customer>, ProcessorError> {
        let params = SearchParams {
            query,
            expand: vec!["data.subscriptions", "data.tax"],
            ..Default::default()
        };
        let result: List<Customer> = self
            .client
            .get_query("/customers/search", &params)
            .await
            .map_err(processor_error)?;

        Ok(result.data)
    }

    async fn retrieve_customer(&self, customer_id: &str) -> Result<Customer, ProcessorError> {
        let id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| ProcessorError::InvalidRequest(format!("Invalid customer ID: {}", e)))?;

        Customer::retrieve(&self.client, &id, &["subscriptions", "tax"])
            .await
            .map_err(processor_error)
    }

    async fn report_usage(&self, customer: &Customer, credits: i64) -> Result<(), ProcessorError> {
        let subscriptions = customer
            .subscriptions
            .as_ref()
            .map(|list| list.data.as_slice())
            .unwrap_or_default();

        let Some(subscription) = subscriptions
            .iter()
            .find(|s| s.status != StripeSubStatus::Canceled)
        else {
            tracing::info!(
                customer_id = %customer.id,
                "Customer has no active subscription, skipping usage update"
            );
            return Ok(());
        };

        let Some(item) = subscription.items.data.first() else {
            return Err(ProcessorError::Malformed(format!(
                "subscription item on {}",
                subscription.id
            )));
        };

        let params = CreateUsageRecord {
            quantity: credits.max(0) as u64,
            action: Some(UsageRecordAction::Set),
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        };
        UsageRecord::create(&self.client, &item.id, params)
            .await
            .map_err(processor_error)?;

        tracing::info!(
            customer_id = %customer.id,
            subscription_id = %subscription.id,
            credits = credits,
            "Updated metered usage"
        );

        Ok(())
    }
}

#[derive(Serialize, Default, Debug)]
struct SearchParams {
    pub query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Manual-capture payment intent used to verify a payment method
#[derive(Serialize, Debug)]
struct AuthorizationHold<'a> {
    amount: i64,
    currency: &'a str,
    customer: &'a str,
    payment_method: &'a str,
    capture_method: &'static str,
    confirm: bool,
    off_session: bool,
    description: &'static str,
}

#[derive(Serialize, Debug)]
struct CancelHold {
    cancellation_reason: &'static str,
}

#[derive(Deserialize, Debug)]
struct PaymentIntentState {
    id: String,
    status: String,
}

#[derive(Deserialize, Debug)]
struct PriceResource {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize, Debug)]
struct NoParams {}

fn processor_error(e: stripe::StripeError) -> ProcessorError {
    match e {
        stripe::StripeError::Stripe(request) => {
            let message = request
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?}", request.error_type));
            match request.http_status {
                404 => ProcessorError::NotFound(message),
                400 | 402 => ProcessorError::InvalidRequest(message),
                _ => ProcessorError::Api(message),
            }
        }
        other => ProcessorError::Api(other.to_string()),
    }
}

fn subscription_status(status: &StripeSubStatus) -> &'static str {
    match status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    }
}

fn convert_subscription(subscription: &Subscription) -> ProcessorSubscription {
    let customer_id = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    ProcessorSubscription {
        id: subscription.id.to_string(),
        customer_id,
        price_id: subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string()),
        status: subscription_status(&subscription.status).to_string(),
    }
}

fn convert_customer(customer: &Customer) -> ProcessorCustomer {
    let default_payment_method = customer
        .invoice_settings
        .as_ref()
        .and_then(|s| s.default_payment_method.as_ref())
        .map(|pm| match pm {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(pm) => pm.id.to_string(),
        });

    ProcessorCustomer {
        id: customer.id.to_string(),
        email: customer.email.clone(),
        name: customer.name.clone(),
        metadata: customer.metadata.clone().unwrap_or_default(),
        subscriptions: customer
            .subscriptions
            .as_ref()
            .map(|list| list.data.iter().map(convert_subscription).collect())
            .unwrap_or_default(),
        automatic_tax: customer
            .tax
            .as_ref()
            .map(|tax| format!("{:?}", tax.automatic_tax).to_lowercase()),
        created: unix_time(customer.created),
        default_payment_method,
    }
}

/// Stripe timestamps are plain unix seconds, optional on deletable objects
trait StripeTimestamp {
    fn seconds(self) -> Option<i64>;
}

impl StripeTimestamp for i64 {
    fn seconds(self) -> Option<i64> {
        Some(self)
    }
}

impl StripeTimestamp for Option<i64> {
    fn seconds(self) -> Option<i64> {
        self
    }
}

fn unix_time(ts: impl StripeTimestamp) -> Option<OffsetDateTime> {
    ts.seconds()
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

fn expanded_customer(
    customer: Option<&Expandable<Customer>>,
) -> Result<Option<ProcessorCustomer>, ProcessorError> {
    match customer {
        None => Ok(None),
        Some(Expandable::Object(customer)) => Ok(Some(convert_customer(customer))),
        Some(Expandable::Id(id)) => Err(ProcessorError::Malformed(format!(
            "expanded customer {}",
            id
        ))),
    }
}

/// Search clause matching customers by attribution metadata
fn attribution_query(attribution_ids: &[&AttributionId]) -> String {
    attribution_ids
        .iter()
        .map(|id| format!("metadata['{}']:'{}'", ATTRIBUTION_ID_METADATA_KEY, id))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn get_customer(&self, customer_id: &str) -> Result<ProcessorCustomer, ProcessorError> {
        let customer = self.retrieve_customer(customer_id).await?;
        Ok(convert_customer(&customer))
    }

    async fn get_customer_by_attribution_id(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let customers = self
            .search_customers(attribution_query(&[attribution_id]))
            .await?;

        if customers.len() > 1 {
            tracing::warn!(
                attribution_id = %attribution_id,
                count = customers.len(),
                "Multiple Stripe customers share one attribution id, using the first"
            );
        }

        customers
            .first()
            .map(convert_customer)
            .ok_or_else(|| ProcessorError::NotFound(format!("customer for {}", attribution_id)))
    }

    async fn create_customer(
        &self,
        params: &NewCustomer,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let mut metadata = HashMap::new();
        metadata.insert(
            ATTRIBUTION_ID_METADATA_KEY.to_string(),
            params.attribution_id.to_string(),
        );
        metadata.insert(
            PREFERRED_CURRENCY_METADATA_KEY.to_string(),
            params.currency.clone(),
        );
        if let Some(creator) = &params.billing_creator_user_id {
            metadata.insert(BILLING_CREATOR_METADATA_KEY.to_string(), creator.clone());
        }

        let customer = Customer::create(
            &self.client,
            CreateCustomer {
                email: Some(&params.email),
                name: Some(&params.name),
                metadata: Some(metadata),
                expand: &["tax"],
                ..Default::default()
            },
        )
        .await
        .map_err(processor_error)?;

        tracing::info!(
            customer_id = %customer.id,
            attribution_id = %params.attribution_id,
            "Created Stripe customer"
        );

        Ok(convert_customer(&customer))
    }

    async fn set_default_payment_for_customer(
        &self,
        customer_id: &str,
        setup_intent_id: &str,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let intent_id = setup_intent_id.parse::<SetupIntentId>().map_err(|e| {
            ProcessorError::InvalidRequest(format!("Invalid setup intent ID: {}", e))
        })?;
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| ProcessorError::InvalidRequest(format!("Invalid customer ID: {}", e)))?;

        let intent = SetupIntent::retrieve(&self.client, &intent_id, &[])
            .await
            .map_err(processor_error)?;

        let payment_method_id: PaymentMethodId = match &intent.payment_method {
            Some(Expandable::Id(id)) => id.clone(),
            Some(Expandable::Object(pm)) => pm.id.clone(),
            None => {
                return Err(ProcessorError::InvalidRequest(format!(
                    "setup intent {} has no payment method",
                    setup_intent_id
                )))
            }
        };

        PaymentMethod::attach(
            &self.client,
            &payment_method_id,
            AttachPaymentMethod {
                customer: customer.clone(),
            },
        )
        .await
        .map_err(processor_error)?;

        let mut params = UpdateCustomer::new();
        params.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });
        let updated = Customer::update(&self.client, &customer, params)
            .await
            .map_err(processor_error)?;

        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Set default payment method"
        );

        Ok(convert_customer(&updated))
    }

    async fn try_hold_amount(
        &self,
        customer: &ProcessorCustomer,
        amount_cents: i64,
    ) -> Result<PaymentHoldResult, ProcessorError> {
        let Some(payment_method) = customer.default_payment_method.as_deref() else {
            return Ok(PaymentHoldResult::Failed);
        };
        let currency = customer
            .preferred_currency()
            .map(str::to_lowercase)
            .unwrap_or_else(|| "usd".to_string());

        let hold = AuthorizationHold {
            amount: amount_cents,
            currency: &currency,
            customer: &customer.id,
            payment_method,
            capture_method: "manual",
            confirm: true,
            off_session: true,
            description: "Payment method verification",
        };

        let intent: PaymentIntentState = match self.client.post_form("/payment_intents", &hold).await
        {
            Ok(intent) => intent,
            Err(e) => {
                let e = processor_error(e);
                if let ProcessorError::InvalidRequest(reason) = &e {
                    tracing::info!(
                        customer_id = %customer.id,
                        reason = %reason,
                        "Authorization hold declined"
                    );
                    return Ok(PaymentHoldResult::Failed);
                }
                return Err(e);
            }
        };

        let result = match intent.status.as_str() {
            "requires_capture" | "succeeded" => PaymentHoldResult::Succeeded,
            "requires_action" => PaymentHoldResult::RequiresAction,
            _ => PaymentHoldResult::Failed,
        };

        // Release the hold regardless of outcome.
        let release: Result<PaymentIntentState, _> = self
            .client
            .post_form(
                &format!("/payment_intents/{}/cancel", intent.id),
                &CancelHold {
                    cancellation_reason: "abandoned",
                },
            )
            .await;
        if let Err(e) = release {
            tracing::warn!(
                payment_intent_id = %intent.id,
                error = %e,
                "Failed to release authorization hold"
            );
        }

        Ok(result)
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        automatic_tax: bool,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| ProcessorError::InvalidRequest(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.automatic_tax = Some(CreateSubscriptionAutomaticTax {
            enabled: automatic_tax,
            ..Default::default()
        });

        let subscription = Subscription::create(&self.client, params)
            .await
            .map_err(processor_error)?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            price_id = %price_id,
            automatic_tax = automatic_tax,
            "Created subscription"
        );

        Ok(convert_subscription(&subscription))
    }

    async fn get_invoice_with_customer(
        &self,
        invoice_id: &str,
    ) -> Result<ProcessorInvoice, ProcessorError> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| ProcessorError::InvalidRequest(format!("Invalid invoice ID: {}", e)))?;

        let invoice = Invoice::retrieve(&self.client, &id, &["customer", "customer.tax"])
            .await
            .map_err(processor_error)?;

        let lines = invoice
            .lines
            .as_ref()
            .map(|lines| {
                lines
                    .data
                    .iter()
                    .map(|line| InvoiceLine {
                        quantity: line.quantity.unwrap_or(0) as i64,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let finalized_at = invoice
            .status_transitions
            .as_ref()
            .and_then(|t| t.finalized_at)
            .and_then(unix_time);

        Ok(ProcessorInvoice {
            id: invoice.id.to_string(),
            customer: expanded_customer(invoice.customer.as_ref())?,
            finalized_at,
            lines,
        })
    }

    async fn get_subscription_with_customer(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionWithCustomer, ProcessorError> {
        let id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            ProcessorError::InvalidRequest(format!("Invalid subscription ID: {}", e))
        })?;

        let subscription = Subscription::retrieve(&self.client, &id, &["customer"])
            .await
            .map_err(processor_error)?;

        let customer = expanded_customer(Some(&subscription.customer))?
            .ok_or_else(|| ProcessorError::Malformed("subscription customer".to_string()))?;

        Ok(SubscriptionWithCustomer {
            subscription: convert_subscription(&subscription),
            customer,
        })
    }

    async fn get_dispute(&self, dispute_id: &str) -> Result<ProcessorDispute, ProcessorError> {
        let id = dispute_id
            .parse::<DisputeId>()
            .map_err(|e| ProcessorError::InvalidRequest(format!("Invalid dispute ID: {}", e)))?;

        let dispute = Dispute::retrieve(&self.client, &id, &["payment_intent.customer"])
            .await
            .map_err(processor_error)?;

        let payment_intent = match &dispute.payment_intent {
            None => None,
            Some(Expandable::Id(id)) => {
                return Err(ProcessorError::Malformed(format!(
                    "expanded payment intent {}",
                    id
                )))
            }
            Some(Expandable::Object(intent)) => Some(DisputedPayment {
                payment_intent_id: intent.id.to_string(),
                customer: expanded_customer(intent.customer.as_ref())?,
            }),
        };

        Ok(ProcessorDispute {
            id: dispute.id.to_string(),
            payment_intent,
        })
    }

    async fn get_price_information(
        &self,
        price_id: &str,
    ) -> Result<ProcessorPrice, ProcessorError> {
        let price: PriceResource = self
            .client
            .get_query(&format!("/prices/{}", price_id), &NoParams {})
            .await
            .map_err(processor_error)?;

        Ok(ProcessorPrice {
            id: price.id,
            metadata: price.metadata,
        })
    }

    async fn update_usage(
        &self,
        credits_by_attribution: &BTreeMap<AttributionId, i64>,
    ) -> Result<(), ProcessorError> {
        let attribution_ids: Vec<&AttributionId> = credits_by_attribution.keys().collect();
        let mut failures = Vec::new();

        for batch in attribution_ids.chunks(SEARCH_BATCH_SIZE) {
            let customers = self.search_customers(attribution_query(batch)).await?;

            for customer in &customers {
                let converted = convert_customer(customer);
                let attribution_id = match converted.attribution_id() {
                    Ok(id) => id,
                    Err(e) => {
                        failures.push(e.to_string());
                        continue;
                    }
                };

                let Some(credits) = credits_by_attribution.get(&attribution_id) else {
                    continue;
                };

                if let Err(e) = self.report_usage(customer, *credits).await {
                    tracing::error!(
                        customer_id = %customer.id,
                        attribution_id = %attribution_id,
                        error = %e,
                        "Failed to update usage"
                    );
                    failures.push(format!("{}: {}", attribution_id, e));
                }
            }

            if customers.len() < batch.len() {
                tracing::warn!(
                    expected = batch.len(),
                    found = customers.len(),
                    "Some attributions have no Stripe customer"
                );
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessorError::Api(failures.join("; ")))
        }
    }
}
