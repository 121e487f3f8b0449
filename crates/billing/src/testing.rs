#![allow(clippy::unwrap_used)]

//! In-memory collaborators for tests
//!
//! Enabled for this crate's unit tests and, through the `testing` feature,
//! for downstream crates' tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use meterline_shared::{AttributionId, CreditCents};
use time::OffsetDateTime;

use crate::client::{CurrencyPrices, PriceIds};
use crate::cost_center::CostCenterDefaults;
use crate::identity::{IdentityError, IdentityGateway, TeamMember, TeamRole};
use crate::processor::{
    NewCustomer, PaymentHoldResult, PaymentProcessor, ProcessorCustomer, ProcessorDispute,
    ProcessorError, ProcessorInvoice, ProcessorPrice, ProcessorSubscription,
    SubscriptionWithCustomer, ATTRIBUTION_ID_METADATA_KEY, BILLING_CREATOR_METADATA_KEY,
    PREFERRED_CURRENCY_METADATA_KEY,
};
use crate::store::{
    Balance, CostCenter, ExternalCustomer, SortOrder, StoreError, UsageQuery, UsageRecord,
    UsageStore,
};
use crate::{BillingConfig, BillingService};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// `Stripe-Signature` header value for `payload` signed at `timestamp`
pub fn sign(secret: &str, payload: &str, timestamp: i64) -> String {
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

pub fn test_price_ids() -> PriceIds {
    PriceIds {
        individual_usage: CurrencyPrices {
            usd: "price_user_usd".to_string(),
            eur: "price_user_eur".to_string(),
        },
        team_usage: CurrencyPrices {
            usd: "price_team_usd".to_string(),
            eur: "price_team_eur".to_string(),
        },
    }
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        price_ids: test_price_ids(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        cost_center_defaults: CostCenterDefaults::default(),
    }
}

/// Processor customer carrying attribution and currency metadata
pub fn customer(id: &str, attribution_id: &str, currency: Option<&str>) -> ProcessorCustomer {
    let mut metadata = HashMap::new();
    metadata.insert(ATTRIBUTION_ID_METADATA_KEY.to_string(), attribution_id.to_string());
    if let Some(currency) = currency {
        metadata.insert(PREFERRED_CURRENCY_METADATA_KEY.to_string(), currency.to_string());
    }

    ProcessorCustomer {
        id: id.to_string(),
        metadata,
        automatic_tax: Some("supported".to_string()),
        ..Default::default()
    }
}

pub fn subscription(id: &str, customer_id: &str, status: &str) -> ProcessorSubscription {
    ProcessorSubscription {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        price_id: Some("price_team_usd".to_string()),
        status: status.to_string(),
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub processor: Arc<FakeProcessor>,
    pub identity: Arc<FakeIdentity>,
    pub service: BillingService,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::default());
        let processor = Arc::new(FakeProcessor::default());
        let identity = Arc::new(FakeIdentity::default());
        let service = BillingService::new(
            store.clone(),
            processor.clone(),
            identity.clone(),
            test_config(),
        );

        Self {
            store,
            processor,
            identity,
            service,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StoreState {
    pub usage: Vec<UsageRecord>,
    pub cost_centers: HashMap<AttributionId, CostCenter>,
    pub customers: Vec<ExternalCustomer>,
    pub fail_usage_inserts: bool,
    pub fail_customer_reads: bool,
    pub fail_customer_writes: bool,
    pub fail_cost_center_updates: bool,
    pub fail_balances: bool,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.state().usage.clone()
    }

    pub fn cost_center(&self, attribution_id: &AttributionId) -> Option<CostCenter> {
        self.state().cost_centers.get(attribution_id).cloned()
    }

    pub fn put_cost_center(&self, cost_center: CostCenter) {
        self.state()
            .cost_centers
            .insert(cost_center.attribution_id.clone(), cost_center);
    }

    pub fn customers(&self) -> Vec<ExternalCustomer> {
        self.state().customers.clone()
    }
}

fn unavailable() -> StoreError {
    StoreError::Database("store unavailable".to_string())
}

fn in_range(
    record: &UsageRecord,
    attribution_id: &AttributionId,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> bool {
    &record.attribution_id == attribution_id
        && record.effective_time >= from
        && record.effective_time < to
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.fail_usage_inserts {
            return Err(unavailable());
        }
        if state.usage.iter().any(|r| r.id == record.id) {
            return Ok(false);
        }
        state.usage.push(record.clone());
        Ok(true)
    }

    async fn get_balance(&self, attribution_id: &AttributionId) -> Result<CreditCents, StoreError> {
        let state = self.state();
        if state.fail_balances {
            return Err(unavailable());
        }
        Ok(state
            .usage
            .iter()
            .filter(|r| !r.draft && &r.attribution_id == attribution_id)
            .map(|r| r.credit_cents)
            .sum())
    }

    async fn list_balances(&self) -> Result<Vec<Balance>, StoreError> {
        let state = self.state();
        if state.fail_balances {
            return Err(unavailable());
        }
        let mut totals: BTreeMap<AttributionId, CreditCents> = BTreeMap::new();
        for record in state.usage.iter().filter(|r| !r.draft) {
            *totals.entry(record.attribution_id.clone()).or_default() += record.credit_cents;
        }
        Ok(totals
            .into_iter()
            .map(|(attribution_id, credit_cents)| Balance {
                attribution_id,
                credit_cents,
            })
            .collect())
    }

    async fn list_usage(&self, query: &UsageQuery) -> Result<Vec<UsageRecord>, StoreError> {
        let state = self.state();
        let mut records: Vec<UsageRecord> = state
            .usage
            .iter()
            .filter(|r| in_range(r, &query.attribution_id, query.from, query.to))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            let by_time = match query.order {
                SortOrder::Ascending => a.effective_time.cmp(&b.effective_time),
                SortOrder::Descending => b.effective_time.cmp(&a.effective_time),
            };
            by_time.then(a.id.cmp(&b.id))
        });
        Ok(records
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn count_usage(
        &self,
        attribution_id: &AttributionId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let state = self.state();
        Ok(state
            .usage
            .iter()
            .filter(|r| in_range(r, attribution_id, from, to))
            .count() as i64)
    }

    async fn find_cost_center(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<Option<CostCenter>, StoreError> {
        Ok(self.state().cost_centers.get(attribution_id).cloned())
    }

    async fn insert_cost_center_if_absent(
        &self,
        cost_center: &CostCenter,
    ) -> Result<CostCenter, StoreError> {
        let mut state = self.state();
        Ok(state
            .cost_centers
            .entry(cost_center.attribution_id.clone())
            .or_insert_with(|| cost_center.clone())
            .clone())
    }

    async fn update_cost_center(&self, cost_center: &CostCenter) -> Result<CostCenter, StoreError> {
        let mut state = self.state();
        if state.fail_cost_center_updates {
            return Err(unavailable());
        }
        match state.cost_centers.get_mut(&cost_center.attribution_id) {
            Some(existing) => {
                *existing = cost_center.clone();
                Ok(cost_center.clone())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_stripe_customer_by_attribution(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<ExternalCustomer, StoreError> {
        let state = self.state();
        if state.fail_customer_reads {
            return Err(unavailable());
        }
        state
            .customers
            .iter()
            .find(|c| &c.attribution_id == attribution_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_stripe_customer(
        &self,
        processor_customer_id: &str,
    ) -> Result<ExternalCustomer, StoreError> {
        let state = self.state();
        if state.fail_customer_reads {
            return Err(unavailable());
        }
        state
            .customers
            .iter()
            .find(|c| c.processor_customer_id == processor_customer_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_stripe_customer(&self, customer: &ExternalCustomer) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_customer_writes {
            return Err(unavailable());
        }
        if !state.customers.iter().any(|c| {
            c.processor_customer_id == customer.processor_customer_id
                || c.attribution_id == customer.attribution_id
        }) {
            state.customers.push(customer.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProcessorState {
    pub customers: HashMap<String, ProcessorCustomer>,
    pub invoices: HashMap<String, ProcessorInvoice>,
    pub subscriptions: HashMap<String, SubscriptionWithCustomer>,
    pub disputes: HashMap<String, ProcessorDispute>,
    pub prices: HashMap<String, ProcessorPrice>,
    pub hold_result: Option<PaymentHoldResult>,
    pub holds: Vec<(String, i64)>,
    pub created_subscriptions: Vec<(String, String, bool)>,
    pub usage_updates: Vec<BTreeMap<AttributionId, i64>>,
    pub fail_set_default_payment: bool,
    pub fail_create_customer: bool,
    pub fail_create_subscription: bool,
    pub fail_hold: bool,
    pub fail_update_usage: bool,
    pub fail_lookups: bool,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeProcessor {
    state: Mutex<ProcessorState>,
}

impl FakeProcessor {
    pub fn state(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap()
    }

    pub fn add_customer(&self, customer: ProcessorCustomer) {
        self.state().customers.insert(customer.id.clone(), customer);
    }

    pub fn usage_updates(&self) -> Vec<BTreeMap<AttributionId, i64>> {
        self.state().usage_updates.clone()
    }
}

fn api_down() -> ProcessorError {
    ProcessorError::Api("processor unavailable".to_string())
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn get_customer(&self, customer_id: &str) -> Result<ProcessorCustomer, ProcessorError> {
        let state = self.state();
        if state.fail_lookups {
            return Err(api_down());
        }
        state
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(customer_id.to_string()))
    }

    async fn get_customer_by_attribution_id(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let state = self.state();
        if state.fail_lookups {
            return Err(api_down());
        }
        let token = attribution_id.to_string();
        let mut matches: Vec<&ProcessorCustomer> = state
            .customers
            .values()
            .filter(|c| c.metadata.get(ATTRIBUTION_ID_METADATA_KEY) == Some(&token))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
            .first()
            .map(|c| (*c).clone())
            .ok_or_else(|| ProcessorError::NotFound(token))
    }

    async fn create_customer(
        &self,
        params: &NewCustomer,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let mut state = self.state();
        if state.fail_create_customer {
            return Err(api_down());
        }
        state.next_id += 1;
        let mut customer = customer(
            &format!("cus_{}", state.next_id),
            &params.attribution_id.to_string(),
            Some(&params.currency),
        );
        customer.email = Some(params.email.clone());
        customer.name = Some(params.name.clone());
        if let Some(creator) = &params.billing_creator_user_id {
            customer
                .metadata
                .insert(BILLING_CREATOR_METADATA_KEY.to_string(), creator.clone());
        }
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn set_default_payment_for_customer(
        &self,
        customer_id: &str,
        setup_intent_id: &str,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let mut state = self.state();
        if state.fail_set_default_payment {
            return Err(ProcessorError::InvalidRequest(format!(
                "setup intent {} has no payment method",
                setup_intent_id
            )));
        }
        let customer = state
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| ProcessorError::NotFound(customer_id.to_string()))?;
        customer.default_payment_method = Some(format!("pm_{}", setup_intent_id));
        Ok(customer.clone())
    }

    async fn try_hold_amount(
        &self,
        customer: &ProcessorCustomer,
        amount_cents: i64,
    ) -> Result<PaymentHoldResult, ProcessorError> {
        let mut state = self.state();
        if state.fail_hold {
            return Err(api_down());
        }
        state.holds.push((customer.id.clone(), amount_cents));
        Ok(state.hold_result.unwrap_or(PaymentHoldResult::Succeeded))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        automatic_tax: bool,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let mut state = self.state();
        if state.fail_create_subscription {
            return Err(api_down());
        }
        state.next_id += 1;
        let subscription = ProcessorSubscription {
            id: format!("sub_{}", state.next_id),
            customer_id: customer_id.to_string(),
            price_id: Some(price_id.to_string()),
            status: "active".to_string(),
        };
        state.created_subscriptions.push((
            customer_id.to_string(),
            price_id.to_string(),
            automatic_tax,
        ));
        if let Some(customer) = state.customers.get_mut(customer_id) {
            customer.subscriptions.push(subscription.clone());
        }
        Ok(subscription)
    }

    async fn get_invoice_with_customer(
        &self,
        invoice_id: &str,
    ) -> Result<ProcessorInvoice, ProcessorError> {
        self.state()
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(invoice_id.to_string()))
    }

    async fn get_subscription_with_customer(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionWithCustomer, ProcessorError> {
        self.state()
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(subscription_id.to_string()))
    }

    async fn get_dispute(&self, dispute_id: &str) -> Result<ProcessorDispute, ProcessorError> {
        self.state()
            .disputes
            .get(dispute_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(dispute_id.to_string()))
    }

    async fn get_price_information(
        &self,
        price_id: &str,
    ) -> Result<ProcessorPrice, ProcessorError> {
        self.state()
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(price_id.to_string()))
    }

    async fn update_usage(
        &self,
        credits_by_attribution: &BTreeMap<AttributionId, i64>,
    ) -> Result<(), ProcessorError> {
        let mut state = self.state();
        if state.fail_update_usage {
            return Err(api_down());
        }
        state.usage_updates.push(credits_by_attribution.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct IdentityState {
    pub teams: HashMap<String, Vec<TeamMember>>,
    pub blocked: Vec<(String, String)>,
    pub failing_users: HashSet<String>,
}

#[derive(Default)]
pub struct FakeIdentity {
    state: Mutex<IdentityState>,
}

impl FakeIdentity {
    pub fn state(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap()
    }

    pub fn add_team(&self, team_id: &str, members: &[(&str, TeamRole)]) {
        self.state().teams.insert(
            team_id.to_string(),
            members
                .iter()
                .map(|(user_id, role)| TeamMember {
                    user_id: user_id.to_string(),
                    role: *role,
                })
                .collect(),
        );
    }

    pub fn blocked_users(&self) -> Vec<String> {
        self.state().blocked.iter().map(|(u, _)| u.clone()).collect()
    }
}

#[async_trait]
impl IdentityGateway for FakeIdentity {
    async fn get_team_members(&self, team_id: &str) -> Result<Vec<TeamMember>, IdentityError> {
        self.state()
            .teams
            .get(team_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(team_id.to_string()))
    }

    async fn block_user(&self, user_id: &str, reason: &str) -> Result<(), IdentityError> {
        let mut state = self.state();
        if state.failing_users.contains(user_id) {
            return Err(IdentityError::Status {
                status: 500,
                body: "block failed".to_string(),
            });
        }
        state.blocked.push((user_id.to_string(), reason.to_string()));
        Ok(())
    }
}
