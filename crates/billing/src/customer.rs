//! Customer directory
//!
//! Maps attributions to Stripe customers. Stripe is the source of truth; the
//! local `stripe_customers` table is a read-through cache whose writes are
//! best effort.

use std::sync::Arc;

use meterline_shared::AttributionId;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::outcome::{Outcome, WarningKind};
use crate::processor::{NewCustomer, PaymentProcessor, ProcessorCustomer, ProcessorError};
use crate::store::{ExternalCustomer, StoreError, UsageStore};

/// Parameters for creating a processor customer
#[derive(Debug, Clone)]
pub struct CreateCustomerRequest {
    pub attribution_id: AttributionId,
    pub currency: String,
    pub email: String,
    pub name: String,
    pub billing_creator_user_id: Option<String>,
}

/// Customer service for managing Stripe customers
#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn UsageStore>,
    processor: Arc<dyn PaymentProcessor>,
}

fn lookup_error(e: ProcessorError, what: &str) -> BillingError {
    if e.is_not_found() {
        BillingError::NotFound(format!("No Stripe customer for {}", what))
    } else {
        BillingError::Internal(format!("Failed to look up Stripe customer for {}: {}", what, e))
    }
}

impl CustomerService {
    pub fn new(store: Arc<dyn UsageStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    pub async fn resolve_by_attribution(
        &self,
        attribution_id: &AttributionId,
    ) -> BillingResult<Outcome<ExternalCustomer>> {
        let mut outcome = Outcome::new(());

        match self.store.get_stripe_customer_by_attribution(attribution_id).await {
            Ok(cached) => return Ok(Outcome::new(cached)),
            Err(StoreError::NotFound) => {}
            Err(e) => {
                tracing::warn!(
                    attribution_id = %attribution_id,
                    error = %e,
                    "Failed to read cached Stripe customer, falling back to Stripe"
                );
                outcome.warn(
                    WarningKind::CacheReadFailed,
                    format!("customer cache read failed: {}", e),
                );
            }
        }

        let customer = self
            .processor
            .get_customer_by_attribution_id(attribution_id)
            .await
            .map_err(|e| lookup_error(e, &attribution_id.to_string()))?;

        let resolved = outcome.absorb(self.persist(attribution_id.clone(), &customer).await);
        Ok(outcome.map(|_| resolved))
    }

    pub async fn resolve_by_processor_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Outcome<ExternalCustomer>> {
        if customer_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "stripe customer id must not be empty".to_string(),
            ));
        }

        let mut outcome = Outcome::new(());

        match self.store.get_stripe_customer(customer_id).await {
            Ok(cached) => return Ok(Outcome::new(cached)),
            Err(StoreError::NotFound) => {}
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to read cached Stripe customer, falling back to Stripe"
                );
                outcome.warn(
                    WarningKind::CacheReadFailed,
                    format!("customer cache read failed: {}", e),
                );
            }
        }

        let customer = self
            .processor
            .get_customer(customer_id)
            .await
            .map_err(|e| lookup_error(e, customer_id))?;

        let attribution_id = customer
            .attribution_id()
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        let resolved = outcome.absorb(self.persist(attribution_id, &customer).await);
        Ok(outcome.map(|_| resolved))
    }

    pub async fn create(
        &self,
        request: CreateCustomerRequest,
    ) -> BillingResult<Outcome<ExternalCustomer>> {
        for (field, value) in [
            ("currency", &request.currency),
            ("email", &request.email),
            ("name", &request.name),
        ] {
            if value.trim().is_empty() {
                return Err(BillingError::InvalidArgument(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        let params = NewCustomer {
            attribution_id: request.attribution_id.clone(),
            currency: request.currency.trim().to_string(),
            email: request.email,
            name: request.name,
            billing_creator_user_id: request.billing_creator_user_id,
        };

        let customer = self.processor.create_customer(&params).await.map_err(|e| {
            tracing::error!(
                attribution_id = %params.attribution_id,
                error = %e,
                "Failed to create Stripe customer"
            );
            BillingError::Internal(format!("Failed to create Stripe customer: {}", e))
        })?;

        Ok(self.persist(request.attribution_id, &customer).await)
    }

    /// Best-effort cache write; the customer is returned either way
    async fn persist(
        &self,
        attribution_id: AttributionId,
        customer: &ProcessorCustomer,
    ) -> Outcome<ExternalCustomer> {
        let record = ExternalCustomer {
            attribution_id,
            processor_customer_id: customer.id.clone(),
            preferred_currency: customer.preferred_currency().unwrap_or_default().to_string(),
            creation_time: customer.created.unwrap_or_else(OffsetDateTime::now_utc),
        };

        let mut outcome = Outcome::new(record);
        if let Err(e) = self.store.create_stripe_customer(&outcome.value).await {
            tracing::warn!(
                attribution_id = %outcome.value.attribution_id,
                customer_id = %customer.id,
                error = %e,
                "Failed to cache Stripe customer"
            );
            outcome.warn(
                WarningKind::CacheWriteFailed,
                format!("customer cache write failed: {}", e),
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer, FakeProcessor, InMemoryStore};

    fn service() -> (Arc<InMemoryStore>, Arc<FakeProcessor>, CustomerService) {
        let store = Arc::new(InMemoryStore::default());
        let processor = Arc::new(FakeProcessor::default());
        let service = CustomerService::new(store.clone(), processor.clone());
        (store, processor, service)
    }

    fn request(currency: &str, email: &str, name: &str) -> CreateCustomerRequest {
        CreateCustomerRequest {
            attribution_id: AttributionId::organization("42"),
            currency: currency.to_string(),
            email: email.to_string(),
            name: name.to_string(),
            billing_creator_user_id: Some("u1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_resolve_backfills_cache() {
        let (store, processor, service) = service();
        processor.add_customer(customer("cus_42", "team:42", Some("EUR")));

        let outcome = service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(outcome.value.processor_customer_id, "cus_42");
        assert_eq!(outcome.value.preferred_currency, "EUR");
        assert!(outcome.warnings.is_empty());
        assert_eq!(store.customers().len(), 1);
    }

    #[tokio::test]
    async fn test_cached_customer_keeps_stripe_creation_time() {
        let (store, processor, service) = service();
        let created = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        let mut existing = customer("cus_42", "team:42", Some("usd"));
        existing.created = Some(created);
        processor.add_customer(existing);

        let outcome = service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(outcome.value.creation_time, created);
        assert_eq!(store.customers()[0].creation_time, created);
    }

    #[tokio::test]
    async fn test_resolve_prefers_cache() {
        let (store, processor, service) = service();
        processor.add_customer(customer("cus_42", "team:42", None));
        service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        processor.state().fail_lookups = true;
        let outcome = service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(outcome.value.processor_customer_id, "cus_42");
        assert_eq!(store.customers().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_cache_write_failure_is_warning() {
        let (store, processor, service) = service();
        processor.add_customer(customer("cus_42", "team:42", None));
        store.state().fail_customer_writes = true;

        let outcome = service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(outcome.value.processor_customer_id, "cus_42");
        assert!(outcome.has_warning(WarningKind::CacheWriteFailed));
        assert!(store.customers().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_cache_read_failure_falls_back() {
        let (store, processor, service) = service();
        processor.add_customer(customer("cus_42", "team:42", None));
        store.state().fail_customer_reads = true;

        let outcome = service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(outcome.value.processor_customer_id, "cus_42");
        assert!(outcome.has_warning(WarningKind::CacheReadFailed));
    }

    #[tokio::test]
    async fn test_backfill_for_cached_attribution_keeps_one_row() {
        let (store, processor, service) = service();
        store.state().customers.push(ExternalCustomer {
            attribution_id: AttributionId::organization("42"),
            processor_customer_id: "cus_old".to_string(),
            preferred_currency: "USD".to_string(),
            creation_time: OffsetDateTime::now_utc(),
        });
        processor.add_customer(customer("cus_42", "team:42", None));
        store.state().fail_customer_reads = true;

        let outcome = service
            .resolve_by_attribution(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert!(!outcome.has_warning(WarningKind::CacheWriteFailed));
        let cached = store.customers();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].processor_customer_id, "cus_old");
    }

    #[tokio::test]
    async fn test_resolve_unknown_attribution_not_found() {
        let (_store, _processor, service) = service();

        let err = service
            .resolve_by_attribution(&AttributionId::individual("404"))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_by_processor_id() {
        let (_store, processor, service) = service();
        processor.add_customer(customer("cus_5", "user:5", Some("USD")));

        let outcome = service.resolve_by_processor_id("cus_5").await.unwrap();

        assert_eq!(outcome.value.attribution_id, AttributionId::individual("5"));
    }

    #[tokio::test]
    async fn test_resolve_by_processor_id_validation() {
        let (_store, processor, service) = service();
        let mut broken = customer("cus_bad", "user:5", None);
        broken.metadata.clear();
        processor.add_customer(broken);

        assert!(matches!(
            service.resolve_by_processor_id("").await.unwrap_err(),
            BillingError::InvalidArgument(_)
        ));
        assert!(matches!(
            service.resolve_by_processor_id("cus_bad").await.unwrap_err(),
            BillingError::Internal(_)
        ));
        assert!(matches!(
            service.resolve_by_processor_id("cus_missing").await.unwrap_err(),
            BillingError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_create_customer() {
        let (store, processor, service) = service();

        let outcome = service
            .create(request("EUR", "billing@team.test", "Team 42"))
            .await
            .unwrap();

        assert_eq!(outcome.value.preferred_currency, "EUR");
        assert_eq!(store.customers().len(), 1);
        let created = processor
            .state()
            .customers
            .get(&outcome.value.processor_customer_id)
            .cloned()
            .unwrap();
        assert_eq!(
            created.metadata.get("billingCreatorUserId").map(String::as_str),
            Some("u1")
        );
    }

    #[tokio::test]
    async fn test_create_customer_rejects_empty_fields() {
        let (_store, processor, service) = service();

        for req in [
            request("", "a@b.test", "n"),
            request("USD", " ", "n"),
            request("USD", "a@b.test", ""),
        ] {
            let err = service.create(req).await.unwrap_err();
            assert!(matches!(err, BillingError::InvalidArgument(_)));
        }
        assert!(processor.state().customers.is_empty());
    }

    #[tokio::test]
    async fn test_create_customer_processor_failure() {
        let (store, processor, service) = service();
        processor.state().fail_create_customer = true;

        let err = service
            .create(request("USD", "a@b.test", "n"))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Internal(_)));
        assert!(store.customers().is_empty());
    }

    #[tokio::test]
    async fn test_create_customer_cache_failure_still_succeeds() {
        let (store, _processor, service) = service();
        store.state().fail_customer_writes = true;

        let outcome = service
            .create(request("USD", "a@b.test", "n"))
            .await
            .unwrap();

        assert!(outcome.has_warning(WarningKind::CacheWriteFailed));
    }
}
