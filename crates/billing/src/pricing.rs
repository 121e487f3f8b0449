//! Usage price resolution

use std::sync::Arc;

use meterline_shared::{AttributionId, EntityKind};

use crate::client::PriceIds;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::outcome::{Outcome, WarningKind};
use crate::processor::PaymentProcessor;

/// Price metadata key holding the text shown to customers
pub const PRICE_DESCRIPTION_METADATA_KEY: &str = "human_readable_description";
const NO_PRICE_INFORMATION: &str = "No information available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    Usd,
    Eur,
}

impl Currency {
    /// Case-insensitive; `None` for anything unsupported
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("usd") {
            Some(Currency::Usd)
        } else if s.eq_ignore_ascii_case("eur") {
            Some(Currency::Eur)
        } else {
            None
        }
    }
}

impl PriceIds {
    pub fn price_for(&self, kind: EntityKind, currency: Currency) -> &str {
        let prices = match kind {
            EntityKind::Individual => &self.individual_usage,
            EntityKind::Organization => &self.team_usage,
        };
        match currency {
            Currency::Usd => &prices.usd,
            Currency::Eur => &prices.eur,
        }
    }

    /// Price for an entity kind in the customer's preferred currency, USD when
    /// the preference is unset or unsupported
    pub fn resolve(&self, kind: EntityKind, preferred_currency: Option<&str>) -> Outcome<String> {
        match preferred_currency.and_then(Currency::parse) {
            Some(currency) => Outcome::new(self.price_for(kind, currency).to_string()),
            None => {
                let mut outcome = Outcome::new(self.price_for(kind, Currency::Usd).to_string());
                outcome.warn(
                    WarningKind::DefaultCurrencyApplied,
                    format!(
                        "preferred currency {:?} not supported, using USD",
                        preferred_currency.unwrap_or_default()
                    ),
                );
                outcome
            }
        }
    }
}

#[derive(Clone)]
pub struct PricingService {
    processor: Arc<dyn PaymentProcessor>,
    customers: CustomerService,
    prices: PriceIds,
}

impl PricingService {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        customers: CustomerService,
        prices: PriceIds,
    ) -> Self {
        Self {
            processor,
            customers,
            prices,
        }
    }

    pub fn price_ids(&self) -> &PriceIds {
        &self.prices
    }

    /// Human-readable description of the price an attribution pays
    pub async fn get_price_information(
        &self,
        attribution_id: &AttributionId,
    ) -> BillingResult<Outcome<String>> {
        let mut outcome = Outcome::new(());

        let price_id = match self.effective_price_id(attribution_id).await {
            Ok(resolved) => outcome.absorb(resolved),
            Err(e) => {
                tracing::warn!(
                    attribution_id = %attribution_id,
                    error = %e,
                    "Failed to resolve price, falling back to team USD price"
                );
                self.prices.team_usage.usd.clone()
            }
        };

        let price = self
            .processor
            .get_price_information(&price_id)
            .await
            .map_err(|e| {
                BillingError::Internal(format!("Failed to load price {}: {}", price_id, e))
            })?;

        let description = price
            .metadata
            .get(PRICE_DESCRIPTION_METADATA_KEY)
            .filter(|d| !d.is_empty())
            .cloned()
            .unwrap_or_else(|| NO_PRICE_INFORMATION.to_string());

        Ok(outcome.map(|_| description))
    }

    async fn effective_price_id(
        &self,
        attribution_id: &AttributionId,
    ) -> BillingResult<Outcome<String>> {
        let mut outcome = Outcome::new(());
        let resolved = self.customers.resolve_by_attribution(attribution_id).await?;
        let external = outcome.absorb(resolved);

        let customer = self
            .processor
            .get_customer(&external.processor_customer_id)
            .await
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        if let Some(price_id) = customer
            .active_subscription()
            .and_then(|s| s.price_id.clone())
        {
            return Ok(outcome.map(|_| price_id));
        }

        let price_id = outcome.absorb(
            self.prices
                .resolve(attribution_id.kind(), customer.preferred_currency()),
        );
        Ok(outcome.map(|_| price_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorPrice;
    use crate::testing::{customer, subscription, test_price_ids, FakeProcessor, InMemoryStore};
    use std::collections::HashMap;

    fn pricing() -> (Arc<FakeProcessor>, PricingService) {
        let store = Arc::new(InMemoryStore::default());
        let processor = Arc::new(FakeProcessor::default());
        let customers = CustomerService::new(store, processor.clone());
        let service = PricingService::new(processor.clone(), customers, test_price_ids());

        for (id, text) in [
            ("price_team_usd", "Team usage, USD"),
            ("price_team_eur", "Team usage, EUR"),
            ("price_user_usd", ""),
        ] {
            let mut metadata = HashMap::new();
            metadata.insert(PRICE_DESCRIPTION_METADATA_KEY.to_string(), text.to_string());
            processor.state().prices.insert(
                id.to_string(),
                ProcessorPrice {
                    id: id.to_string(),
                    metadata,
                },
            );
        }

        (processor, service)
    }

    #[test]
    fn test_resolve_by_kind_and_currency() {
        let prices = test_price_ids();

        let eur_team = prices.resolve(EntityKind::Organization, Some("eur"));
        assert_eq!(eur_team.value, "price_team_eur");
        assert!(eur_team.warnings.is_empty());

        let usd_user = prices.resolve(EntityKind::Individual, Some("USD"));
        assert_eq!(usd_user.value, "price_user_usd");
    }

    #[test]
    fn test_resolve_falls_back_to_usd_for_both_kinds() {
        let prices = test_price_ids();

        for (kind, expected) in [
            (EntityKind::Individual, "price_user_usd"),
            (EntityKind::Organization, "price_team_usd"),
        ] {
            for currency in [None, Some("GBP"), Some("")] {
                let outcome = prices.resolve(kind, currency);
                assert_eq!(outcome.value, expected);
                assert!(outcome.has_warning(WarningKind::DefaultCurrencyApplied));
            }
        }
    }

    #[tokio::test]
    async fn test_price_information_uses_active_subscription_price() {
        let (processor, service) = pricing();
        let mut cus = customer("cus_42", "team:42", Some("USD"));
        let mut sub = subscription("sub_1", "cus_42", "active");
        sub.price_id = Some("price_team_eur".to_string());
        cus.subscriptions.push(sub);
        processor.add_customer(cus);

        let outcome = service
            .get_price_information(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(outcome.value, "Team usage, EUR");
    }

    #[tokio::test]
    async fn test_price_information_defaults_when_description_missing() {
        let (processor, service) = pricing();
        processor.add_customer(customer("cus_5", "user:5", Some("USD")));

        let outcome = service
            .get_price_information(&AttributionId::individual("5"))
            .await
            .unwrap();

        assert_eq!(outcome.value, NO_PRICE_INFORMATION);
    }

    #[tokio::test]
    async fn test_price_information_falls_back_to_team_usd() {
        let (_processor, service) = pricing();

        let outcome = service
            .get_price_information(&AttributionId::individual("unknown"))
            .await
            .unwrap();

        assert_eq!(outcome.value, "Team usage, USD");
    }
}
