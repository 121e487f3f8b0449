//! Usage reconciliation and invoice settlement
//!
//! The ledger is the source of truth for usage. `reconcile_all` pushes each
//! processor-billed balance to Stripe as the metered quantity; settling a
//! finalized invoice appends a negative adjustment so the next cycle starts
//! from zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use meterline_shared::{AttributionId, CreditCents};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cost_center::CostCenterManager;
use crate::error::{BillingError, BillingResult};
use crate::outcome::{Outcome, WarningKind};
use crate::processor::{PaymentProcessor, ProcessorInvoice};
use crate::store::{BillingStrategy, UsageKind, UsageRecord, UsageStore};

const INVOICE_ADJUSTMENT_NAMESPACE: Uuid = Uuid::from_u128(0x4d8f_1c2a_9b3e_5f60_a7d4_e2c1_0b9f_3a58);

/// Ledger id of the adjustment that settles `invoice_id`. Replayed
/// notifications for the same invoice map to the same record.
pub fn invoice_adjustment_id(invoice_id: &str) -> Uuid {
    Uuid::new_v5(&INVOICE_ADJUSTMENT_NAMESPACE, invoice_id.as_bytes())
}

/// Ledger entry settling a finalized invoice
pub fn invoice_usage_record(invoice: &ProcessorInvoice) -> BillingResult<UsageRecord> {
    let customer = invoice.customer.as_ref().ok_or_else(|| {
        BillingError::Internal(format!("Invoice {} has no customer", invoice.id))
    })?;
    let attribution_id = customer
        .attribution_id()
        .map_err(|e| BillingError::Internal(e.to_string()))?;

    if invoice.lines.is_empty() {
        return Err(BillingError::Internal(format!(
            "Invoice {} has no line items",
            invoice.id
        )));
    }
    let credits = invoice.total_quantity();

    let effective_time = invoice.finalized_at.unwrap_or_else(|| {
        tracing::warn!(invoice_id = %invoice.id, "Invoice has no finalization time, using now");
        OffsetDateTime::now_utc()
    });

    Ok(UsageRecord {
        id: invoice_adjustment_id(&invoice.id),
        attribution_id,
        credit_cents: CreditCents::from_credits(-credits),
        description: format!("Invoice {} finalized in Stripe", invoice.id),
        effective_time,
        kind: UsageKind::InvoiceAdjustment,
        draft: false,
        metadata: Some(serde_json::json!({
            "invoiceId": invoice.id,
            "creditsOnInvoice": credits,
        })),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Attributions with a non-draft balance
    pub balances: usize,
    /// Whole credits pushed per processor-billed attribution
    pub pushed: BTreeMap<AttributionId, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub usage_id: Uuid,
    pub attribution_id: AttributionId,
    pub credits: i64,
    /// False when the invoice had already been settled
    pub applied: bool,
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn UsageStore>,
    processor: Arc<dyn PaymentProcessor>,
    cost_centers: CostCenterManager,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn UsageStore>,
        processor: Arc<dyn PaymentProcessor>,
        cost_centers: CostCenterManager,
    ) -> Self {
        Self {
            store,
            processor,
            cost_centers,
        }
    }

    pub async fn get_balance(
        &self,
        attribution_id: &AttributionId,
    ) -> BillingResult<Outcome<CreditCents>> {
        let balance = self
            .store
            .get_balance(attribution_id)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to load balance: {}", e)))?;
        Ok(Outcome::new(balance))
    }

    /// Push every processor-billed balance to Stripe, rounded up to whole
    /// credits. Safe to run repeatedly.
    pub async fn reconcile_all(&self) -> BillingResult<Outcome<ReconcileSummary>> {
        let balances = self
            .store
            .list_balances()
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to list balances: {}", e)))?;

        let mut pushed = BTreeMap::new();
        for balance in &balances {
            let cost_center = self
                .cost_centers
                .get_or_create_cost_center(&balance.attribution_id)
                .await?;
            if cost_center.billing_strategy != BillingStrategy::ProcessorBilled {
                continue;
            }
            pushed.insert(
                balance.attribution_id.clone(),
                balance.credit_cents.ceil_credits(),
            );
        }

        if !pushed.is_empty() {
            self.processor.update_usage(&pushed).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to push usage to Stripe");
                BillingError::Internal(format!("Failed to update usage: {}", e))
            })?;
        }

        tracing::info!(
            balances = balances.len(),
            pushed = pushed.len(),
            "Reconciled usage with Stripe"
        );

        Ok(Outcome::new(ReconcileSummary {
            balances: balances.len(),
            pushed,
        }))
    }

    /// Apply a finalized invoice to the ledger
    pub async fn settle_invoice(&self, invoice_id: &str) -> BillingResult<Outcome<Settlement>> {
        if invoice_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "invoice id must not be empty".to_string(),
            ));
        }

        let invoice = self
            .processor
            .get_invoice_with_customer(invoice_id)
            .await
            .map_err(|e| {
                tracing::warn!(invoice_id = %invoice_id, error = %e, "Failed to load invoice");
                BillingError::NotFound(format!("Invoice {} not found: {}", invoice_id, e))
            })?;

        let record = invoice_usage_record(&invoice)?;
        let credits = invoice.total_quantity();
        let attribution_id = record.attribution_id.clone();

        let applied = self.store.insert_usage(&record).await.map_err(|e| {
            tracing::error!(
                invoice_id = %invoice_id,
                attribution_id = %attribution_id,
                error = %e,
                "Failed to insert invoice adjustment"
            );
            BillingError::Internal(format!("Failed to record invoice adjustment: {}", e))
        })?;

        let mut outcome = Outcome::new(Settlement {
            usage_id: record.id,
            attribution_id: attribution_id.clone(),
            credits,
            applied,
        });

        if applied {
            tracing::info!(
                invoice_id = %invoice_id,
                attribution_id = %attribution_id,
                credits = credits,
                "Settled invoice"
            );
        } else {
            // Follow-up steps still run so a replay retries what failed before
            tracing::info!(
                invoice_id = %invoice_id,
                attribution_id = %attribution_id,
                "Invoice already settled"
            );
            outcome.warn(
                WarningKind::InvoiceAlreadySettled,
                format!("invoice {} was already applied", invoice_id),
            );
        }

        if let Err(e) = self
            .cost_centers
            .increment_billing_cycle(&attribution_id, OffsetDateTime::now_utc())
            .await
        {
            tracing::warn!(
                attribution_id = %attribution_id,
                error = %e,
                "Failed to advance billing cycle"
            );
            outcome.warn(WarningKind::BillingCycleNotAdvanced, e.to_string());
        }

        if let Err(e) = self.push_balance(&attribution_id).await {
            tracing::warn!(
                attribution_id = %attribution_id,
                error = %e,
                "Failed to push usage after settlement, next reconcile will catch up"
            );
            outcome.warn(WarningKind::UsageSyncDeferred, e.to_string());
        }

        Ok(outcome)
    }

    async fn push_balance(&self, attribution_id: &AttributionId) -> BillingResult<()> {
        let balance = self
            .store
            .get_balance(attribution_id)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to load balance: {}", e)))?;

        let mut usage = BTreeMap::new();
        usage.insert(attribution_id.clone(), balance.ceil_credits());

        self.processor
            .update_usage(&usage)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to update usage: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::InvoiceLine;
    use crate::testing::customer;

    fn invoice(lines: &[i64]) -> ProcessorInvoice {
        ProcessorInvoice {
            id: "inv_1".to_string(),
            customer: Some(customer("cus_42", "team:42", Some("USD"))),
            finalized_at: Some(time::macros::datetime!(2026-10-01 00:00 UTC)),
            lines: lines.iter().map(|q| InvoiceLine { quantity: *q }).collect(),
        }
    }

    #[test]
    fn test_adjustment_id_is_stable_per_invoice() {
        assert_eq!(invoice_adjustment_id("inv_1"), invoice_adjustment_id("inv_1"));
        assert_ne!(invoice_adjustment_id("inv_1"), invoice_adjustment_id("inv_2"));
    }

    #[test]
    fn test_invoice_usage_record() {
        let record = invoice_usage_record(&invoice(&[300, 150])).unwrap();

        assert_eq!(record.credit_cents, CreditCents::from_credits(-450));
        assert_eq!(record.kind, UsageKind::InvoiceAdjustment);
        assert_eq!(record.attribution_id, AttributionId::organization("42"));
        assert_eq!(record.description, "Invoice inv_1 finalized in Stripe");
        assert_eq!(
            record.effective_time,
            time::macros::datetime!(2026-10-01 00:00 UTC)
        );
        assert!(!record.draft);
    }

    #[test]
    fn test_invoice_without_lines_or_customer_is_internal() {
        assert!(matches!(
            invoice_usage_record(&invoice(&[])),
            Err(BillingError::Internal(_))
        ));

        let mut orphan = invoice(&[10]);
        orphan.customer = None;
        assert!(matches!(
            invoice_usage_record(&orphan),
            Err(BillingError::Internal(_))
        ));
    }
}
