//! Ledger and cost-center persistence
//!
//! The [`UsageStore`] trait is the boundary to the transactional store. The
//! production implementation lives in [`crate::postgres`]; tests use an
//! in-memory fake.

use async_trait::async_trait;
use meterline_shared::{AttributionId, CreditCents};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// Usage accrued by workspaces
    WorkspaceUsage,
    /// Credits settled by a finalized invoice
    InvoiceAdjustment,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::WorkspaceUsage => "workspace_usage",
            UsageKind::InvoiceAdjustment => "invoice_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workspace_usage" => Some(UsageKind::WorkspaceUsage),
            "invoice_adjustment" => Some(UsageKind::InvoiceAdjustment),
            _ => None,
        }
    }
}

/// One immutable ledger entry. Negative amounts are settlements.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub attribution_id: AttributionId,
    pub credit_cents: CreditCents,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_time: OffsetDateTime,
    pub kind: UsageKind,
    pub draft: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Order of ledger entries by effective time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// One page of ledger entries for an attribution, effective in `[from, to)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery {
    pub attribution_id: AttributionId,
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

/// Derived balance of one attribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub attribution_id: AttributionId,
    pub credit_cents: CreditCents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStrategy {
    None,
    /// Usage is pushed to and invoiced by the payment processor
    ProcessorBilled,
    /// Billed out of band (free tier, manual invoicing)
    Other,
}

impl BillingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStrategy::None => "none",
            BillingStrategy::ProcessorBilled => "processor_billed",
            BillingStrategy::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(BillingStrategy::None),
            "processor_billed" => Some(BillingStrategy::ProcessorBilled),
            "other" => Some(BillingStrategy::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-attribution billing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostCenter {
    pub attribution_id: AttributionId,
    pub billing_strategy: BillingStrategy,
    pub spending_limit: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub billing_cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_billing_time: Option<OffsetDateTime>,
}

/// Cached mapping from an attribution to its processor customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCustomer {
    pub attribution_id: AttributionId,
    pub processor_customer_id: String,
    pub preferred_currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Append a ledger entry. Returns `false` when a record with the same id
    /// already exists, in which case nothing is written.
    async fn insert_usage(&self, record: &UsageRecord) -> Result<bool, StoreError>;

    /// Sum of non-draft credit cents for one attribution
    async fn get_balance(&self, attribution_id: &AttributionId) -> Result<CreditCents, StoreError>;

    /// Balances of every attribution with at least one non-draft entry
    async fn list_balances(&self) -> Result<Vec<Balance>, StoreError>;

    /// Ledger entries matching `query`, drafts included, ties broken by id
    async fn list_usage(&self, query: &UsageQuery) -> Result<Vec<UsageRecord>, StoreError>;

    /// Number of ledger entries effective in `[from, to)`
    async fn count_usage(
        &self,
        attribution_id: &AttributionId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<i64, StoreError>;

    async fn find_cost_center(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<Option<CostCenter>, StoreError>;

    /// Insert the cost center unless one exists; returns whichever is stored
    async fn insert_cost_center_if_absent(
        &self,
        cost_center: &CostCenter,
    ) -> Result<CostCenter, StoreError>;

    async fn update_cost_center(&self, cost_center: &CostCenter) -> Result<CostCenter, StoreError>;

    async fn get_stripe_customer_by_attribution(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<ExternalCustomer, StoreError>;

    async fn get_stripe_customer(
        &self,
        processor_customer_id: &str,
    ) -> Result<ExternalCustomer, StoreError>;

    async fn create_stripe_customer(&self, customer: &ExternalCustomer) -> Result<(), StoreError>;
}
