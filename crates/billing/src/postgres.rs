//! Postgres-backed [`UsageStore`]

use async_trait::async_trait;
use meterline_shared::{AttributionId, CreditCents};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::{
    Balance, BillingStrategy, CostCenter, ExternalCustomer, SortOrder, StoreError, UsageKind,
    UsageQuery, UsageRecord, UsageStore,
};

#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CostCenterRow {
    attribution_id: String,
    billing_strategy: String,
    spending_limit: i32,
    billing_cycle_start: OffsetDateTime,
    next_billing_time: Option<OffsetDateTime>,
}

impl TryFrom<CostCenterRow> for CostCenter {
    type Error = StoreError;

    fn try_from(row: CostCenterRow) -> Result<Self, Self::Error> {
        let attribution_id = AttributionId::parse(&row.attribution_id)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let billing_strategy = BillingStrategy::parse(&row.billing_strategy).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown billing strategy {}", row.billing_strategy))
        })?;

        Ok(CostCenter {
            attribution_id,
            billing_strategy,
            spending_limit: row.spending_limit,
            billing_cycle_start: row.billing_cycle_start,
            next_billing_time: row.next_billing_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    id: Uuid,
    attribution_id: String,
    credit_cents: i64,
    description: String,
    effective_time: OffsetDateTime,
    kind: String,
    draft: bool,
    metadata: Option<serde_json::Value>,
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = StoreError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        let attribution_id = AttributionId::parse(&row.attribution_id)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let kind = UsageKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown usage kind {}", row.kind)))?;

        Ok(UsageRecord {
            id: row.id,
            attribution_id,
            credit_cents: CreditCents::new(row.credit_cents),
            description: row.description,
            effective_time: row.effective_time,
            kind,
            draft: row.draft,
            metadata: row.metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StripeCustomerRow {
    stripe_customer_id: String,
    attribution_id: String,
    currency: String,
    creation_time: OffsetDateTime,
}

impl TryFrom<StripeCustomerRow> for ExternalCustomer {
    type Error = StoreError;

    fn try_from(row: StripeCustomerRow) -> Result<Self, Self::Error> {
        let attribution_id = AttributionId::parse(&row.attribution_id)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(ExternalCustomer {
            attribution_id,
            processor_customer_id: row.stripe_customer_id,
            preferred_currency: row.currency,
            creation_time: row.creation_time,
        })
    }
}

const LIST_USAGE_ASC: &str = r#"
    SELECT id, attribution_id, credit_cents, description, effective_time, kind, draft, metadata
    FROM usage
    WHERE attribution_id = $1 AND effective_time >= $2 AND effective_time < $3
    ORDER BY effective_time ASC, id
    LIMIT $4 OFFSET $5
"#;

const LIST_USAGE_DESC: &str = r#"
    SELECT id, attribution_id, credit_cents, description, effective_time, kind, draft, metadata
    FROM usage
    WHERE attribution_id = $1 AND effective_time >= $2 AND effective_time < $3
    ORDER BY effective_time DESC, id
    LIMIT $4 OFFSET $5
"#;

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage
                (id, attribution_id, credit_cents, description, effective_time, kind, draft, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.attribution_id.to_string())
        .bind(record.credit_cents.cents())
        .bind(&record.description)
        .bind(record.effective_time)
        .bind(record.kind.as_str())
        .bind(record.draft)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_balance(&self, attribution_id: &AttributionId) -> Result<CreditCents, StoreError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(credit_cents), 0)::BIGINT
            FROM usage
            WHERE attribution_id = $1 AND draft = FALSE
            "#,
        )
        .bind(attribution_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(CreditCents::new(total))
    }

    async fn list_balances(&self) -> Result<Vec<Balance>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT attribution_id, SUM(credit_cents)::BIGINT
            FROM usage
            WHERE draft = FALSE
            GROUP BY attribution_id
            ORDER BY attribution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(attribution_id, cents)| {
                let attribution_id = AttributionId::parse(&attribution_id)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Balance {
                    attribution_id,
                    credit_cents: CreditCents::new(cents),
                })
            })
            .collect()
    }

    async fn list_usage(&self, query: &UsageQuery) -> Result<Vec<UsageRecord>, StoreError> {
        // Direction can't be bound as a parameter
        let sql = match query.order {
            SortOrder::Ascending => LIST_USAGE_ASC,
            SortOrder::Descending => LIST_USAGE_DESC,
        };

        let rows: Vec<UsageRow> = sqlx::query_as(sql)
            .bind(query.attribution_id.to_string())
            .bind(query.from)
            .bind(query.to)
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(UsageRecord::try_from).collect()
    }

    async fn count_usage(
        &self,
        attribution_id: &AttributionId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM usage
            WHERE attribution_id = $1 AND effective_time >= $2 AND effective_time < $3
            "#,
        )
        .bind(attribution_id.to_string())
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn find_cost_center(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<Option<CostCenter>, StoreError> {
        let row: Option<CostCenterRow> = sqlx::query_as(
            r#"
            SELECT attribution_id, billing_strategy, spending_limit,
                   billing_cycle_start, next_billing_time
            FROM cost_centers
            WHERE attribution_id = $1
            "#,
        )
        .bind(attribution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CostCenter::try_from).transpose()
    }

    async fn insert_cost_center_if_absent(
        &self,
        cost_center: &CostCenter,
    ) -> Result<CostCenter, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cost_centers
                (attribution_id, billing_strategy, spending_limit, billing_cycle_start, next_billing_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (attribution_id) DO NOTHING
            "#,
        )
        .bind(cost_center.attribution_id.to_string())
        .bind(cost_center.billing_strategy.as_str())
        .bind(cost_center.spending_limit)
        .bind(cost_center.billing_cycle_start)
        .bind(cost_center.next_billing_time)
        .execute(&self.pool)
        .await?;

        self.find_cost_center(&cost_center.attribution_id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn update_cost_center(&self, cost_center: &CostCenter) -> Result<CostCenter, StoreError> {
        let row: CostCenterRow = sqlx::query_as(
            r#"
            UPDATE cost_centers
            SET billing_strategy = $2,
                spending_limit = $3,
                billing_cycle_start = $4,
                next_billing_time = $5,
                updated_at = NOW()
            WHERE attribution_id = $1
            RETURNING attribution_id, billing_strategy, spending_limit,
                      billing_cycle_start, next_billing_time
            "#,
        )
        .bind(cost_center.attribution_id.to_string())
        .bind(cost_center.billing_strategy.as_str())
        .bind(cost_center.spending_limit)
        .bind(cost_center.billing_cycle_start)
        .bind(cost_center.next_billing_time)
        .fetch_one(&self.pool)
        .await?;

        CostCenter::try_from(row)
    }

    async fn get_stripe_customer_by_attribution(
        &self,
        attribution_id: &AttributionId,
    ) -> Result<ExternalCustomer, StoreError> {
        let row: StripeCustomerRow = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, attribution_id, currency, creation_time
            FROM stripe_customers
            WHERE attribution_id = $1
            "#,
        )
        .bind(attribution_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        ExternalCustomer::try_from(row)
    }

    async fn get_stripe_customer(
        &self,
        processor_customer_id: &str,
    ) -> Result<ExternalCustomer, StoreError> {
        let row: StripeCustomerRow = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, attribution_id, currency, creation_time
            FROM stripe_customers
            WHERE stripe_customer_id = $1
            "#,
        )
        .bind(processor_customer_id)
        .fetch_one(&self.pool)
        .await?;

        ExternalCustomer::try_from(row)
    }

    async fn create_stripe_customer(&self, customer: &ExternalCustomer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stripe_customers (stripe_customer_id, attribution_id, currency, creation_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&customer.processor_customer_id)
        .bind(customer.attribution_id.to_string())
        .bind(&customer.preferred_currency)
        .bind(customer.creation_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
