//! Paged ledger listing for an attribution

use std::sync::Arc;

use meterline_shared::AttributionId;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::outcome::Outcome;
use crate::store::{SortOrder, UsageQuery, UsageRecord, UsageStore};

pub const DEFAULT_PER_PAGE: u32 = 50;
pub const MAX_PER_PAGE: u32 = 1000;
pub const MAX_RANGE_DAYS: i64 = 300;

#[derive(Debug, Clone)]
pub struct ListUsageRequest {
    pub attribution_id: AttributionId,
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub order: SortOrder,
    /// 1-based
    pub page: u32,
    /// 0 selects [`DEFAULT_PER_PAGE`]
    pub per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePage {
    pub usage_entries: Vec<UsageRecord>,
    pub pagination: Pagination,
}

#[derive(Clone)]
pub struct UsageService {
    store: Arc<dyn UsageStore>,
}

impl UsageService {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// One page of ledger entries effective in `[from, to)`, drafts included.
    /// A page past the end is empty.
    pub async fn list_usage(&self, req: ListUsageRequest) -> BillingResult<Outcome<UsagePage>> {
        if req.from > req.to {
            return Err(BillingError::InvalidArgument(
                "from must not be after to".to_string(),
            ));
        }
        if req.to - req.from > Duration::days(MAX_RANGE_DAYS) {
            return Err(BillingError::InvalidArgument(format!(
                "range is too long, max range is {} days",
                MAX_RANGE_DAYS
            )));
        }
        if req.page == 0 {
            return Err(BillingError::InvalidArgument(
                "page starts at 1".to_string(),
            ));
        }
        let per_page = match req.per_page {
            0 => DEFAULT_PER_PAGE,
            n if n > MAX_PER_PAGE => {
                return Err(BillingError::InvalidArgument(format!(
                    "perPage must be at most {}",
                    MAX_PER_PAGE
                )))
            }
            n => n,
        };

        let total = self
            .store
            .count_usage(&req.attribution_id, req.from, req.to)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to count usage: {}", e)))?;

        let query = UsageQuery {
            attribution_id: req.attribution_id,
            from: req.from,
            to: req.to,
            order: req.order,
            limit: i64::from(per_page),
            offset: i64::from(req.page - 1) * i64::from(per_page),
        };
        let usage_entries = self
            .store
            .list_usage(&query)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to list usage: {}", e)))?;

        let per_page_total = i64::from(per_page);
        Ok(Outcome::new(UsagePage {
            usage_entries,
            pagination: Pagination {
                page: req.page,
                per_page,
                total,
                total_pages: (total + per_page_total - 1) / per_page_total,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UsageKind;
    use crate::testing::InMemoryStore;
    use meterline_shared::CreditCents;
    use time::macros::datetime;
    use uuid::Uuid;

    const START: OffsetDateTime = datetime!(2026-09-01 00:00 UTC);

    fn entry(attribution_id: &AttributionId, hours: i64, draft: bool) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            attribution_id: attribution_id.clone(),
            credit_cents: CreditCents::new(100 * hours),
            description: format!("workspace usage {}", hours),
            effective_time: START + Duration::hours(hours),
            kind: UsageKind::WorkspaceUsage,
            draft,
            metadata: None,
        }
    }

    fn service_with(records: Vec<UsageRecord>) -> UsageService {
        let store = Arc::new(InMemoryStore::default());
        store.state().usage = records;
        UsageService::new(store)
    }

    fn request(attribution_id: &AttributionId, page: u32, per_page: u32) -> ListUsageRequest {
        ListUsageRequest {
            attribution_id: attribution_id.clone(),
            from: START,
            to: START + Duration::days(1),
            order: SortOrder::Descending,
            page,
            per_page,
        }
    }

    fn hours(page: &UsagePage) -> Vec<i64> {
        page.usage_entries
            .iter()
            .map(|r| (r.effective_time - START).whole_hours())
            .collect()
    }

    #[tokio::test]
    async fn test_list_usage_range_is_half_open() {
        let team = AttributionId::organization("42");
        let other = AttributionId::organization("7");
        let service = service_with(vec![
            entry(&team, -1, false),
            entry(&team, 0, false),
            entry(&team, 23, true),
            entry(&team, 24, false),
            entry(&other, 5, false),
        ]);

        let page = service.list_usage(request(&team, 1, 0)).await.unwrap().value;

        assert_eq!(hours(&page), vec![23, 0]);
        assert_eq!(page.pagination.total, 2);
        assert_eq!(page.pagination.per_page, DEFAULT_PER_PAGE);
    }

    #[tokio::test]
    async fn test_list_usage_orders_by_effective_time() {
        let team = AttributionId::organization("42");
        let service = service_with(vec![
            entry(&team, 5, false),
            entry(&team, 1, false),
            entry(&team, 9, false),
        ]);

        let descending = service.list_usage(request(&team, 1, 10)).await.unwrap().value;
        assert_eq!(hours(&descending), vec![9, 5, 1]);

        let mut req = request(&team, 1, 10);
        req.order = SortOrder::Ascending;
        let ascending = service.list_usage(req).await.unwrap().value;
        assert_eq!(hours(&ascending), vec![1, 5, 9]);
    }

    #[tokio::test]
    async fn test_list_usage_pages() {
        let team = AttributionId::organization("42");
        let service = service_with((0..5).map(|h| entry(&team, h, false)).collect());

        let first = service.list_usage(request(&team, 1, 2)).await.unwrap().value;
        assert_eq!(hours(&first), vec![4, 3]);
        assert_eq!(first.pagination.total_pages, 3);

        let last = service.list_usage(request(&team, 3, 2)).await.unwrap().value;
        assert_eq!(hours(&last), vec![0]);

        let past_end = service.list_usage(request(&team, 4, 2)).await.unwrap().value;
        assert!(past_end.usage_entries.is_empty());
        assert_eq!(past_end.pagination.total, 5);
        assert_eq!(past_end.pagination.page, 4);
    }

    #[tokio::test]
    async fn test_list_usage_empty_ledger() {
        let team = AttributionId::organization("42");
        let service = service_with(Vec::new());

        let page = service.list_usage(request(&team, 1, 0)).await.unwrap().value;

        assert!(page.usage_entries.is_empty());
        assert_eq!(page.pagination.total, 0);
        assert_eq!(page.pagination.total_pages, 0);
    }

    #[tokio::test]
    async fn test_list_usage_rejects_bad_ranges() {
        let team = AttributionId::organization("42");
        let service = service_with(Vec::new());

        let mut inverted = request(&team, 1, 0);
        inverted.from = inverted.to + Duration::seconds(1);
        assert!(matches!(
            service.list_usage(inverted).await,
            Err(BillingError::InvalidArgument(_))
        ));

        let mut too_long = request(&team, 1, 0);
        too_long.to = too_long.from + Duration::days(MAX_RANGE_DAYS + 1);
        assert!(matches!(
            service.list_usage(too_long).await,
            Err(BillingError::InvalidArgument(_))
        ));

        let mut max_range = request(&team, 1, 0);
        max_range.to = max_range.from + Duration::days(MAX_RANGE_DAYS);
        assert!(service.list_usage(max_range).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_usage_rejects_bad_paging() {
        let team = AttributionId::organization("42");
        let service = service_with(Vec::new());

        assert!(matches!(
            service.list_usage(request(&team, 0, 10)).await,
            Err(BillingError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.list_usage(request(&team, 1, MAX_PER_PAGE + 1)).await,
            Err(BillingError::InvalidArgument(_))
        ));
    }
}
