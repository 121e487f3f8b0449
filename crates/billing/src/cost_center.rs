//! Cost center management
//!
//! A cost center holds the billing configuration of one attribution: how it
//! is billed, its spending limit and the boundaries of its current billing
//! cycle. Cost centers are created lazily and superseded in place.

use std::sync::Arc;

use meterline_shared::{AttributionId, EntityKind};
use time::{Duration, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStrategy, CostCenter, UsageStore};

const DEFAULT_SPENDING_LIMIT_USERS: i32 = 500;
const DEFAULT_SPENDING_LIMIT_TEAMS: i32 = 0;

/// Spending limits given to newly created cost centers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostCenterDefaults {
    pub for_users: i32,
    pub for_teams: i32,
}

impl Default for CostCenterDefaults {
    fn default() -> Self {
        Self {
            for_users: DEFAULT_SPENDING_LIMIT_USERS,
            for_teams: DEFAULT_SPENDING_LIMIT_TEAMS,
        }
    }
}

impl CostCenterDefaults {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            for_users: limit_from_env("DEFAULT_SPENDING_LIMIT_USERS", defaults.for_users)?,
            for_teams: limit_from_env("DEFAULT_SPENDING_LIMIT_TEAMS", defaults.for_teams)?,
        })
    }

    fn limit_for(&self, kind: EntityKind) -> i32 {
        match kind {
            EntityKind::Individual => self.for_users,
            EntityKind::Organization => self.for_teams,
        }
    }
}

fn limit_from_env(key: &str, default: i32) -> BillingResult<i32> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<i32>()
            .ok()
            .filter(|limit| *limit >= 0)
            .ok_or_else(|| BillingError::Config(format!("{} must be a non-negative integer", key))),
        Err(_) => Ok(default),
    }
}

/// Same day next month, clamped to the last day of a shorter month
pub fn add_one_month(t: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match t.month() {
        Month::December => (t.year() + 1, Month::January),
        m => (t.year(), m.next()),
    };

    t.replace_day(1)
        .and_then(|d| d.replace_year(year))
        .and_then(|d| d.replace_month(month))
        .ok()
        .and_then(|first| (1..=t.day()).rev().find_map(|day| first.replace_day(day).ok()))
        .unwrap_or(t + Duration::days(30))
}

impl CostCenter {
    /// Fresh cost center for an attribution seen for the first time
    pub fn new_default(
        attribution_id: AttributionId,
        defaults: &CostCenterDefaults,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            spending_limit: defaults.limit_for(attribution_id.kind()),
            attribution_id,
            billing_strategy: BillingStrategy::Other,
            billing_cycle_start: now,
            next_billing_time: None,
        }
    }

    /// Whether the current cycle has ended at `now`
    pub fn cycle_due(&self, now: OffsetDateTime) -> bool {
        match self.next_billing_time {
            Some(next) => next <= now,
            None => true,
        }
    }

    /// Move to the cycle containing `now`. Cycles are one month long and
    /// start where the previous one ended.
    pub fn advance_billing_cycle(&mut self, now: OffsetDateTime) {
        if !self.cycle_due(now) {
            return;
        }

        let mut start = self.next_billing_time.unwrap_or(now);
        let mut next = add_one_month(start);
        while next <= now {
            start = next;
            next = add_one_month(next);
        }

        self.billing_cycle_start = start;
        self.next_billing_time = Some(next);
    }
}

#[derive(Clone)]
pub struct CostCenterManager {
    store: Arc<dyn UsageStore>,
    defaults: CostCenterDefaults,
}

impl CostCenterManager {
    pub fn new(store: Arc<dyn UsageStore>, defaults: CostCenterDefaults) -> Self {
        Self { store, defaults }
    }

    pub async fn get_or_create_cost_center(
        &self,
        attribution_id: &AttributionId,
    ) -> BillingResult<CostCenter> {
        let existing = self
            .store
            .find_cost_center(attribution_id)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to load cost center: {}", e)))?;

        if let Some(cost_center) = existing {
            return Ok(cost_center);
        }

        let cost_center = CostCenter::new_default(
            attribution_id.clone(),
            &self.defaults,
            OffsetDateTime::now_utc(),
        );
        let stored = self
            .store
            .insert_cost_center_if_absent(&cost_center)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to create cost center: {}", e)))?;

        tracing::info!(
            attribution_id = %attribution_id,
            spending_limit = stored.spending_limit,
            "Created cost center"
        );

        Ok(stored)
    }

    /// Apply a new strategy and spending limit.
    ///
    /// Switching into processor billing opens a fresh cycle at `now`;
    /// switching out of it clears the cycle end. Cycle boundaries are
    /// otherwise kept as stored.
    pub async fn update_cost_center(
        &self,
        attribution_id: &AttributionId,
        billing_strategy: BillingStrategy,
        spending_limit: i32,
    ) -> BillingResult<CostCenter> {
        if spending_limit < 0 {
            return Err(BillingError::InvalidArgument(
                "spending limit must not be negative".to_string(),
            ));
        }

        let existing = self.get_or_create_cost_center(attribution_id).await?;
        let now = OffsetDateTime::now_utc();

        let mut updated = existing.clone();
        updated.billing_strategy = billing_strategy;
        updated.spending_limit = spending_limit;

        let was_processor_billed = existing.billing_strategy == BillingStrategy::ProcessorBilled;
        let is_processor_billed = billing_strategy == BillingStrategy::ProcessorBilled;
        if is_processor_billed && !was_processor_billed {
            updated.billing_cycle_start = now;
            updated.next_billing_time = Some(add_one_month(now));
        } else if was_processor_billed && !is_processor_billed {
            updated.billing_cycle_start = now;
            updated.next_billing_time = None;
        }

        if updated == existing {
            return Ok(existing);
        }

        let stored = self
            .store
            .update_cost_center(&updated)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to update cost center: {}", e)))?;

        tracing::info!(
            attribution_id = %attribution_id,
            from = %existing.billing_strategy,
            to = %stored.billing_strategy,
            spending_limit = stored.spending_limit,
            "Updated cost center"
        );

        Ok(stored)
    }

    pub async fn set_spending_limit(
        &self,
        attribution_id: &AttributionId,
        spending_limit: i32,
    ) -> BillingResult<CostCenter> {
        let existing = self.get_or_create_cost_center(attribution_id).await?;
        self.update_cost_center(attribution_id, existing.billing_strategy, spending_limit)
            .await
    }

    /// Advance the billing cycle if it ended before `now`
    pub async fn increment_billing_cycle(
        &self,
        attribution_id: &AttributionId,
        now: OffsetDateTime,
    ) -> BillingResult<CostCenter> {
        let mut cost_center = self.get_or_create_cost_center(attribution_id).await?;

        if !cost_center.cycle_due(now) {
            tracing::debug!(
                attribution_id = %attribution_id,
                "Billing cycle still running, not advancing"
            );
            return Ok(cost_center);
        }

        cost_center.advance_billing_cycle(now);
        let stored = self
            .store
            .update_cost_center(&cost_center)
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to advance billing cycle: {}", e)))?;

        tracing::info!(
            attribution_id = %attribution_id,
            next_billing_time = ?stored.next_billing_time,
            "Advanced billing cycle"
        );

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryStore;
    use time::macros::datetime;

    fn manager(store: Arc<InMemoryStore>) -> CostCenterManager {
        CostCenterManager::new(store, CostCenterDefaults::default())
    }

    #[test]
    fn test_add_one_month() {
        assert_eq!(
            add_one_month(datetime!(2026-03-15 10:00 UTC)),
            datetime!(2026-04-15 10:00 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2026-12-31 00:00 UTC)),
            datetime!(2027-01-31 00:00 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2026-01-31 08:30 UTC)),
            datetime!(2026-02-28 08:30 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2028-01-30 00:00 UTC)),
            datetime!(2028-02-29 00:00 UTC)
        );
    }

    #[test]
    fn test_advance_cycle_skips_missed_months() {
        let mut cc = CostCenter::new_default(
            AttributionId::organization("42"),
            &CostCenterDefaults::default(),
            datetime!(2026-01-01 00:00 UTC),
        );
        cc.next_billing_time = Some(datetime!(2026-02-01 00:00 UTC));

        cc.advance_billing_cycle(datetime!(2026-04-10 00:00 UTC));

        assert_eq!(cc.billing_cycle_start, datetime!(2026-04-01 00:00 UTC));
        assert_eq!(cc.next_billing_time, Some(datetime!(2026-05-01 00:00 UTC)));
    }

    #[test]
    fn test_advance_cycle_not_due_is_noop() {
        let mut cc = CostCenter::new_default(
            AttributionId::individual("5"),
            &CostCenterDefaults::default(),
            datetime!(2026-01-01 00:00 UTC),
        );
        cc.next_billing_time = Some(datetime!(2026-02-01 00:00 UTC));
        let before = cc.clone();

        cc.advance_billing_cycle(datetime!(2026-01-20 00:00 UTC));

        assert_eq!(cc, before);
    }

    #[test]
    fn test_advance_cycle_without_end_starts_now() {
        let now = datetime!(2026-06-10 12:00 UTC);
        let mut cc = CostCenter::new_default(
            AttributionId::individual("5"),
            &CostCenterDefaults::default(),
            datetime!(2026-01-01 00:00 UTC),
        );

        cc.advance_billing_cycle(now);

        assert_eq!(cc.billing_cycle_start, now);
        assert_eq!(cc.next_billing_time, Some(datetime!(2026-07-10 12:00 UTC)));
    }

    #[tokio::test]
    async fn test_get_or_create_uses_kind_defaults() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());

        let user = manager
            .get_or_create_cost_center(&AttributionId::individual("5"))
            .await
            .unwrap();
        let team = manager
            .get_or_create_cost_center(&AttributionId::organization("42"))
            .await
            .unwrap();

        assert_eq!(user.billing_strategy, BillingStrategy::Other);
        assert_eq!(user.spending_limit, DEFAULT_SPENDING_LIMIT_USERS);
        assert_eq!(team.spending_limit, DEFAULT_SPENDING_LIMIT_TEAMS);
        assert_eq!(user.next_billing_time, None);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());
        let id = AttributionId::organization("42");

        manager
            .update_cost_center(&id, BillingStrategy::ProcessorBilled, 1000)
            .await
            .unwrap();
        let again = manager.get_or_create_cost_center(&id).await.unwrap();

        assert_eq!(again.billing_strategy, BillingStrategy::ProcessorBilled);
        assert_eq!(again.spending_limit, 1000);
    }

    #[tokio::test]
    async fn test_switch_into_processor_billing_opens_cycle() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());
        let id = AttributionId::individual("5");

        let updated = manager
            .update_cost_center(&id, BillingStrategy::ProcessorBilled, 500)
            .await
            .unwrap();

        let next = updated.next_billing_time.unwrap();
        assert_eq!(next, add_one_month(updated.billing_cycle_start));
    }

    #[tokio::test]
    async fn test_switch_out_of_processor_billing_clears_cycle_end() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());
        let id = AttributionId::individual("5");

        manager
            .update_cost_center(&id, BillingStrategy::ProcessorBilled, 500)
            .await
            .unwrap();
        let updated = manager
            .update_cost_center(&id, BillingStrategy::Other, 500)
            .await
            .unwrap();

        assert_eq!(updated.billing_strategy, BillingStrategy::Other);
        assert_eq!(updated.next_billing_time, None);
    }

    #[tokio::test]
    async fn test_negative_spending_limit_rejected() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());
        let id = AttributionId::individual("5");

        let err = manager.set_spending_limit(&id, -1).await.unwrap_err();

        assert!(matches!(err, BillingError::InvalidArgument(_)));
        assert!(store.cost_center(&id).is_none());
    }

    #[tokio::test]
    async fn test_increment_billing_cycle_skips_future_cycle() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());
        let id = AttributionId::organization("42");

        let opened = manager
            .update_cost_center(&id, BillingStrategy::ProcessorBilled, 0)
            .await
            .unwrap();
        let result = manager
            .increment_billing_cycle(&id, OffsetDateTime::now_utc())
            .await
            .unwrap();

        assert_eq!(result, opened);
    }

    #[tokio::test]
    async fn test_increment_billing_cycle_advances_past_cycle() {
        let store = Arc::new(InMemoryStore::default());
        let manager = manager(store.clone());
        let id = AttributionId::organization("42");

        let opened = manager
            .update_cost_center(&id, BillingStrategy::ProcessorBilled, 0)
            .await
            .unwrap();
        let old_end = opened.next_billing_time.unwrap();
        let later = old_end + Duration::days(1);

        let advanced = manager.increment_billing_cycle(&id, later).await.unwrap();

        assert_eq!(advanced.billing_cycle_start, old_end);
        assert_eq!(advanced.next_billing_time, Some(add_one_month(old_end)));
        assert_eq!(store.cost_center(&id).unwrap(), advanced);
    }
}
