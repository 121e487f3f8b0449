//! Chargeback enforcement
//!
//! When a customer disputes a charge, every account responsible for the
//! disputed attribution is blocked: the user itself for an individual, the
//! owners for a team.

use std::sync::Arc;

use meterline_shared::{AttributionId, EntityKind};
use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::identity::{IdentityGateway, TeamRole};
use crate::outcome::Outcome;
use crate::processor::PaymentProcessor;

pub fn dispute_block_reason(dispute_id: &str) -> String {
    format!("User has created a Stripe dispute ID: {}", dispute_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeEnforcement {
    pub attribution_id: AttributionId,
    pub blocked_user_ids: Vec<String>,
}

#[derive(Clone)]
pub struct DisputeService {
    processor: Arc<dyn PaymentProcessor>,
    identity: Arc<dyn IdentityGateway>,
}

impl DisputeService {
    pub fn new(processor: Arc<dyn PaymentProcessor>, identity: Arc<dyn IdentityGateway>) -> Self {
        Self {
            processor,
            identity,
        }
    }

    pub async fn on_charge_dispute(
        &self,
        dispute_id: &str,
    ) -> BillingResult<Outcome<DisputeEnforcement>> {
        if dispute_id.trim().is_empty() {
            return Err(BillingError::InvalidArgument(
                "dispute id must not be empty".to_string(),
            ));
        }

        // Unknown ids included; the id always comes from a Stripe event
        let dispute = self.processor.get_dispute(dispute_id).await.map_err(|e| {
            BillingError::Internal(format!("Failed to load dispute {}: {}", dispute_id, e))
        })?;

        let customer = dispute
            .payment_intent
            .and_then(|pi| pi.customer)
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Dispute {} has no payment intent customer",
                    dispute_id
                ))
            })?;
        let attribution_id = customer
            .attribution_id()
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        let targets = self.responsible_users(&attribution_id).await?;
        let reason = dispute_block_reason(dispute_id);

        tracing::info!(
            dispute_id = %dispute_id,
            attribution_id = %attribution_id,
            users = targets.len(),
            "Blocking users for charge dispute"
        );

        let mut blocked = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for user_id in targets {
            match self.identity.block_user(&user_id, &reason).await {
                Ok(()) => blocked.push(user_id),
                Err(e) => {
                    tracing::error!(
                        dispute_id = %dispute_id,
                        user_id = %user_id,
                        error = %e,
                        "Failed to block user"
                    );
                    failures.push(format!("{}: {}", user_id, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(BillingError::Internal(format!(
                "Failed to block users for dispute {}: {}",
                dispute_id,
                failures.join("; ")
            )));
        }

        Ok(Outcome::new(DisputeEnforcement {
            attribution_id,
            blocked_user_ids: blocked,
        }))
    }

    async fn responsible_users(&self, attribution_id: &AttributionId) -> BillingResult<Vec<String>> {
        let (kind, id) = attribution_id.values();
        match kind {
            EntityKind::Individual => Ok(vec![id.to_string()]),
            EntityKind::Organization => {
                let members = self.identity.get_team_members(id).await.map_err(|e| {
                    BillingError::Internal(format!("Failed to list members of team {}: {}", id, e))
                })?;
                Ok(members
                    .into_iter()
                    .filter(|m| m.role == TeamRole::Owner)
                    .map(|m| m.user_id)
                    .collect())
            }
        }
    }
}
