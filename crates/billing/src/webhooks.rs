//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header and routes the events the engine
//! reacts to. Events are parsed into a minimal envelope so that payloads
//! from newer Stripe API versions still deserialize.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::disputes::DisputeService;
use crate::error::{BillingError, BillingResult};
use crate::outcome::Outcome;
use crate::reconcile::ReconciliationService;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: WebhookObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookObject {
    pub id: String,
}

/// What the handler did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    SettledInvoice,
    ActivatedSubscription,
    CanceledSubscription,
    EnforcedDispute,
    Ignored,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    subscriptions: SubscriptionService,
    reconciliation: ReconciliationService,
    disputes: DisputeService,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: String,
        subscriptions: SubscriptionService,
        reconciliation: ReconciliationService,
        disputes: DisputeService,
    ) -> Self {
        Self {
            webhook_secret,
            subscriptions,
            reconciliation,
            disputes,
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        // Header format: t=timestamp,v1=signature[,v1=signature...]
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => v1_signatures.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if v1_signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let matches = v1_signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&expected).is_ok()
        });

        if !matches {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: WebhookEvent = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidArgument(format!("Malformed webhook payload: {}", e))
        })?;

        tracing::debug!(event_type = %event.type_, event_id = %event.id, "Verified webhook");

        Ok(event)
    }

    /// Handle a verified Stripe event
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<Outcome<WebhookAction>> {
        let object_id = event.data.object.id.as_str();

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            object_id = %object_id,
            "Handling Stripe webhook"
        );

        let outcome = match event.type_.as_str() {
            "invoice.finalized" => self
                .reconciliation
                .settle_invoice(object_id)
                .await?
                .map(|_| WebhookAction::SettledInvoice),
            "customer.subscription.created" => self
                .subscriptions
                .on_subscription_created(object_id)
                .await?
                .map(|_| WebhookAction::ActivatedSubscription),
            "customer.subscription.deleted" => self
                .subscriptions
                .cancel_subscription(object_id)
                .await?
                .map(|_| WebhookAction::CanceledSubscription),
            "charge.dispute.created" => self
                .disputes
                .on_charge_dispute(object_id)
                .await?
                .map(|_| WebhookAction::EnforcedDispute),
            other => {
                tracing::debug!(event_type = %other, "Ignoring unhandled webhook event");
                Outcome::new(WebhookAction::Ignored)
            }
        };

        Ok(outcome)
    }
}
