//! Scheduled billing jobs

use std::sync::Arc;

use meterline_billing::{BillingService, ReconcileSummary};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Default cron expression for the reconcile job (every 15 minutes)
pub const DEFAULT_RECONCILE_SCHEDULE: &str = "0 */15 * * * *";

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileRun {
    Completed(ReconcileSummary),
    /// The previous tick was still running
    Skipped,
    Failed(String),
}

/// Push ledger balances to Stripe. Overlapping ticks are skipped so runs
/// stay sequential.
#[derive(Clone)]
pub struct ReconcileJob {
    billing: Arc<BillingService>,
    running: Arc<Mutex<()>>,
}

impl ReconcileJob {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self {
            billing,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub async fn run(&self) -> ReconcileRun {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous reconcile still running, skipping this tick");
            return ReconcileRun::Skipped;
        };

        info!("Running scheduled usage reconciliation");
        match self.billing.reconciliation.reconcile_all().await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(kind = ?warning.kind, message = %warning.message, "Reconcile degraded");
                }
                info!(
                    balances = outcome.value.balances,
                    pushed = outcome.value.pushed.len(),
                    "Usage reconciliation complete"
                );
                ReconcileRun::Completed(outcome.value)
            }
            Err(e) => {
                error!(error = %e, "Usage reconciliation failed");
                ReconcileRun::Failed(e.to_string())
            }
        }
    }
}
