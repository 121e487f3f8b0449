//! Application state

use std::sync::Arc;

use meterline_billing::BillingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Bearer token internal callers present on `/billing/v1`
    pub service_token: Arc<str>,
}

impl AppState {
    pub fn new(billing: BillingService, service_token: impl Into<Arc<str>>) -> Self {
        Self {
            billing: Arc::new(billing),
            service_token: service_token.into(),
        }
    }
}
