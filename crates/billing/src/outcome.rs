//! Operation outcomes
//!
//! Ledger inserts and processor mutations are durable writes: if they fail,
//! the operation fails. Cache backfills, billing-cycle advancement and the
//! opportunistic usage push are advisory: their failures are logged and
//! reported here as warnings alongside the successful result.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// The customer cache could not be read; the processor was consulted instead
    CacheReadFailed,
    /// The customer cache could not be written; the next lookup backfills it
    CacheWriteFailed,
    /// No supported preferred currency on the customer; USD pricing applied
    DefaultCurrencyApplied,
    /// The processor cannot calculate tax automatically for this customer
    AutomaticTaxUnsupported,
    /// The cost center was not switched to processor billing
    CostCenterNotUpdated,
    /// The billing cycle was not advanced after a settlement
    BillingCycleNotAdvanced,
    /// The recomputed balance was not pushed; the periodic reconcile catches up
    UsageSyncDeferred,
    /// The invoice had already been applied to the ledger
    InvoiceAlreadySettled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A successful result plus any non-fatal degradations encountered on the way
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<Warning>) -> Self {
        Self { value, warnings }
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(Warning::new(kind, message));
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }

    /// Take the value of a nested outcome, keeping its warnings
    pub fn absorb<U>(&mut self, other: Outcome<U>) -> U {
        self.warnings.extend(other.warnings);
        other.value
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_keeps_warnings() {
        let mut outer = Outcome::new(());
        let mut inner = Outcome::new(7);
        inner.warn(WarningKind::CacheWriteFailed, "insert failed");

        let value = outer.absorb(inner);

        assert_eq!(value, 7);
        assert!(outer.has_warning(WarningKind::CacheWriteFailed));
        assert!(!outer.has_warning(WarningKind::UsageSyncDeferred));
    }

    #[test]
    fn test_map_preserves_warnings() {
        let outcome = Outcome::with_warnings(
            2,
            vec![Warning::new(WarningKind::DefaultCurrencyApplied, "usd")],
        )
        .map(|v| v * 10);

        assert_eq!(outcome.value, 20);
        assert_eq!(outcome.warnings.len(), 1);
    }
}
