#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Meterline shared types
//!
//! Value types that cross crate boundaries (attribution identities, credit
//! amounts) and the Postgres pool helpers used by every binary.

pub mod attribution;
pub mod credits;
pub mod db;

pub use attribution::{AttributionId, EntityKind, ParseAttributionIdError};
pub use credits::CreditCents;
pub use db::{create_pool, run_migrations};
