//! Billing error types

use thiserror::Error;

/// Status codes surfaced to callers of the billing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Internal,
    Unauthenticated,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::Internal => "internal",
            ErrorCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,
}

impl BillingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BillingError::InvalidArgument(_) | BillingError::WebhookSignatureInvalid => {
                ErrorCode::InvalidArgument
            }
            BillingError::NotFound(_) => ErrorCode::NotFound,
            BillingError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            BillingError::Internal(_) | BillingError::Config(_) => ErrorCode::Internal,
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
