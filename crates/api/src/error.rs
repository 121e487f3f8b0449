//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meterline_billing::{BillingError, ErrorCode};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing Stripe-Signature header")]
    MissingSignature,

    #[error("Missing or invalid service token")]
    Unauthorized,
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(BillingError::WebhookSignatureInvalid)
            | ApiError::MissingSignature
            | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Billing(e) => match e.code() {
                ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
                ErrorCode::NotFound => StatusCode::NOT_FOUND,
                ErrorCode::AlreadyExists => StatusCode::CONFLICT,
                ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            },
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Billing(e) => e.code(),
            ApiError::Validation(_) | ApiError::MissingSignature => ErrorCode::InvalidArgument,
            ApiError::Unauthorized => ErrorCode::Unauthenticated,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        // Internal details stay in the logs
        let message = match &self {
            ApiError::Billing(BillingError::Config(_)) => "Internal error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            code: self.code().as_str(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
