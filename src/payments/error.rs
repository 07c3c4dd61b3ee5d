use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;

use crate::error::ApiError;
use crate::payments::gateway::GatewayError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("{0}")]
    Validation(String),

    #[error("Payment {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Signature check failed; the outcome must not be applied
    #[error("Gateway signature verification failed: {0}")]
    Integrity(String),

    #[error("Amount invalid: expected {expected} minor units, callback carried {received}")]
    AmountMismatch { expected: i64, received: i64 },

    #[error("Could not build the payment request: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(message) => ApiError::Conflict { message },
            StoreError::NotFound(what) => ApiError::NotFound {
                resource: what,
                id: String::new(),
            },
            StoreError::Database(e) => ApiError::DatabaseError(e),
            StoreError::Corrupt(message) => ApiError::Integrity { message },
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(error: PaymentError) -> Self {
        match error {
            PaymentError::InvalidAmount(_) | PaymentError::Validation(_) => ApiError::rejected(error.to_string()),
            PaymentError::NotFound(order_id) => ApiError::not_found("Payment", order_id),
            PaymentError::Conflict(message) => ApiError::Conflict { message },
            PaymentError::Integrity(_) | PaymentError::AmountMismatch { .. } => ApiError::Integrity {
                message: error.to_string(),
            },
            PaymentError::Gateway(GatewayError::Amount(_)) => ApiError::rejected(error.to_string()),
            PaymentError::Gateway(e) => ApiError::InternalError(e.to_string()),
            PaymentError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
