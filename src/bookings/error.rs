use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::error::ApiError;
use crate::payments::PaymentError;
use crate::refunds::RefundError;
use crate::store::StoreError;
use crate::tables::TableError;

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Well-formed but refused by a business rule
    #[error("{0}")]
    Rejected(String),

    /// Refused because of timing or payment state; the client may try later or differently
    #[error("{0}")]
    NotEligible(String),

    #[error("Bill {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    Conflict(String),

    /// First half of a two-step change applied, second half failed
    #[error("{message}")]
    Inconsistent { message: String, step: &'static str },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BookingError> for ApiError {
    fn from(error: BookingError) -> Self {
        match error {
            BookingError::Validation(errors) => ApiError::ValidationError(errors),
            BookingError::Rejected(message) => ApiError::rejected(message),
            BookingError::NotEligible(message) => ApiError::Rejected {
                message,
                reasons: Vec::new(),
                unprocessable: true,
            },
            BookingError::NotFound(id) => ApiError::not_found("Bill", id),
            BookingError::Conflict(message) => ApiError::Conflict { message },
            BookingError::Inconsistent { message, step } => ApiError::Inconsistency {
                message,
                step: step.to_string(),
            },
            BookingError::Table(e) => e.into(),
            BookingError::Payment(e) => e.into(),
            BookingError::Refund(e) => e.into(),
            BookingError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
