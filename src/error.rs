// Error handling module for the booking API
// Centralized error type, failure categories and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

/// Failure category shown to clients.
///
/// The UI uses it to decide between explaining the problem and pointing the
/// customer at their booking history / support, since money may have moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or ineligible request; nothing was changed
    Validation,
    /// Resource already taken or already processed; existing state unchanged
    Conflict,
    /// Signature or amount mismatch on a gateway message
    Integrity,
    /// Gateway or datastore unreachable or too slow
    External,
    /// One half of a multi-step change was applied
    Inconsistency,
    Internal,
}

impl ErrorCategory {
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorCategory::External | ErrorCategory::Inconsistency)
    }

    pub fn manual_review(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Integrity | ErrorCategory::External | ErrorCategory::Inconsistency
        )
    }
}

/// Main error type for the API
/// All handlers return Result<T, ApiError>, module errors convert into it
#[derive(Debug)]
pub enum ApiError {
    /// Field-level request validation failures
    /// Maps to HTTP 400 Bad Request
    ValidationError(validator::ValidationErrors),

    /// Business-rule rejection of an otherwise well-formed request
    /// Maps to HTTP 400 Bad Request (or 422 when `unprocessable`)
    Rejected {
        message: String,
        reasons: Vec<String>,
        unprocessable: bool,
    },

    /// Resource not found by ID
    /// Maps to HTTP 404 Not Found
    NotFound { resource: String, id: String },

    /// Maps to HTTP 409 Conflict
    Conflict { message: String },

    /// Gateway message failed signature or amount verification
    /// Maps to HTTP 400 Bad Request
    Integrity { message: String },

    /// Downstream dependency failed or timed out
    /// Maps to HTTP 503 Service Unavailable
    External { message: String },

    /// Partially applied multi-step operation
    /// Maps to HTTP 500, with the step that needs re-running in `step`
    Inconsistency { message: String, step: String },

    /// Database operation errors
    /// Sensitive details are filtered from client responses
    DatabaseError(sqlx::Error),

    /// Maps to HTTP 500 Internal Server Error
    InternalError(String),

    /// Maps to HTTP 401 Unauthorized
    Unauthorized(String),

    /// Maps to HTTP 403 Forbidden
    Forbidden(String),
}

/// Consistent error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. "VALIDATION_ERROR", "CONFLICT")
    pub error_code: String,

    /// Human-readable error message
    pub message: String,

    /// Category plus retry/manual-review hints and any extra fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// RFC 3339 timestamp of when the error occurred
    pub timestamp: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = self.to_error_response();
        (status, Json(error_response)).into_response()
    }
}

fn details(category: ErrorCategory, extra: Option<serde_json::Value>) -> serde_json::Value {
    let mut details = json!({
        "category": category,
        "retryable": category.retryable(),
        "manual_review": category.manual_review(),
    });
    if let (Some(serde_json::Value::Object(extra)), Some(map)) = (extra, details.as_object_mut()) {
        map.extend(extra);
    }
    details
}

impl ApiError {
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        ApiError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        ApiError::Rejected {
            message: message.into(),
            reasons: Vec::new(),
            unprocessable: false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::ValidationError(_)
            | ApiError::Rejected { .. }
            | ApiError::NotFound { .. }
            | ApiError::Unauthorized(_)
            | ApiError::Forbidden(_) => ErrorCategory::Validation,
            ApiError::Conflict { .. } => ErrorCategory::Conflict,
            ApiError::Integrity { .. } => ErrorCategory::Integrity,
            ApiError::External { .. } => ErrorCategory::External,
            ApiError::Inconsistency { .. } => ErrorCategory::Inconsistency,
            ApiError::DatabaseError(e) if is_transient(e) => ErrorCategory::External,
            ApiError::DatabaseError(_) | ApiError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Convert ApiError to HTTP status code and ErrorResponse
    ///
    /// Logging follows severity: debug! for expected client errors, warn! for
    /// conflicts and auth failures, error! for anything needing an operator.
    fn to_error_response(&self) -> (StatusCode, ErrorResponse) {
        let category = self.category();
        let (code, message, extra) = match self {
            ApiError::ValidationError(errors) => {
                debug!("Validation error: {:?}", errors);
                (
                    "VALIDATION_ERROR",
                    "Request validation failed".to_string(),
                    Some(json!({ "fields": serde_json::to_value(errors).unwrap_or(json!({})) })),
                )
            }
            ApiError::Rejected { message, reasons, .. } => {
                debug!("Request rejected: {} {:?}", message, reasons);
                let extra = if reasons.is_empty() {
                    None
                } else {
                    Some(json!({ "reasons": reasons }))
                };
                ("REJECTED", message.clone(), extra)
            }
            ApiError::NotFound { resource, id } => {
                debug!("Resource not found: {} with id {}", resource, id);
                let message = if id.is_empty() {
                    format!("{} not found", resource)
                } else {
                    format!("{} with id {} not found", resource, id)
                };
                ("NOT_FOUND", message, None)
            }
            ApiError::Conflict { message } => {
                warn!("Conflict error: {}", message);
                ("CONFLICT", message.clone(), None)
            }
            ApiError::Integrity { message } => {
                error!(manual_review = true, "Integrity error: {}", message);
                ("INTEGRITY_ERROR", message.clone(), None)
            }
            ApiError::External { message } => {
                warn!("External dependency error: {}", message);
                (
                    "EXTERNAL_ERROR",
                    "A downstream service did not respond; please retry".to_string(),
                    Some(json!({ "cause": message })),
                )
            }
            ApiError::Inconsistency { message, step } => {
                error!(manual_review = true, step = %step, "Inconsistent state: {}", message);
                ("INCONSISTENT_STATE", message.clone(), Some(json!({ "step": step })))
            }
            ApiError::DatabaseError(db_error) => {
                error!("Database error: {:?}", db_error);
                ("DATABASE_ERROR", "A database error occurred".to_string(), None)
            }
            ApiError::InternalError(internal_msg) => {
                error!("Internal error: {}", internal_msg);
                ("INTERNAL_ERROR", "An internal server error occurred".to_string(), None)
            }
            ApiError::Unauthorized(message) => {
                warn!("Unauthorized access attempt: {}", message);
                ("UNAUTHORIZED", message.clone(), None)
            }
            ApiError::Forbidden(message) => {
                warn!("Forbidden access attempt: {}", message);
                ("FORBIDDEN", message.clone(), None)
            }
        };

        (
            self.status_code(),
            ErrorResponse {
                error_code: code.to_string(),
                message,
                details: Some(details(category, extra)),
                timestamp: Utc::now().to_rfc3339(),
            },
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected { unprocessable: true, .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Rejected { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Integrity { .. } => StatusCode::BAD_REQUEST,
            ApiError::External { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::DatabaseError(e) if is_transient(e) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Inconsistency { .. } | ApiError::DatabaseError(_) | ApiError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

/// Pool exhaustion and I/O failures clear up on their own
pub fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::DatabaseError(error)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_drive_hints() {
        let conflict = ApiError::Conflict {
            message: "Table 3 is already reserved".to_string(),
        };
        assert_eq!(conflict.category(), ErrorCategory::Conflict);
        assert!(!conflict.category().retryable());
        assert!(!conflict.category().manual_review());

        let external = ApiError::External {
            message: "refund gateway timed out".to_string(),
        };
        assert_eq!(external.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(external.category().retryable());
        assert!(external.category().manual_review());

        let integrity = ApiError::Integrity {
            message: "checksum mismatch".to_string(),
        };
        assert!(!integrity.category().retryable());
        assert!(integrity.category().manual_review());
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err = ApiError::DatabaseError(sqlx::Error::PoolTimedOut);
        assert_eq!(err.category(), ErrorCategory::External);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::DatabaseError(sqlx::Error::RowNotFound);
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_response_body_carries_details() {
        let err = ApiError::Inconsistency {
            message: "tables moved but old tables still held".to_string(),
            step: "release_tables".to_string(),
        };
        let (status, body) = err.to_error_response();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let details = body.details.unwrap();
        assert_eq!(details["category"], "inconsistency");
        assert_eq!(details["retryable"], true);
        assert_eq!(details["step"], "release_tables");
    }
}
