use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::bookings::Bill;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Reserved before calling the gateway
    Processing,
    Completed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Processing => "processing",
            RefundStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Refund of an online payment, one per bill
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Refund {
    pub id: Uuid,
    pub bill_id: Uuid,
    /// Amount the customer paid online
    pub original_amount: Decimal,
    pub refund_amount: Decimal,
    pub refund_reason: String,
    pub refund_transaction_no: Option<String>,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub id: Uuid,
    pub bill_id: Uuid,
    pub original_amount: Decimal,
    pub refund_amount: Decimal,
    pub refund_reason: String,
    pub created_at: DateTime<Utc>,
}

/// Result of the eligibility check
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RefundEligibility {
    pub can_refund: bool,
    /// Why the refund is refused; empty when eligible
    pub reasons: Vec<String>,
    pub max_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RefundRequest {
    #[schema(example = 300000)]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 500, message = "A refund reason is required"))]
    #[schema(example = "Change of plans")]
    pub reason: String,
}

/// A completed refund together with the bill it cancelled
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RefundResponse {
    pub refund: Refund,
    pub bill: Bill,
}
