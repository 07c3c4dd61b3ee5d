use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::bookings::{Bill, BillSnapshot, PaymentMethod};

/// What a payment session pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Deposit,
    Full,
    /// Remainder settled at the venue
    Counter,
}

/// Status of a payment session; `pending` is the only non-terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Completed,
    Failed,
    Cancelled,
    /// Owed at the venue; never settled by a gateway callback
    AtCounter,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
            PaymentState::Cancelled => "cancelled",
            PaymentState::AtCounter => "at_counter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentState::Pending)
    }

    /// Outcome of a gateway response: 00/00 completes, 24 is a user cancel,
    /// anything else fails
    pub fn from_gateway(response_code: &str, transaction_status: &str) -> Self {
        match (response_code, transaction_status) {
            ("00", "00") => PaymentState::Completed,
            ("24", _) => PaymentState::Cancelled,
            _ => PaymentState::Failed,
        }
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payment session against the gateway
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: String,
    pub user_id: i32,
    pub bill_id: Option<Uuid>,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub payment_method: PaymentMethod,
    pub status: PaymentState,
    pub vnp_response_code: Option<String>,
    pub vnp_transaction_status: Option<String>,
    pub vnp_transaction_no: Option<String>,
    /// Reservation to materialize once the payment completes
    pub bill_data: Option<BillSnapshot>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert model for a pending payment session
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub order_id: String,
    pub user_id: i32,
    pub bill_id: Option<Uuid>,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub payment_method: PaymentMethod,
    pub status: PaymentState,
    pub bill_data: Option<BillSnapshot>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Returned to the client before redirecting to the gateway
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentSession {
    pub order_id: String,
    pub redirect_url: String,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub expires_at: DateTime<Utc>,
}

/// Verified, parsed gateway callback
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCallback {
    pub order_id: String,
    /// Amount in minor units as sent by the gateway
    pub amount_minor: i64,
    pub response_code: String,
    pub transaction_status: String,
    pub transaction_no: Option<String>,
    pub bank_code: Option<String>,
    pub pay_date: Option<String>,
}

impl GatewayCallback {
    pub fn outcome(&self) -> PaymentState {
        PaymentState::from_gateway(&self.response_code, &self.transaction_status)
    }
}

/// Result of applying a callback
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReconciliationOutcome {
    pub order_id: String,
    pub status: PaymentState,
    /// The callback had already been applied by an earlier delivery
    pub already_processed: bool,
    pub bill: Option<Bill>,
    /// Payment completed but the bill could not be materialized
    pub manual_review: bool,
    pub message: String,
}

/// Reply body for the server-to-server notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IpnResponse {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl IpnResponse {
    fn new(code: &str, message: &str) -> Self {
        Self {
            rsp_code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn confirmed() -> Self {
        Self::new("00", "Confirm Success")
    }

    pub fn order_not_found() -> Self {
        Self::new("01", "Order not found")
    }

    pub fn already_confirmed() -> Self {
        Self::new("02", "Order already confirmed")
    }

    pub fn invalid_amount() -> Self {
        Self::new("04", "Invalid amount")
    }

    pub fn invalid_checksum() -> Self {
        Self::new("97", "Invalid Checksum")
    }

    pub fn unknown_error() -> Self {
        Self::new("99", "Unknown error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_outcome_mapping() {
        assert_eq!(PaymentState::from_gateway("00", "00"), PaymentState::Completed);
        assert_eq!(PaymentState::from_gateway("00", "02"), PaymentState::Failed);
        assert_eq!(PaymentState::from_gateway("24", "02"), PaymentState::Cancelled);
        assert_eq!(PaymentState::from_gateway("51", "02"), PaymentState::Failed);
        assert_eq!(PaymentState::from_gateway("", ""), PaymentState::Failed);
    }

    #[test]
    fn test_ipn_response_uses_gateway_field_names() {
        let body = serde_json::to_value(IpnResponse::invalid_amount()).unwrap();
        assert_eq!(body["RspCode"], "04");
        assert_eq!(body["Message"], "Invalid amount");
    }
}
