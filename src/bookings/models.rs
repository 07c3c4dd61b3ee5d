use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::payments::PaymentSession;
use crate::refunds::{Refund, RefundStatus};
use crate::validation::validate_phone;

/// Lifecycle state of a bill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillState {
    InOrder,
    Completed,
    Cancelled,
}

impl BillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillState::InOrder => "in_order",
            BillState::Completed => "completed",
            BillState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BillState::InOrder)
    }
}

impl std::fmt::Display for BillState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the party has shown up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    OnProcess,
    Visited,
    UnVisited,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::OnProcess => "on_process",
            VisitStatus::Visited => "visited",
            VisitStatus::UnVisited => "un_visited",
        }
    }
}

impl std::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much of the bill has been settled, and how
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    DepositPaid,
    FullyPaid,
    /// Whole bill settled in person at the venue
    CounterPayment,
    /// Deposit paid online, remainder due at the counter
    PendingCounter,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::DepositPaid => "deposit_paid",
            PaymentStatus::FullyPaid => "fully_paid",
            PaymentStatus::CounterPayment => "counter_payment",
            PaymentStatus::PendingCounter => "pending_counter",
        }
    }

    /// Fully paid or settled at the counter; such bills are never auto-cancelled
    pub fn is_settled_or_counter(&self) -> bool {
        matches!(
            self,
            PaymentStatus::FullyPaid | PaymentStatus::CounterPayment | PaymentStatus::PendingCounter
        )
    }

    /// Money has reached the merchant through the gateway
    pub fn has_online_payment(&self) -> bool {
        matches!(self, PaymentStatus::DepositPaid | PaymentStatus::FullyPaid)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Vnpay,
    Counter,
    Cash,
    Vip,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Vnpay => "vnpay",
            PaymentMethod::Counter => "counter",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Vip => "vip",
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, PaymentMethod::Vnpay)
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A table reservation and its payment/visit lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Bill {
    pub id: Uuid,
    pub user_id: i32,
    pub name: String,
    pub phone: String,
    /// Appointment instant
    pub time: DateTime<Utc>,
    pub num_people: i32,
    pub note: Option<String>,
    /// Food subtotal
    pub price: Decimal,
    pub total_amount: Decimal,
    pub deposit_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    /// External gateway reference of the latest settling payment
    pub payment_id: Option<String>,
    pub state: BillState,
    pub visit: VisitStatus,
    pub visited_at: Option<DateTime<Utc>>,
    pub refund_amount: Option<Decimal>,
    pub refund_status: Option<RefundStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    /// Amount still owed after the deposit
    pub fn remaining_amount(&self) -> Decimal {
        (self.total_amount - self.deposit_amount).max(Decimal::ZERO)
    }

    pub fn phase(&self) -> (BillState, VisitStatus) {
        (self.state, self.visit)
    }
}

/// A pre-ordered menu line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct CartLine {
    #[schema(example = 12)]
    pub product_id: i32,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    #[schema(example = 2)]
    pub quantity: i32,
    #[schema(example = 85000)]
    pub unit_price: Decimal,
}

impl CartLine {
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Typed snapshot of the reservation a payment session is paying for.
/// Stored with the payment and turned into a bill once the gateway confirms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BillSnapshot {
    pub name: String,
    pub phone: String,
    pub time: DateTime<Utc>,
    pub num_people: i32,
    pub note: Option<String>,
    pub table_ids: Vec<i32>,
    pub cart_details: Vec<CartLine>,
    pub price: Decimal,
    pub total_amount: Decimal,
    pub deposit_amount: Decimal,
}

impl BillSnapshot {
    /// Checks the structural invariants a snapshot must satisfy on write and on read
    pub fn validate_snapshot(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("snapshot name is empty".to_string());
        }
        if self.num_people <= 0 {
            return Err("snapshot num_people must be positive".to_string());
        }
        if self.table_ids.is_empty() {
            return Err("snapshot has no tables".to_string());
        }
        if self.price < Decimal::ZERO || self.total_amount < self.price {
            return Err("snapshot amounts are inconsistent".to_string());
        }
        let lines_total: Decimal = self.cart_details.iter().map(CartLine::subtotal).sum();
        if lines_total != self.price {
            return Err(format!(
                "snapshot price {} does not match cart lines total {}",
                self.price, lines_total
            ));
        }
        Ok(())
    }
}

/// Insert model for a bill, together with the tables and cart lines it owns
#[derive(Debug, Clone)]
pub struct NewBill {
    pub id: Uuid,
    pub user_id: i32,
    pub name: String,
    pub phone: String,
    pub time: DateTime<Utc>,
    pub num_people: i32,
    pub note: Option<String>,
    pub price: Decimal,
    pub total_amount: Decimal,
    pub deposit_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub payment_id: Option<String>,
    pub table_ids: Vec<i32>,
    pub cart_lines: Vec<CartLine>,
    pub created_at: DateTime<Utc>,
}

impl NewBill {
    pub fn from_snapshot(
        user_id: i32,
        snapshot: &BillSnapshot,
        payment_status: PaymentStatus,
        payment_method: PaymentMethod,
        payment_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: snapshot.name.clone(),
            phone: snapshot.phone.clone(),
            time: snapshot.time,
            num_people: snapshot.num_people,
            note: snapshot.note.clone(),
            price: snapshot.price,
            total_amount: snapshot.total_amount,
            deposit_amount: snapshot.deposit_amount,
            payment_status,
            payment_method,
            payment_id,
            table_ids: snapshot.table_ids.clone(),
            cart_lines: snapshot.cart_details.clone(),
            created_at,
        }
    }
}

/// How the customer wants to settle a new booking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOption {
    Deposit,
    Full,
    Counter,
}

/// Request DTO for a new booking
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct BookingRequest {
    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    #[schema(example = "Nguyen Van A")]
    pub name: String,
    #[validate(custom = "validate_phone")]
    #[schema(example = "0901234567")]
    pub phone: String,
    pub time: DateTime<Utc>,
    #[validate(range(min = 1, max = 200, message = "Number of people must be between 1 and 200"))]
    #[schema(example = 4)]
    pub num_people: i32,
    #[validate(length(max = 500))]
    pub note: Option<String>,
    #[validate(length(min = 1, message = "At least one table must be selected"))]
    pub table_ids: Vec<i32>,
    #[serde(default)]
    #[validate]
    pub cart_details: Vec<CartLine>,
    pub payment_option: PaymentOption,
}

/// Request DTO for the policy quote
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct QuoteRequest {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub subtotal: Decimal,
}

/// Settlement route for the remaining balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RemainingMethod {
    Vnpay,
    Counter,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RemainingPaymentRequest {
    pub method: RemainingMethod,
}

/// Request DTO for moving a booking onto other tables
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ChangeTablesRequest {
    #[validate(length(min = 1, message = "At least one table must be selected"))]
    pub table_ids: Vec<i32>,
}

/// Response DTO for a bill with its tables
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BillResponse {
    #[serde(flatten)]
    pub bill: Bill,
    pub table_ids: Vec<i32>,
}

/// Result of a booking or remaining-balance request
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BookingOutcome {
    /// Nothing (more) to pay online; the bill is in place
    Confirmed { bill: BillResponse },
    /// Redirect the customer to the gateway; the bill follows the callback
    PaymentRequired { session: PaymentSession },
}

/// Result of a customer cancellation
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CancelOutcome {
    pub bill: Bill,
    /// Present when an online payment was refunded
    pub refund: Option<Refund>,
}
