// Storage for tables, bills, payment sessions and refunds.
//
// Every operation that touches more than one record is a single call here, so
// that both backends can apply it atomically. State changes are conditional on
// the current state of the row (compare-and-set); callers never read-then-write.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bookings::{Bill, BillTransition, NewBill, PaymentMethod, PaymentStatus};
use crate::payments::{NewPayment, Payment, PaymentState};
use crate::refunds::{NewRefund, Refund};
use crate::tables::{Table, TableState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness or compare-and-set guard refused the write
    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data failed its own invariants on read
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Pool exhaustion or a dropped connection; worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(e) if crate::error::is_transient(e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Change applied to a bill when a payment completes
#[derive(Debug, Clone)]
pub enum BillEffect {
    None,
    /// Materialize the reservation; its tables are claimed in the same unit
    Create(NewBill),
    /// Supplementary payment on an existing bill
    MarkPaid {
        bill_id: Uuid,
        expected: PaymentStatus,
        new_status: PaymentStatus,
        method: PaymentMethod,
    },
}

/// Terminal outcome for a pending payment
#[derive(Debug, Clone)]
pub struct Settlement {
    pub order_id: String,
    pub status: PaymentState,
    pub response_code: String,
    pub transaction_status: String,
    pub transaction_no: Option<String>,
    /// Applied only when `status` is completed
    pub bill_effect: BillEffect,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SettleResult {
    Settled { payment: Payment, bill: Option<Bill> },
    /// Another delivery settled it first; nothing was changed
    AlreadySettled(Payment),
}

/// Switch a deposit-paid bill to paying the remainder at the counter
#[derive(Debug, Clone)]
pub struct CounterDeferral {
    pub bill_id: Uuid,
    pub user_id: i32,
    /// Row to insert when the bill has no completed deposit payment to upgrade
    pub fallback_order_id: String,
    pub remaining: rust_decimal::Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefundCompletion {
    pub refund_id: Uuid,
    pub transaction_no: String,
    /// Cancel transition applied together with the refund
    pub transition: BillTransition,
}

#[derive(Debug, Clone)]
pub struct RefundCompleted {
    pub refund: Refund,
    pub bill: Bill,
}

#[axum::async_trait]
pub trait BookingStore: Send + Sync {
    // Tables

    async fn list_tables(&self, floor: Option<i32>, state: Option<TableState>) -> StoreResult<Vec<Table>>;

    async fn find_tables(&self, ids: &[i32]) -> StoreResult<Vec<Table>>;

    /// Set a table's state if it is currently `expected`; `None` when the guard fails
    async fn set_table_state(&self, id: i32, expected: TableState, new: TableState) -> StoreResult<Option<Table>>;

    /// Claim empty tables for a bill: all or none. Conflict names the first taken table.
    async fn allocate_tables(&self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<()>;

    /// Set every table still held by the bill back to empty; returns how many changed
    async fn release_tables(&self, bill_id: Uuid) -> StoreResult<u64>;

    /// Release and unlink the given tables from a bill
    async fn detach_tables(&self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<u64>;

    // Bills

    /// Insert a bill, claim its tables, store its cart lines and clear the user's cart
    async fn create_bill(&self, bill: NewBill) -> StoreResult<Bill>;

    async fn find_bill(&self, id: Uuid) -> StoreResult<Option<Bill>>;

    async fn bill_table_ids(&self, bill_id: Uuid) -> StoreResult<Vec<i32>>;

    async fn list_user_bills(&self, user_id: i32) -> StoreResult<Vec<Bill>>;

    /// Bills still in order, oldest appointment first
    async fn list_active_bills(&self) -> StoreResult<Vec<Bill>>;

    /// Apply a planned transition with its table effect; `None` when the bill
    /// is no longer in the expected phase
    async fn apply_transition(&self, transition: &BillTransition) -> StoreResult<Option<Bill>>;

    // Payments

    /// Conflict on a duplicate order id or a second open session for the bill
    async fn insert_payment(&self, payment: NewPayment) -> StoreResult<Payment>;

    /// Remove a session that never reached the customer; only pending rows
    async fn delete_pending_payment(&self, order_id: &str) -> StoreResult<bool>;

    async fn find_payment(&self, order_id: &str) -> StoreResult<Option<Payment>>;

    /// Move a pending payment to its terminal status and apply the bill effect,
    /// all guarded on the payment still being pending
    async fn settle_payment(&self, settlement: Settlement) -> StoreResult<SettleResult>;

    async fn defer_remaining_to_counter(&self, deferral: CounterDeferral) -> StoreResult<Bill>;

    // Refunds

    async fn find_refund(&self, bill_id: Uuid) -> StoreResult<Option<Refund>>;

    /// Reserve the bill's single refund slot; Conflict if one exists
    async fn reserve_refund(&self, refund: NewRefund) -> StoreResult<Refund>;

    /// Drop a reservation whose gateway call failed
    async fn discard_refund(&self, refund_id: Uuid) -> StoreResult<()>;

    /// Mark the refund completed, record it on the bill and cancel the bill
    async fn complete_refund(&self, completion: RefundCompletion) -> StoreResult<RefundCompleted>;
}
