use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use super::{
    BillEffect, BookingStore, CounterDeferral, RefundCompleted, RefundCompletion, SettleResult, Settlement,
    StoreError, StoreResult,
};
use crate::bookings::{
    Bill, BillEvent, BillSnapshot, BillTransition, NewBill, PaymentMethod, TableEffect,
};
use crate::payments::{NewPayment, Payment, PaymentState, PaymentType};
use crate::refunds::{NewRefund, Refund, RefundStatus};
use crate::tables::{Table, TableState};

const BILL_COLUMNS: &str = "id, user_id, name, phone, time, num_people, note, price, total_amount, \
     deposit_amount, payment_status, payment_method, payment_id, state, visit, visited_at, \
     refund_amount, refund_status, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, bill_id, amount, payment_type, payment_method, \
     status, vnp_response_code, vnp_transaction_status, vnp_transaction_no, bill_data, expires_at, \
     created_at, updated_at";

const REFUND_COLUMNS: &str = "id, bill_id, original_amount, refund_amount, refund_reason, \
     refund_transaction_no, status, created_at, completed_at";

/// Payment as stored; the snapshot is JSONB
#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: String,
    user_id: i32,
    bill_id: Option<Uuid>,
    amount: Decimal,
    payment_type: PaymentType,
    payment_method: PaymentMethod,
    status: PaymentState,
    vnp_response_code: Option<String>,
    vnp_transaction_status: Option<String>,
    vnp_transaction_no: Option<String>,
    bill_data: Option<Json<BillSnapshot>>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let bill_data = row.bill_data.map(|Json(snapshot)| snapshot);
        if let Some(snapshot) = &bill_data {
            snapshot
                .validate_snapshot()
                .map_err(|e| StoreError::Corrupt(format!("payment {}: {}", row.order_id, e)))?;
        }

        Ok(Payment {
            id: row.id,
            order_id: row.order_id,
            user_id: row.user_id,
            bill_id: row.bill_id,
            amount: row.amount,
            payment_type: row.payment_type,
            payment_method: row.payment_method,
            status: row.status,
            vnp_response_code: row.vnp_response_code,
            vnp_transaction_status: row.vnp_transaction_status,
            vnp_transaction_no: row.vnp_transaction_no,
            bill_data,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn conflict_on_unique(error: sqlx::Error, message: impl FnOnce() -> String) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(message()),
        _ => StoreError::Database(error),
    }
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim empty tables inside the caller's transaction
    async fn claim(conn: &mut PgConnection, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<()> {
        let claimed: Vec<(i32,)> = sqlx::query_as(
            r#"
            UPDATE dining_tables
            SET state = 'reserved', holder_bill_id = $1, updated_at = NOW()
            WHERE id = ANY($2) AND state = 'empty'
            RETURNING id
            "#,
        )
        .bind(bill_id)
        .bind(table_ids)
        .fetch_all(&mut *conn)
        .await?;

        if claimed.len() != table_ids.len() {
            let current: Vec<(i32, TableState)> =
                sqlx::query_as("SELECT id, state FROM dining_tables WHERE id = ANY($1)")
                    .bind(table_ids)
                    .fetch_all(&mut *conn)
                    .await?;
            for id in table_ids {
                match current.iter().find(|(tid, _)| tid == id) {
                    None => return Err(StoreError::NotFound(format!("Table {}", id))),
                    Some((_, state)) if claimed.iter().all(|(c,)| c != id) => {
                        return Err(StoreError::Conflict(format!("Table {} is already {}", id, state)));
                    }
                    Some(_) => {}
                }
            }
            return Err(StoreError::Conflict("Requested tables are no longer free".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO bill_tables (bill_id, table_id)
            SELECT $1, UNNEST($2::int[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(bill_id)
        .bind(table_ids)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn insert_bill(conn: &mut PgConnection, new: NewBill) -> StoreResult<Bill> {
        let bill = sqlx::query_as::<_, Bill>(&format!(
            r#"
            INSERT INTO bills (id, user_id, name, phone, time, num_people, note, price, total_amount,
                               deposit_amount, payment_status, payment_method, payment_id,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING {}
            "#,
            BILL_COLUMNS
        ))
        .bind(new.id)
        .bind(new.user_id)
        .bind(&new.name)
        .bind(&new.phone)
        .bind(new.time)
        .bind(new.num_people)
        .bind(&new.note)
        .bind(new.price)
        .bind(new.total_amount)
        .bind(new.deposit_amount)
        .bind(new.payment_status)
        .bind(new.payment_method)
        .bind(&new.payment_id)
        .bind(new.created_at)
        .fetch_one(&mut *conn)
        .await?;

        Self::claim(conn, bill.id, &new.table_ids).await?;

        for line in &new.cart_lines {
            sqlx::query(
                "INSERT INTO bill_cart_lines (bill_id, product_id, quantity, unit_price) VALUES ($1, $2, $3, $4)",
            )
            .bind(bill.id)
            .bind(line.product_id)
            .bind(line.quantity)
            .bind(line.unit_price)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
            .bind(bill.user_id)
            .execute(&mut *conn)
            .await?;

        Ok(bill)
    }

    /// Guarded bill update plus its table effect, inside the caller's transaction
    async fn transition(conn: &mut PgConnection, transition: &BillTransition) -> StoreResult<Option<Bill>> {
        let bill = sqlx::query_as::<_, Bill>(&format!(
            r#"
            UPDATE bills
            SET state = $2, visit = $3, updated_at = $4,
                visited_at = CASE WHEN $5 THEN $4 ELSE visited_at END
            WHERE id = $1 AND state = $6 AND visit = $7
            RETURNING {}
            "#,
            BILL_COLUMNS
        ))
        .bind(transition.bill_id)
        .bind(transition.to.0)
        .bind(transition.to.1)
        .bind(transition.at)
        .bind(transition.event == BillEvent::ConfirmArrival)
        .bind(transition.from.0)
        .bind(transition.from.1)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(bill) = bill else {
            return Ok(None);
        };

        let table_sql = match transition.tables {
            TableEffect::Occupy => {
                "UPDATE dining_tables SET state = 'occupied', updated_at = NOW() \
                 WHERE holder_bill_id = $1 AND state = 'reserved'"
            }
            TableEffect::Release => {
                "UPDATE dining_tables SET state = 'empty', holder_bill_id = NULL, updated_at = NOW() \
                 WHERE holder_bill_id = $1"
            }
        };
        sqlx::query(table_sql)
            .bind(transition.bill_id)
            .execute(&mut *conn)
            .await?;

        Ok(Some(bill))
    }

    async fn fetch_payment(conn: &mut PgConnection, order_id: &str, lock: bool) -> StoreResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE order_id = $1{}",
            PAYMENT_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(Payment::try_from).transpose()
    }
}

#[axum::async_trait]
impl BookingStore for PgStore {
    async fn list_tables(&self, floor: Option<i32>, state: Option<TableState>) -> StoreResult<Vec<Table>> {
        let tables = sqlx::query_as::<_, Table>(
            r#"
            SELECT id, floor, state, holder_bill_id, updated_at
            FROM dining_tables
            WHERE ($1::int IS NULL OR floor = $1)
              AND ($2::text IS NULL OR state = $2)
            ORDER BY id
            "#,
        )
        .bind(floor)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;

        Ok(tables)
    }

    async fn find_tables(&self, ids: &[i32]) -> StoreResult<Vec<Table>> {
        let tables = sqlx::query_as::<_, Table>(
            "SELECT id, floor, state, holder_bill_id, updated_at FROM dining_tables WHERE id = ANY($1) ORDER BY id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(tables)
    }

    async fn set_table_state(&self, id: i32, expected: TableState, new: TableState) -> StoreResult<Option<Table>> {
        let table = sqlx::query_as::<_, Table>(
            r#"
            UPDATE dining_tables
            SET state = $3,
                holder_bill_id = CASE WHEN $3 = 'empty' THEN NULL ELSE holder_bill_id END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING id, floor, state, holder_bill_id, updated_at
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(new)
        .fetch_optional(&self.pool)
        .await?;

        if table.is_none() {
            let exists: Option<(i32,)> = sqlx::query_as("SELECT id FROM dining_tables WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("Table {}", id)));
            }
        }

        Ok(table)
    }

    async fn allocate_tables(&self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::claim(&mut tx, bill_id, table_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release_tables(&self, bill_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dining_tables
            SET state = 'empty', holder_bill_id = NULL, updated_at = NOW()
            WHERE holder_bill_id = $1
            "#,
        )
        .bind(bill_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn detach_tables(&self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE dining_tables
            SET state = 'empty', holder_bill_id = NULL, updated_at = NOW()
            WHERE holder_bill_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(bill_id)
        .bind(table_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM bill_tables WHERE bill_id = $1 AND table_id = ANY($2)")
            .bind(bill_id)
            .bind(table_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn create_bill(&self, bill: NewBill) -> StoreResult<Bill> {
        let mut tx = self.pool.begin().await?;
        let bill = Self::insert_bill(&mut tx, bill).await?;
        tx.commit().await?;
        Ok(bill)
    }

    async fn find_bill(&self, id: Uuid) -> StoreResult<Option<Bill>> {
        let bill = sqlx::query_as::<_, Bill>(&format!("SELECT {} FROM bills WHERE id = $1", BILL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(bill)
    }

    async fn bill_table_ids(&self, bill_id: Uuid) -> StoreResult<Vec<i32>> {
        let rows: Vec<(i32,)> =
            sqlx::query_as("SELECT table_id FROM bill_tables WHERE bill_id = $1 ORDER BY table_id")
                .bind(bill_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_user_bills(&self, user_id: i32) -> StoreResult<Vec<Bill>> {
        let bills = sqlx::query_as::<_, Bill>(&format!(
            "SELECT {} FROM bills WHERE user_id = $1 ORDER BY created_at DESC",
            BILL_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(bills)
    }

    async fn list_active_bills(&self) -> StoreResult<Vec<Bill>> {
        let bills = sqlx::query_as::<_, Bill>(&format!(
            "SELECT {} FROM bills WHERE state = 'in_order' ORDER BY time",
            BILL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(bills)
    }

    async fn apply_transition(&self, transition: &BillTransition) -> StoreResult<Option<Bill>> {
        let mut tx = self.pool.begin().await?;
        let bill = Self::transition(&mut tx, transition).await?;

        if bill.is_none() {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM bills WHERE id = $1")
                .bind(transition.bill_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("Bill {}", transition.bill_id)));
            }
        }

        tx.commit().await?;
        Ok(bill)
    }

    async fn insert_payment(&self, new: NewPayment) -> StoreResult<Payment> {
        let order_id = new.order_id.clone();
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payments (id, order_id, user_id, bill_id, amount, payment_type, payment_method,
                                  status, bill_data, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(new.id)
        .bind(&new.order_id)
        .bind(new.user_id)
        .bind(new.bill_id)
        .bind(new.amount)
        .bind(new.payment_type)
        .bind(new.payment_method)
        .bind(new.status)
        .bind(new.bill_data.map(Json))
        .bind(new.expires_at)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("Order id {} or an open payment for this bill already exists", order_id)
            })
        })?;

        Payment::try_from(row)
    }

    async fn delete_pending_payment(&self, order_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM payments WHERE order_id = $1 AND status = 'pending'")
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_payment(&self, order_id: &str) -> StoreResult<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_payment(&mut conn, order_id, false).await
    }

    async fn settle_payment(&self, settlement: Settlement) -> StoreResult<SettleResult> {
        let mut tx = self.pool.begin().await?;

        let current = Self::fetch_payment(&mut tx, &settlement.order_id, true)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Payment {}", settlement.order_id)))?;
        if current.status.is_terminal() {
            return Ok(SettleResult::AlreadySettled(current));
        }

        let mut bill_id = current.bill_id;
        let mut bill = None;
        if settlement.status == PaymentState::Completed {
            match settlement.bill_effect {
                BillEffect::None => {}
                BillEffect::Create(new_bill) => {
                    let created = Self::insert_bill(&mut tx, new_bill).await?;
                    bill_id = Some(created.id);
                    bill = Some(created);
                }
                BillEffect::MarkPaid {
                    bill_id: target,
                    expected,
                    new_status,
                    method,
                } => {
                    let updated = sqlx::query_as::<_, Bill>(&format!(
                        r#"
                        UPDATE bills
                        SET payment_status = $2, payment_method = $3, payment_id = $4, updated_at = $5
                        WHERE id = $1 AND payment_status = $6 AND state = 'in_order'
                        RETURNING {}
                        "#,
                        BILL_COLUMNS
                    ))
                    .bind(target)
                    .bind(new_status)
                    .bind(method)
                    .bind(&settlement.transaction_no)
                    .bind(settlement.at)
                    .bind(expected)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Conflict(format!("Bill {} is no longer awaiting this payment", target))
                    })?;
                    bill = Some(updated);
                }
            }
        }

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payments
            SET status = $2, vnp_response_code = $3, vnp_transaction_status = $4,
                vnp_transaction_no = $5, bill_id = $6, updated_at = $7
            WHERE order_id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(&settlement.order_id)
        .bind(settlement.status)
        .bind(&settlement.response_code)
        .bind(&settlement.transaction_status)
        .bind(&settlement.transaction_no)
        .bind(bill_id)
        .bind(settlement.at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SettleResult::Settled {
            payment: Payment::try_from(row)?,
            bill,
        })
    }

    async fn defer_remaining_to_counter(&self, deferral: CounterDeferral) -> StoreResult<Bill> {
        let mut tx = self.pool.begin().await?;

        let bill = sqlx::query_as::<_, Bill>(&format!(
            r#"
            UPDATE bills
            SET payment_status = 'pending_counter', updated_at = $2
            WHERE id = $1 AND payment_status = 'deposit_paid' AND state = 'in_order'
            RETURNING {}
            "#,
            BILL_COLUMNS
        ))
        .bind(deferral.bill_id)
        .bind(deferral.at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            StoreError::Conflict(format!(
                "Bill {} has no remaining balance to defer",
                deferral.bill_id
            ))
        })?;

        let upgraded = sqlx::query(
            r#"
            UPDATE payments
            SET payment_type = 'full', updated_at = $2
            WHERE bill_id = $1 AND payment_type = 'deposit' AND status = 'completed'
            "#,
        )
        .bind(deferral.bill_id)
        .bind(deferral.at)
        .execute(&mut *tx)
        .await?;

        if upgraded.rows_affected() == 0 && deferral.remaining > Decimal::ZERO {
            sqlx::query(
                r#"
                INSERT INTO payments (id, order_id, user_id, bill_id, amount, payment_type, payment_method,
                                      status, expires_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, 'counter', 'counter', 'at_counter', $6, $7, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&deferral.fallback_order_id)
            .bind(deferral.user_id)
            .bind(deferral.bill_id)
            .bind(deferral.remaining)
            .bind(bill.time)
            .bind(deferral.at)
            .execute(&mut *tx)
            .await
            .map_err(|e| conflict_on_unique(e, || format!("Bill {} already has an open payment", deferral.bill_id)))?;
        }

        tx.commit().await?;
        Ok(bill)
    }

    async fn find_refund(&self, bill_id: Uuid) -> StoreResult<Option<Refund>> {
        let refund = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {} FROM refunds WHERE bill_id = $1",
            REFUND_COLUMNS
        ))
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(refund)
    }

    async fn reserve_refund(&self, new: NewRefund) -> StoreResult<Refund> {
        let bill_id = new.bill_id;
        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            INSERT INTO refunds (id, bill_id, original_amount, refund_amount, refund_reason, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', $6)
            RETURNING {}
            "#,
            REFUND_COLUMNS
        ))
        .bind(new.id)
        .bind(new.bill_id)
        .bind(new.original_amount)
        .bind(new.refund_amount)
        .bind(&new.refund_reason)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("Bill {} already has a refund", bill_id)))?;

        Ok(refund)
    }

    async fn discard_refund(&self, refund_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM refunds WHERE id = $1 AND status = 'processing'")
            .bind(refund_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn complete_refund(&self, completion: RefundCompletion) -> StoreResult<RefundCompleted> {
        let mut tx = self.pool.begin().await?;
        let at = completion.transition.at;

        let refund = sqlx::query_as::<_, Refund>(&format!(
            r#"
            UPDATE refunds
            SET status = 'completed', refund_transaction_no = $2, completed_at = $3
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            REFUND_COLUMNS
        ))
        .bind(completion.refund_id)
        .bind(&completion.transaction_no)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            StoreError::Conflict(format!("Refund {} is not awaiting completion", completion.refund_id))
        })?;

        Self::transition(&mut tx, &completion.transition)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "Bill {} can no longer be cancelled",
                    completion.transition.bill_id
                ))
            })?;

        let bill = sqlx::query_as::<_, Bill>(&format!(
            r#"
            UPDATE bills
            SET refund_amount = $2, refund_status = $3
            WHERE id = $1
            RETURNING {}
            "#,
            BILL_COLUMNS
        ))
        .bind(refund.bill_id)
        .bind(refund.refund_amount)
        .bind(RefundStatus::Completed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RefundCompleted { refund, bill })
    }
}
