// In-process store with the same compare-and-set semantics as Postgres.
// One async mutex serializes every call, so each call is atomic.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BillEffect, BookingStore, CounterDeferral, RefundCompleted, RefundCompletion, SettleResult, Settlement,
    StoreError, StoreResult,
};
use crate::bookings::{
    Bill, BillEvent, BillState, BillTransition, CartLine, NewBill, PaymentMethod, PaymentStatus, TableEffect,
    VisitStatus,
};
use crate::payments::{NewPayment, Payment, PaymentState, PaymentType};
use crate::refunds::{NewRefund, Refund, RefundStatus};
use crate::tables::{Table, TableState};

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<i32, Table>,
    bills: HashMap<Uuid, Bill>,
    bill_tables: HashMap<Uuid, Vec<i32>>,
    cart_lines: HashMap<Uuid, Vec<CartLine>>,
    /// Per-user cart staging: (product_id, quantity)
    carts: HashMap<i32, Vec<(i32, i32)>>,
    payments: HashMap<String, Payment>,
    refunds: HashMap<Uuid, Refund>,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store seeded with the default floor plan: tables 1-6 on floor 1, 7-12 on floor 2
    pub fn new() -> Self {
        Self::with_tables((1..=12).map(|id| (id, if id <= 6 { 1 } else { 2 })))
    }

    /// Store seeded with `(table_id, floor)` pairs, all empty
    pub fn with_tables(layout: impl IntoIterator<Item = (i32, i32)>) -> Self {
        let now = Utc::now();
        let tables = layout
            .into_iter()
            .map(|(id, floor)| {
                (
                    id,
                    Table {
                        id,
                        floor,
                        state: TableState::Empty,
                        holder_bill_id: None,
                        updated_at: now,
                    },
                )
            })
            .collect();

        Self {
            inner: Mutex::new(Inner {
                tables,
                ..Inner::default()
            }),
        }
    }

    /// Stage a cart line for a user, as the menu collaborator would
    pub async fn add_cart_item(&self, user_id: i32, product_id: i32, quantity: i32) {
        let mut inner = self.inner.lock().await;
        inner.carts.entry(user_id).or_default().push((product_id, quantity));
    }

    pub async fn cart_len(&self, user_id: i32) -> usize {
        let inner = self.inner.lock().await;
        inner.carts.get(&user_id).map_or(0, Vec::len)
    }

    /// Overwrite a stored bill, for setting up time-dependent situations
    pub async fn put_bill(&self, bill: Bill) {
        let mut inner = self.inner.lock().await;
        inner.bills.insert(bill.id, bill);
    }
}

impl Inner {
    fn claim(&mut self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<()> {
        for id in table_ids {
            let table = self
                .tables
                .get(id)
                .ok_or_else(|| StoreError::NotFound(format!("Table {}", id)))?;
            if table.state != TableState::Empty {
                return Err(StoreError::Conflict(format!("Table {} is already {}", id, table.state)));
            }
        }

        let now = Utc::now();
        for id in table_ids {
            if let Some(table) = self.tables.get_mut(id) {
                table.state = TableState::Reserved;
                table.holder_bill_id = Some(bill_id);
                table.updated_at = now;
            }
        }
        let linked = self.bill_tables.entry(bill_id).or_default();
        for id in table_ids {
            if !linked.contains(id) {
                linked.push(*id);
            }
        }
        Ok(())
    }

    fn release(&mut self, bill_id: Uuid, only: Option<&[i32]>) -> u64 {
        let now = Utc::now();
        let mut changed = 0;
        for table in self.tables.values_mut() {
            let selected = only.map_or(true, |ids| ids.contains(&table.id));
            if selected && table.holder_bill_id == Some(bill_id) {
                table.state = TableState::Empty;
                table.holder_bill_id = None;
                table.updated_at = now;
                changed += 1;
            }
        }
        changed
    }

    fn occupy(&mut self, bill_id: Uuid) {
        let now = Utc::now();
        for table in self.tables.values_mut() {
            if table.holder_bill_id == Some(bill_id) && table.state == TableState::Reserved {
                table.state = TableState::Occupied;
                table.updated_at = now;
            }
        }
    }

    fn insert_bill(&mut self, new: NewBill) -> StoreResult<Bill> {
        self.claim(new.id, &new.table_ids)?;

        let bill = Bill {
            id: new.id,
            user_id: new.user_id,
            name: new.name,
            phone: new.phone,
            time: new.time,
            num_people: new.num_people,
            note: new.note,
            price: new.price,
            total_amount: new.total_amount,
            deposit_amount: new.deposit_amount,
            payment_status: new.payment_status,
            payment_method: new.payment_method,
            payment_id: new.payment_id,
            state: BillState::InOrder,
            visit: VisitStatus::OnProcess,
            visited_at: None,
            refund_amount: None,
            refund_status: None,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        self.cart_lines.insert(bill.id, new.cart_lines);
        self.carts.remove(&bill.user_id);
        self.bills.insert(bill.id, bill.clone());
        Ok(bill)
    }

    fn transition(&mut self, transition: &BillTransition) -> Option<Bill> {
        let bill = self.bills.get_mut(&transition.bill_id)?;
        if bill.phase() != transition.from {
            return None;
        }

        bill.state = transition.to.0;
        bill.visit = transition.to.1;
        bill.updated_at = transition.at;
        if transition.event == BillEvent::ConfirmArrival {
            bill.visited_at = Some(transition.at);
        }
        let updated = bill.clone();

        match transition.tables {
            TableEffect::Occupy => self.occupy(transition.bill_id),
            TableEffect::Release => {
                self.release(transition.bill_id, None);
            }
        }
        Some(updated)
    }
}

#[axum::async_trait]
impl BookingStore for MemoryStore {
    async fn list_tables(&self, floor: Option<i32>, state: Option<TableState>) -> StoreResult<Vec<Table>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tables
            .values()
            .filter(|t| floor.map_or(true, |f| t.floor == f))
            .filter(|t| state.map_or(true, |s| t.state == s))
            .cloned()
            .collect())
    }

    async fn find_tables(&self, ids: &[i32]) -> StoreResult<Vec<Table>> {
        let inner = self.inner.lock().await;
        Ok(ids.iter().filter_map(|id| inner.tables.get(id).cloned()).collect())
    }

    async fn set_table_state(&self, id: i32, expected: TableState, new: TableState) -> StoreResult<Option<Table>> {
        let mut inner = self.inner.lock().await;
        let table = inner
            .tables
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Table {}", id)))?;
        if table.state != expected {
            return Ok(None);
        }
        table.state = new;
        if new == TableState::Empty {
            table.holder_bill_id = None;
        }
        table.updated_at = Utc::now();
        Ok(Some(table.clone()))
    }

    async fn allocate_tables(&self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.claim(bill_id, table_ids)
    }

    async fn release_tables(&self, bill_id: Uuid) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        Ok(inner.release(bill_id, None))
    }

    async fn detach_tables(&self, bill_id: Uuid, table_ids: &[i32]) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let changed = inner.release(bill_id, Some(table_ids));
        if let Some(linked) = inner.bill_tables.get_mut(&bill_id) {
            linked.retain(|id| !table_ids.contains(id));
        }
        Ok(changed)
    }

    async fn create_bill(&self, bill: NewBill) -> StoreResult<Bill> {
        let mut inner = self.inner.lock().await;
        inner.insert_bill(bill)
    }

    async fn find_bill(&self, id: Uuid) -> StoreResult<Option<Bill>> {
        let inner = self.inner.lock().await;
        Ok(inner.bills.get(&id).cloned())
    }

    async fn bill_table_ids(&self, bill_id: Uuid) -> StoreResult<Vec<i32>> {
        let inner = self.inner.lock().await;
        let mut ids = inner.bill_tables.get(&bill_id).cloned().unwrap_or_default();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn list_user_bills(&self, user_id: i32) -> StoreResult<Vec<Bill>> {
        let inner = self.inner.lock().await;
        let mut bills: Vec<Bill> = inner.bills.values().filter(|b| b.user_id == user_id).cloned().collect();
        bills.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bills)
    }

    async fn list_active_bills(&self) -> StoreResult<Vec<Bill>> {
        let inner = self.inner.lock().await;
        let mut bills: Vec<Bill> = inner
            .bills
            .values()
            .filter(|b| b.state == BillState::InOrder)
            .cloned()
            .collect();
        bills.sort_by_key(|b| b.time);
        Ok(bills)
    }

    async fn apply_transition(&self, transition: &BillTransition) -> StoreResult<Option<Bill>> {
        let mut inner = self.inner.lock().await;
        if !inner.bills.contains_key(&transition.bill_id) {
            return Err(StoreError::NotFound(format!("Bill {}", transition.bill_id)));
        }
        Ok(inner.transition(transition))
    }

    async fn insert_payment(&self, new: NewPayment) -> StoreResult<Payment> {
        let mut inner = self.inner.lock().await;
        if inner.payments.contains_key(&new.order_id) {
            return Err(StoreError::Conflict(format!("Order id {} already exists", new.order_id)));
        }
        if let Some(bill_id) = new.bill_id {
            let open = inner
                .payments
                .values()
                .any(|p| p.bill_id == Some(bill_id) && p.status == PaymentState::Pending);
            if open {
                return Err(StoreError::Conflict(format!(
                    "Bill {} already has a payment in progress",
                    bill_id
                )));
            }
            let live_deposit = new.payment_type == PaymentType::Deposit
                && inner.payments.values().any(|p| {
                    p.bill_id == Some(bill_id)
                        && p.payment_type == PaymentType::Deposit
                        && matches!(p.status, PaymentState::Pending | PaymentState::Completed)
                });
            if live_deposit {
                return Err(StoreError::Conflict(format!("Bill {} already has a deposit", bill_id)));
            }
        }

        let payment = Payment {
            id: new.id,
            order_id: new.order_id,
            user_id: new.user_id,
            bill_id: new.bill_id,
            amount: new.amount,
            payment_type: new.payment_type,
            payment_method: new.payment_method,
            status: new.status,
            vnp_response_code: None,
            vnp_transaction_status: None,
            vnp_transaction_no: None,
            bill_data: new.bill_data,
            expires_at: new.expires_at,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        inner.payments.insert(payment.order_id.clone(), payment.clone());
        Ok(payment)
    }

    async fn delete_pending_payment(&self, order_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let pending = inner
            .payments
            .get(order_id)
            .map_or(false, |p| p.status == PaymentState::Pending);
        if pending {
            inner.payments.remove(order_id);
        }
        Ok(pending)
    }

    async fn find_payment(&self, order_id: &str) -> StoreResult<Option<Payment>> {
        let inner = self.inner.lock().await;
        Ok(inner.payments.get(order_id).cloned())
    }

    async fn settle_payment(&self, settlement: Settlement) -> StoreResult<SettleResult> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .payments
            .get(&settlement.order_id)
            .cloned()
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
                    let created = inner.insert_bill(new_bill)?;
                    bill_id = Some(created.id);
                    bill = Some(created);
                }
                BillEffect::MarkPaid {
                    bill_id: target,
                    expected,
                    new_status,
                    method,
                } => {
                    let existing = inner
                        .bills
                        .get_mut(&target)
                        .ok_or_else(|| StoreError::NotFound(format!("Bill {}", target)))?;
                    if existing.payment_status != expected || existing.state != BillState::InOrder {
                        return Err(StoreError::Conflict(format!(
                            "Bill {} is {} and no longer awaiting this payment",
                            target, existing.payment_status
                        )));
                    }
                    existing.payment_status = new_status;
                    existing.payment_method = method;
                    existing.payment_id = settlement.transaction_no.clone();
                    existing.updated_at = settlement.at;
                    bill = Some(existing.clone());
                }
            }
        }

        let payment = inner
            .payments
            .get_mut(&settlement.order_id)
            .ok_or_else(|| StoreError::NotFound(format!("Payment {}", settlement.order_id)))?;
        payment.status = settlement.status;
        payment.vnp_response_code = Some(settlement.response_code);
        payment.vnp_transaction_status = Some(settlement.transaction_status);
        payment.vnp_transaction_no = settlement.transaction_no;
        payment.bill_id = bill_id;
        payment.updated_at = settlement.at;

        Ok(SettleResult::Settled {
            payment: payment.clone(),
            bill,
        })
    }

    async fn defer_remaining_to_counter(&self, deferral: CounterDeferral) -> StoreResult<Bill> {
        let mut inner = self.inner.lock().await;
        let bill = inner
            .bills
            .get_mut(&deferral.bill_id)
            .ok_or_else(|| StoreError::NotFound(format!("Bill {}", deferral.bill_id)))?;
        if bill.payment_status != PaymentStatus::DepositPaid || bill.state != BillState::InOrder {
            return Err(StoreError::Conflict(format!(
                "Bill {} is {} and has no remaining balance to defer",
                deferral.bill_id, bill.payment_status
            )));
        }
        bill.payment_status = PaymentStatus::PendingCounter;
        bill.updated_at = deferral.at;
        let updated = bill.clone();
        let appointment = updated.time;

        let deposit = inner
            .payments
            .values()
            .find(|p| {
                p.bill_id == Some(deferral.bill_id)
                    && p.payment_type == PaymentType::Deposit
                    && p.status == PaymentState::Completed
            })
            .map(|p| p.order_id.clone());
        match deposit.and_then(|order_id| inner.payments.get_mut(&order_id)) {
            Some(payment) => {
                payment.payment_type = PaymentType::Full;
                payment.updated_at = deferral.at;
            }
            None if deferral.remaining > rust_decimal::Decimal::ZERO => {
                let payment = Payment {
                    id: Uuid::new_v4(),
                    order_id: deferral.fallback_order_id.clone(),
                    user_id: deferral.user_id,
                    bill_id: Some(deferral.bill_id),
                    amount: deferral.remaining,
                    payment_type: PaymentType::Counter,
                    payment_method: PaymentMethod::Counter,
                    status: PaymentState::AtCounter,
                    vnp_response_code: None,
                    vnp_transaction_status: None,
                    vnp_transaction_no: None,
                    bill_data: None,
                    expires_at: appointment,
                    created_at: deferral.at,
                    updated_at: deferral.at,
                };
                inner.payments.insert(payment.order_id.clone(), payment);
            }
            None => {}
        }
        Ok(updated)
    }

    async fn find_refund(&self, bill_id: Uuid) -> StoreResult<Option<Refund>> {
        let inner = self.inner.lock().await;
        Ok(inner.refunds.get(&bill_id).cloned())
    }

    async fn reserve_refund(&self, new: NewRefund) -> StoreResult<Refund> {
        let mut inner = self.inner.lock().await;
        if inner.refunds.contains_key(&new.bill_id) {
            return Err(StoreError::Conflict(format!(
                "Bill {} already has a refund",
                new.bill_id
            )));
        }
        let refund = Refund {
            id: new.id,
            bill_id: new.bill_id,
            original_amount: new.original_amount,
            refund_amount: new.refund_amount,
            refund_reason: new.refund_reason,
            refund_transaction_no: None,
            status: RefundStatus::Processing,
            created_at: new.created_at,
            completed_at: None,
        };
        inner.refunds.insert(refund.bill_id, refund.clone());
        Ok(refund)
    }

    async fn discard_refund(&self, refund_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .refunds
            .retain(|_, r| !(r.id == refund_id && r.status == RefundStatus::Processing));
        Ok(())
    }

    async fn complete_refund(&self, completion: RefundCompletion) -> StoreResult<RefundCompleted> {
        let mut inner = self.inner.lock().await;
        let bill_id = completion.transition.bill_id;
        let refund = inner
            .refunds
            .get(&bill_id)
            .filter(|r| r.id == completion.refund_id && r.status == RefundStatus::Processing)
            .cloned()
            .ok_or_else(|| StoreError::Conflict(format!("Refund {} is not awaiting completion", completion.refund_id)))?;

        let mut bill = inner
            .transition(&completion.transition)
            .ok_or_else(|| StoreError::Conflict(format!("Bill {} can no longer be cancelled", bill_id)))?;
        bill.refund_amount = Some(refund.refund_amount);
        bill.refund_status = Some(RefundStatus::Completed);
        inner.bills.insert(bill.id, bill.clone());

        let at = completion.transition.at;
        let refund = inner
            .refunds
            .get_mut(&bill_id)
            .ok_or_else(|| StoreError::NotFound(format!("Refund for bill {}", bill_id)))?;
        refund.status = RefundStatus::Completed;
        refund.refund_transaction_no = Some(completion.transaction_no);
        refund.completed_at = Some(at);

        Ok(RefundCompleted {
            refund: refund.clone(),
            bill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::StatusMachine;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn new_bill(user_id: i32, table_ids: Vec<i32>) -> NewBill {
        let now = Utc::now();
        NewBill {
            id: Uuid::new_v4(),
            user_id,
            name: "Le Van C".to_string(),
            phone: "0987654321".to_string(),
            time: now + chrono::Duration::hours(30),
            num_people: 4,
            note: None,
            price: dec!(0),
            total_amount: dec!(0),
            deposit_amount: dec!(100000),
            payment_status: PaymentStatus::CounterPayment,
            payment_method: PaymentMethod::Counter,
            payment_id: None,
            table_ids,
            cart_lines: vec![],
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_bill_claims_tables_and_clears_cart() {
        let store = MemoryStore::new();
        store.add_cart_item(5, 12, 2).await;

        let bill = store.create_bill(new_bill(5, vec![1, 2])).await.unwrap();

        let tables = store.find_tables(&[1, 2]).await.unwrap();
        assert!(tables
            .iter()
            .all(|t| t.state == TableState::Reserved && t.holder_bill_id == Some(bill.id)));
        assert_eq!(store.bill_table_ids(bill.id).await.unwrap(), vec![1, 2]);
        assert_eq!(store.cart_len(5).await, 0);
    }

    #[tokio::test]
    async fn test_allocation_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.create_bill(new_bill(1, vec![3])).await.unwrap();

        let err = store.create_bill(new_bill(2, vec![2, 3])).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(msg) if msg.contains("Table 3")));

        let table = &store.find_tables(&[2]).await.unwrap()[0];
        assert_eq!(table.state, TableState::Empty);
        assert_eq!(store.list_user_bills(2).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let (a, b) = tokio::join!(
            {
                let store = store.clone();
                async move { store.allocate_tables(first, &[7]).await }
            },
            {
                let store = store.clone();
                async move { store.allocate_tables(second, &[7]).await }
            }
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.err().or(b.err()), Some(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_release_only_touches_holder() {
        let store = MemoryStore::new();
        let bill = store.create_bill(new_bill(1, vec![4])).await.unwrap();
        let other = store.create_bill(new_bill(2, vec![5])).await.unwrap();

        assert_eq!(store.release_tables(bill.id).await.unwrap(), 1);
        // second release is a no-op
        assert_eq!(store.release_tables(bill.id).await.unwrap(), 0);

        let tables = store.find_tables(&[4, 5]).await.unwrap();
        assert_eq!(tables[0].state, TableState::Empty);
        assert_eq!(tables[1].holder_bill_id, Some(other.id));
    }

    #[tokio::test]
    async fn test_transition_guard_rejects_stale_phase() {
        let store = MemoryStore::new();
        let bill = store.create_bill(new_bill(1, vec![6])).await.unwrap();

        let cancel = StatusMachine::plan(&bill, BillEvent::Cancel, Utc::now()).unwrap();
        let arrive = StatusMachine::plan(&bill, BillEvent::ConfirmArrival, Utc::now()).unwrap();

        assert!(store.apply_transition(&cancel).await.unwrap().is_some());
        assert!(store.apply_transition(&arrive).await.unwrap().is_none());

        let table = &store.find_tables(&[6]).await.unwrap()[0];
        assert_eq!(table.state, TableState::Empty);
    }

    #[tokio::test]
    async fn test_set_table_state_is_conditional() {
        let store = MemoryStore::new();
        assert!(store
            .set_table_state(9, TableState::Reserved, TableState::InUse)
            .await
            .unwrap()
            .is_none());
        let table = store
            .set_table_state(9, TableState::Empty, TableState::InUse)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.state, TableState::InUse);
    }

    #[tokio::test]
    async fn test_counter_deferral_leaves_pending_slot_free() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let bill = store
            .create_bill(NewBill {
                total_amount: dec!(1000000),
                deposit_amount: dec!(300000),
                payment_status: PaymentStatus::DepositPaid,
                payment_method: PaymentMethod::Vnpay,
                ..new_bill(5, vec![3])
            })
            .await
            .unwrap();

        let deferred = store
            .defer_remaining_to_counter(CounterDeferral {
                bill_id: bill.id,
                user_id: 5,
                fallback_order_id: "CTR-1".to_string(),
                remaining: dec!(700000),
                at: now,
            })
            .await
            .unwrap();
        assert_eq!(deferred.payment_status, PaymentStatus::PendingCounter);

        let counter = store.find_payment("CTR-1").await.unwrap().unwrap();
        assert_eq!(counter.status, PaymentState::AtCounter);
        assert!(counter.status.is_terminal());

        // The bill can still open a gateway session afterwards
        store
            .insert_payment(NewPayment {
                id: Uuid::new_v4(),
                order_id: "ORD-AFTER".to_string(),
                user_id: 5,
                bill_id: Some(bill.id),
                amount: dec!(700000),
                payment_type: PaymentType::Full,
                payment_method: PaymentMethod::Vnpay,
                status: PaymentState::Pending,
                bill_data: None,
                expires_at: now + chrono::Duration::minutes(15),
                created_at: now,
            })
            .await
            .unwrap();
    }
}
