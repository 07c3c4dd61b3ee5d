// Bill Lifecycle Controller
//
// Entry point for every customer-driven change to a reservation. Each change
// is planned against the status machine and applied by the store as one unit
// together with its table effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info};
use uuid::Uuid;
use validator::Validate;

use crate::bookings::{
    Bill, BillEvent, BillResponse, BillSnapshot, BillState, BookingError, BookingOutcome, BookingRequest,
    CancelOutcome, CartLine, NewBill, PaymentMethod, PaymentOption, PaymentStatus, RemainingMethod,
    StatusMachine, VisitStatus,
};
use crate::payments::session::generate_order_id;
use crate::payments::{PaymentSessionManager, PaymentType, SessionRequest};
use crate::policy::{CustomerTier, PaymentQuote, PolicyEngine};
use crate::refunds::RefundEngine;
use crate::store::{BookingStore, CounterDeferral};
use crate::sweep::{apply_due_transition, DueTransition};
use crate::tables::TableInventory;

/// Who is asking, as established by the auth layer
#[derive(Debug, Clone)]
pub struct Customer {
    pub user_id: i32,
    pub tier: CustomerTier,
    pub client_ip: String,
}

pub struct BookingService {
    store: Arc<dyn BookingStore>,
    policy: PolicyEngine,
    tables: Arc<TableInventory>,
    sessions: Arc<PaymentSessionManager>,
    refunds: Arc<RefundEngine>,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        policy: PolicyEngine,
        tables: Arc<TableInventory>,
        sessions: Arc<PaymentSessionManager>,
        refunds: Arc<RefundEngine>,
    ) -> Self {
        Self {
            store,
            policy,
            tables,
            sessions,
            refunds,
        }
    }

    pub fn quote(&self, tier: CustomerTier, time: DateTime<Utc>, subtotal: Decimal, now: DateTime<Utc>) -> PaymentQuote {
        self.policy.quote(time, now, subtotal, tier)
    }

    /// Create a reservation, directly or through a payment session
    pub async fn book(
        &self,
        customer: &Customer,
        request: BookingRequest,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, BookingError> {
        request.validate()?;
        if request.time <= now {
            return Err(BookingError::Rejected("Appointment must be in the future".to_string()));
        }
        if request.cart_details.iter().any(|line| line.unit_price < Decimal::ZERO) {
            return Err(BookingError::Rejected("Menu prices cannot be negative".to_string()));
        }

        self.tables
            .validate_selection(request.num_people, &request.table_ids, None)
            .await?;

        let subtotal: Decimal = request.cart_details.iter().map(CartLine::subtotal).sum();
        let quote = self.policy.quote(request.time, now, subtotal, customer.tier);

        match (customer.tier, request.payment_option) {
            (CustomerTier::Vip, _) => self.book_direct(customer, request, subtotal, PaymentMethod::Vip, now).await,
            (CustomerTier::Regular, PaymentOption::Counter) => {
                if quote.payment_required {
                    return Err(BookingError::NotEligible(format!(
                        "Bookings less than {} hours ahead must be paid online",
                        self.policy.config().payment_window_hours
                    )));
                }
                self.book_direct(customer, request, subtotal, PaymentMethod::Counter, now)
                    .await
            }
            (CustomerTier::Regular, PaymentOption::Deposit) => {
                self.book_with_payment(customer, request, subtotal, quote.deposit_amount, PaymentType::Deposit, now)
                    .await
            }
            (CustomerTier::Regular, PaymentOption::Full) => {
                if !quote.full_payment_available {
                    return Err(BookingError::Rejected(
                        "Full payment is only available with pre-ordered food".to_string(),
                    ));
                }
                self.book_with_payment(customer, request, subtotal, quote.full_amount, PaymentType::Full, now)
                    .await
            }
        }
    }

    async fn book_direct(
        &self,
        customer: &Customer,
        request: BookingRequest,
        subtotal: Decimal,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, BookingError> {
        let bill = self
            .store
            .create_bill(NewBill {
                id: Uuid::new_v4(),
                user_id: customer.user_id,
                name: request.name,
                phone: request.phone,
                time: request.time,
                num_people: request.num_people,
                note: request.note,
                price: subtotal,
                total_amount: subtotal,
                deposit_amount: Decimal::ZERO,
                payment_status: PaymentStatus::CounterPayment,
                payment_method: method,
                payment_id: None,
                table_ids: request.table_ids.clone(),
                cart_lines: request.cart_details,
                created_at: now,
            })
            .await?;

        info!(
            "Bill {} booked for user {} ({}), tables {:?}",
            bill.id, customer.user_id, method, request.table_ids
        );
        Ok(BookingOutcome::Confirmed {
            bill: BillResponse {
                bill,
                table_ids: request.table_ids,
            },
        })
    }

    async fn book_with_payment(
        &self,
        customer: &Customer,
        request: BookingRequest,
        subtotal: Decimal,
        amount: Decimal,
        payment_type: PaymentType,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, BookingError> {
        let order_info = format!(
            "Table booking for {} on {}",
            request.num_people,
            request.time.format("%Y-%m-%d %H:%M")
        );
        let snapshot = BillSnapshot {
            name: request.name,
            phone: request.phone,
            time: request.time,
            num_people: request.num_people,
            note: request.note,
            table_ids: request.table_ids,
            cart_details: request.cart_details,
            price: subtotal,
            total_amount: subtotal,
            deposit_amount: amount,
        };

        let session = self
            .sessions
            .create_session(
                SessionRequest {
                    user_id: customer.user_id,
                    bill_id: None,
                    snapshot: Some(snapshot),
                    amount,
                    payment_type,
                    order_info,
                    client_ip: customer.client_ip.clone(),
                },
                now,
            )
            .await?;
        Ok(BookingOutcome::PaymentRequired { session })
    }

    async fn load(&self, user_id: i32, bill_id: Uuid) -> Result<Bill, BookingError> {
        match self.store.find_bill(bill_id).await? {
            Some(bill) if bill.user_id == user_id => Ok(bill),
            _ => Err(BookingError::NotFound(bill_id)),
        }
    }

    async fn respond(&self, bill: Bill) -> Result<BillResponse, BookingError> {
        let table_ids = self.store.bill_table_ids(bill.id).await?;
        Ok(BillResponse { bill, table_ids })
    }

    /// Bring a freshly read bill up to date with the auto-cancel and
    /// auto-complete rules before it is shown
    async fn refresh(&self, bill: Bill, now: DateTime<Utc>) -> Result<Bill, BookingError> {
        if bill.state != BillState::InOrder {
            return Ok(bill);
        }
        match apply_due_transition(self.store.as_ref(), &self.policy, &bill, now).await? {
            DueTransition::NotDue => Ok(bill),
            DueTransition::Applied { event, bill: updated } => {
                info!("Applied {} to bill {} on read", event, updated.id);
                Ok(updated)
            }
            DueTransition::Stale => Ok(self.store.find_bill(bill.id).await?.unwrap_or(bill)),
        }
    }

    pub async fn list_bills(&self, user_id: i32, now: DateTime<Utc>) -> Result<Vec<BillResponse>, BookingError> {
        let bills = self.store.list_user_bills(user_id).await?;
        let mut responses = Vec::with_capacity(bills.len());
        for bill in bills {
            let bill = self.refresh(bill, now).await?;
            responses.push(self.respond(bill).await?);
        }
        Ok(responses)
    }

    pub async fn get_bill(&self, user_id: i32, bill_id: Uuid, now: DateTime<Utc>) -> Result<BillResponse, BookingError> {
        let bill = self.load(user_id, bill_id).await?;
        let bill = self.refresh(bill, now).await?;
        self.respond(bill).await
    }

    /// Apply `event` to `bill`, guarded on the phase it was read in
    async fn transition(&self, bill: &Bill, event: BillEvent, now: DateTime<Utc>) -> Result<Bill, BookingError> {
        let plan = StatusMachine::plan(bill, event, now).map_err(BookingError::Conflict)?;
        self.store.apply_transition(&plan).await?.ok_or_else(|| {
            BookingError::Conflict(format!("Bill {} was changed by another request, reload and retry", bill.id))
        })
    }

    pub async fn confirm_arrival(&self, user_id: i32, bill_id: Uuid, now: DateTime<Utc>) -> Result<BillResponse, BookingError> {
        let bill = self.load(user_id, bill_id).await?;
        if bill.phase() == (BillState::InOrder, VisitStatus::OnProcess) {
            self.policy
                .check_arrival(bill.time, now)
                .map_err(BookingError::NotEligible)?;
        }

        let updated = self.transition(&bill, BillEvent::ConfirmArrival, now).await?;
        info!("Arrival confirmed for bill {}", bill_id);
        self.respond(updated).await
    }

    /// Customer cancellation; refunds first when the booking is still refundable,
    /// and the bill is only cancelled if the refund succeeds
    pub async fn cancel(&self, user_id: i32, bill_id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome, BookingError> {
        let bill = self.load(user_id, bill_id).await?;
        StatusMachine::plan(&bill, BillEvent::Cancel, now).map_err(BookingError::Conflict)?;

        let eligibility = self.policy.cancel_eligibility(bill.time, now);
        if !eligibility.can_cancel() {
            return Err(BookingError::NotEligible(format!(
                "Bookings cannot be cancelled less than {} hours before the appointment",
                self.policy.config().cancel_cutoff_hours
            )));
        }

        let refundable = eligibility.is_refundable()
            && bill.payment_status.has_online_payment()
            && bill.payment_method.is_gateway();
        if refundable {
            let max = self.refunds.validate_eligibility(&bill, None, now).max_amount;
            let completed = self
                .refunds
                .execute(user_id, bill_id, max, "Cancelled by customer", now)
                .await?;
            return Ok(CancelOutcome {
                bill: completed.bill,
                refund: Some(completed.refund),
            });
        }

        let cancelled = self.transition(&bill, BillEvent::Cancel, now).await?;
        info!("Bill {} cancelled by user {} without refund", bill_id, user_id);
        Ok(CancelOutcome {
            bill: cancelled,
            refund: None,
        })
    }

    /// Settle what is left after the deposit, online or at the counter
    pub async fn remaining_payment(
        &self,
        customer: &Customer,
        bill_id: Uuid,
        method: RemainingMethod,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, BookingError> {
        let bill = self.load(customer.user_id, bill_id).await?;
        if bill.state != BillState::InOrder {
            return Err(BookingError::Conflict(format!("Bill {} is already {}", bill_id, bill.state)));
        }
        if bill.payment_status != PaymentStatus::DepositPaid {
            return Err(BookingError::NotEligible(format!(
                "Only deposit-paid bills have a remaining balance, this one is {}",
                bill.payment_status
            )));
        }
        let remaining = bill.remaining_amount();
        if remaining <= Decimal::ZERO {
            return Err(BookingError::NotEligible("Nothing remains to be paid".to_string()));
        }

        match method {
            RemainingMethod::Vnpay => {
                let session = self
                    .sessions
                    .create_session(
                        SessionRequest {
                            user_id: customer.user_id,
                            bill_id: Some(bill_id),
                            snapshot: None,
                            amount: remaining,
                            payment_type: PaymentType::Full,
                            order_info: format!("Remaining balance for booking {}", bill_id),
                            client_ip: customer.client_ip.clone(),
                        },
                        now,
                    )
                    .await?;
                Ok(BookingOutcome::PaymentRequired { session })
            }
            RemainingMethod::Counter => {
                let updated = self
                    .store
                    .defer_remaining_to_counter(CounterDeferral {
                        bill_id,
                        user_id: customer.user_id,
                        fallback_order_id: generate_order_id(self.sessions.codec(), now),
                        remaining,
                        at: now,
                    })
                    .await?;
                info!("Remaining {} of bill {} deferred to the counter", remaining, bill_id);
                Ok(BookingOutcome::Confirmed {
                    bill: self.respond(updated).await?,
                })
            }
        }
    }

    /// Move a booking onto other tables: claim the new ones, then let go of the old
    pub async fn change_tables(
        &self,
        user_id: i32,
        bill_id: Uuid,
        table_ids: &[i32],
        now: DateTime<Utc>,
    ) -> Result<BillResponse, BookingError> {
        let bill = self.load(user_id, bill_id).await?;
        if bill.phase() != (BillState::InOrder, VisitStatus::OnProcess) {
            return Err(BookingError::Conflict(format!(
                "Tables can only be changed before arrival, bill is {}/{}",
                bill.state, bill.visit
            )));
        }
        if bill.time <= now {
            return Err(BookingError::NotEligible("The appointment has already started".to_string()));
        }

        self.tables
            .validate_selection(bill.num_people, table_ids, Some(bill.id))
            .await?;

        let current = self.store.bill_table_ids(bill.id).await?;
        let to_claim: Vec<i32> = table_ids.iter().copied().filter(|id| !current.contains(id)).collect();
        let to_release: Vec<i32> = current.iter().copied().filter(|id| !table_ids.contains(id)).collect();

        if !to_claim.is_empty() {
            self.tables.allocate(bill.id, &to_claim).await?;
        }
        if !to_release.is_empty() {
            if let Err(e) = self.store.detach_tables(bill.id, &to_release).await {
                error!(
                    manual_review = true,
                    step = "detach_tables",
                    "Bill {} now holds tables {:?} but still holds {:?}: {}",
                    bill.id,
                    to_claim,
                    to_release,
                    e
                );
                return Err(BookingError::Inconsistent {
                    message: format!("New tables were reserved but tables {:?} could not be released", to_release),
                    step: "detach_tables",
                });
            }
        }

        info!("Bill {} moved from tables {:?} to {:?}", bill.id, current, table_ids);
        self.respond(bill).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::metrics::EngineMetrics;
    use crate::payments::gateway::test_support::{signed_callback, test_codec};
    use crate::payments::gateway::to_minor_units;
    use crate::payments::ReconciliationProcessor;
    use crate::refunds::SimulatedRefundGateway;
    use crate::store::MemoryStore;
    use crate::tables::TableState;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryStore>,
        service: BookingService,
        reconciliation: ReconciliationProcessor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let policy = PolicyEngine::new(PolicyConfig::default());
        let metrics = EngineMetrics::new();
        let tables = Arc::new(TableInventory::new(store.clone(), policy.clone()));
        let sessions = Arc::new(PaymentSessionManager::new(
            store.clone(),
            test_codec(),
            policy.config().clone(),
            metrics.clone(),
        ));
        let refunds = Arc::new(RefundEngine::new(
            store.clone(),
            policy.clone(),
            Arc::new(SimulatedRefundGateway::default()),
            std::time::Duration::from_secs(1),
            metrics.clone(),
        ));
        let service = BookingService::new(store.clone(), policy, tables, sessions, refunds);
        let reconciliation = ReconciliationProcessor::new(store.clone(), test_codec(), metrics);
        Fixture {
            store,
            service,
            reconciliation,
        }
    }

    fn regular() -> Customer {
        Customer {
            user_id: 9,
            tier: CustomerTier::Regular,
            client_ip: "10.0.0.9".to_string(),
        }
    }

    fn request(time: DateTime<Utc>, option: PaymentOption, food: bool) -> BookingRequest {
        BookingRequest {
            name: "Hoang Van F".to_string(),
            phone: "0901234567".to_string(),
            time,
            num_people: 4,
            note: None,
            table_ids: vec![1],
            cart_details: if food {
                vec![CartLine {
                    product_id: 2,
                    quantity: 4,
                    unit_price: dec!(250000),
                }]
            } else {
                Vec::new()
            },
            payment_option: option,
        }
    }

    async fn existing_bill(store: &MemoryStore, time: DateTime<Utc>, status: PaymentStatus, tables: Vec<i32>) -> Bill {
        store
            .create_bill(NewBill {
                id: Uuid::new_v4(),
                user_id: 9,
                name: "Hoang Van F".to_string(),
                phone: "0901234567".to_string(),
                time,
                num_people: 4,
                note: None,
                price: dec!(1000000),
                total_amount: dec!(1000000),
                deposit_amount: dec!(300000),
                payment_status: status,
                payment_method: PaymentMethod::Vnpay,
                payment_id: Some("14012345".to_string()),
                table_ids: tables,
                cart_lines: Vec::new(),
                created_at: time - Duration::days(3),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_vip_books_directly() {
        let f = fixture();
        let now = Utc::now();
        let vip = Customer {
            tier: CustomerTier::Vip,
            ..regular()
        };

        let outcome = f
            .service
            .book(&vip, request(now + Duration::hours(3), PaymentOption::Deposit, true), now)
            .await
            .unwrap();

        let BookingOutcome::Confirmed { bill } = outcome else {
            panic!("VIP booking should not need a payment session");
        };
        assert_eq!(bill.bill.payment_method, PaymentMethod::Vip);
        assert_eq!(bill.bill.payment_status, PaymentStatus::CounterPayment);
        assert_eq!(bill.table_ids, vec![1]);
        let table = &f.store.find_tables(&[1]).await.unwrap()[0];
        assert_eq!(table.state, TableState::Reserved);
    }

    #[tokio::test]
    async fn test_counter_payment_only_far_ahead() {
        let f = fixture();
        let now = Utc::now();

        let far = f
            .service
            .book(&regular(), request(now + Duration::hours(30), PaymentOption::Counter, false), now)
            .await
            .unwrap();
        assert!(matches!(far, BookingOutcome::Confirmed { .. }));

        let mut near = request(now + Duration::hours(5), PaymentOption::Counter, false);
        near.table_ids = vec![2];
        let err = f.service.book(&regular(), near, now).await.unwrap_err();
        assert!(matches!(err, BookingError::NotEligible(_)));
    }

    #[tokio::test]
    async fn test_near_booking_pays_deposit_then_bill_appears() {
        let f = fixture();
        let now = Utc::now();

        let outcome = f
            .service
            .book(&regular(), request(now + Duration::hours(10), PaymentOption::Deposit, true), now)
            .await
            .unwrap();
        let BookingOutcome::PaymentRequired { session } = outcome else {
            panic!("near booking should require payment");
        };
        assert_eq!(session.amount, dec!(300000));
        assert!(f.store.list_user_bills(9).await.unwrap().is_empty());
        // Tables are only claimed once the money arrives
        assert_eq!(f.store.find_tables(&[1]).await.unwrap()[0].state, TableState::Empty);

        let minor = to_minor_units(session.amount).unwrap();
        let callback = signed_callback(&session.order_id, minor, "00", "00");
        let settled = f.reconciliation.process(&callback, now).await.unwrap();

        let bill = settled.bill.unwrap();
        assert_eq!(bill.payment_status, PaymentStatus::DepositPaid);
        assert_eq!(bill.deposit_amount, dec!(300000));
        let listed = f.service.list_bills(9, now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].table_ids, vec![1]);
    }

    #[tokio::test]
    async fn test_full_payment_needs_food() {
        let f = fixture();
        let now = Utc::now();
        let err = f
            .service
            .book(&regular(), request(now + Duration::hours(10), PaymentOption::Full, false), now)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_booking_validates_tables_and_time() {
        let f = fixture();
        let now = Utc::now();

        let mut big_party = request(now + Duration::hours(30), PaymentOption::Counter, false);
        big_party.num_people = 10;
        let err = f.service.book(&regular(), big_party, now).await.unwrap_err();
        assert!(matches!(err, BookingError::Table(_)));

        let past = request(now - Duration::hours(1), PaymentOption::Counter, false);
        let err = f.service.book(&regular(), past, now).await.unwrap_err();
        assert!(matches!(err, BookingError::Rejected(_)));

        let mut bad_phone = request(now + Duration::hours(30), PaymentOption::Counter, false);
        bad_phone.phone = "12345".to_string();
        let err = f.service.book(&regular(), bad_phone, now).await.unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_arrival_window_and_table_occupancy() {
        let f = fixture();
        let now = Utc::now();
        let soon = existing_bill(&f.store, now + Duration::minutes(5), PaymentStatus::DepositPaid, vec![3]).await;
        let later = existing_bill(&f.store, now + Duration::hours(2), PaymentStatus::DepositPaid, vec![4]).await;

        let arrived = f.service.confirm_arrival(9, soon.id, now).await.unwrap();
        assert_eq!(arrived.bill.visit, VisitStatus::Visited);
        assert_eq!(f.store.find_tables(&[3]).await.unwrap()[0].state, TableState::Occupied);

        let again = f.service.confirm_arrival(9, soon.id, now).await.unwrap_err();
        assert!(matches!(again, BookingError::Conflict(_)));

        let early = f.service.confirm_arrival(9, later.id, now).await.unwrap_err();
        assert!(matches!(early, BookingError::NotEligible(_)));
    }

    #[tokio::test]
    async fn test_refundable_cancel_refunds_deposit() {
        let f = fixture();
        let now = Utc::now();
        let bill = existing_bill(&f.store, now + Duration::hours(25), PaymentStatus::DepositPaid, vec![5]).await;

        let outcome = f.service.cancel(9, bill.id, now).await.unwrap();

        let refund = outcome.refund.unwrap();
        assert_eq!(refund.refund_amount, dec!(300000));
        assert_eq!(outcome.bill.state, BillState::Cancelled);
        assert_eq!(f.store.find_tables(&[5]).await.unwrap()[0].state, TableState::Empty);
    }

    #[tokio::test]
    async fn test_late_cancel_keeps_payment_and_very_late_is_refused() {
        let f = fixture();
        let now = Utc::now();
        let mid = existing_bill(&f.store, now + Duration::hours(10), PaymentStatus::DepositPaid, vec![6]).await;
        let close = existing_bill(&f.store, now + Duration::hours(1), PaymentStatus::DepositPaid, vec![7]).await;

        let outcome = f.service.cancel(9, mid.id, now).await.unwrap();
        assert!(outcome.refund.is_none());
        assert_eq!(outcome.bill.state, BillState::Cancelled);
        assert_eq!(f.store.find_tables(&[6]).await.unwrap()[0].state, TableState::Empty);

        let err = f.service.cancel(9, close.id, now).await.unwrap_err();
        assert!(matches!(err, BookingError::NotEligible(_)));
        assert_eq!(f.store.find_tables(&[7]).await.unwrap()[0].state, TableState::Reserved);
    }

    #[tokio::test]
    async fn test_remaining_balance_online_and_at_counter() {
        let f = fixture();
        let now = Utc::now();
        let online = existing_bill(&f.store, now + Duration::hours(30), PaymentStatus::DepositPaid, vec![8]).await;
        let counter = existing_bill(&f.store, now + Duration::hours(30), PaymentStatus::DepositPaid, vec![9]).await;

        let outcome = f
            .service
            .remaining_payment(&regular(), online.id, RemainingMethod::Vnpay, now)
            .await
            .unwrap();
        let BookingOutcome::PaymentRequired { session } = outcome else {
            panic!("online remaining payment needs a session");
        };
        assert_eq!(session.amount, dec!(700000));

        let outcome = f
            .service
            .remaining_payment(&regular(), counter.id, RemainingMethod::Counter, now)
            .await
            .unwrap();
        let BookingOutcome::Confirmed { bill } = outcome else {
            panic!("counter deferral confirms directly");
        };
        assert_eq!(bill.bill.payment_status, PaymentStatus::PendingCounter);

        let err = f
            .service
            .remaining_payment(&regular(), counter.id, RemainingMethod::Counter, now)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::NotEligible(_)));
    }

    #[tokio::test]
    async fn test_change_tables_moves_reservation() {
        let f = fixture();
        let now = Utc::now();
        let bill = existing_bill(&f.store, now + Duration::hours(30), PaymentStatus::DepositPaid, vec![10]).await;

        let moved = f.service.change_tables(9, bill.id, &[11], now).await.unwrap();
        assert_eq!(moved.table_ids, vec![11]);

        let tables = f.store.find_tables(&[10, 11]).await.unwrap();
        assert_eq!(tables[0].state, TableState::Empty);
        assert_eq!(tables[1].state, TableState::Reserved);
        assert_eq!(tables[1].holder_bill_id, Some(bill.id));

        // Another customer's table cannot be taken
        f.store.allocate_tables(Uuid::new_v4(), &[12]).await.unwrap();
        let err = f.service.change_tables(9, bill.id, &[12], now).await.unwrap_err();
        assert!(matches!(err, BookingError::Table(_)));
    }

    #[tokio::test]
    async fn test_other_users_bills_are_hidden() {
        let f = fixture();
        let now = Utc::now();
        let bill = existing_bill(&f.store, now + Duration::hours(30), PaymentStatus::DepositPaid, vec![1]).await;
        assert!(matches!(
            f.service.get_bill(10, bill.id, now).await,
            Err(BookingError::NotFound(_))
        ));
        assert!(f.service.get_bill(9, bill.id, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_overdue_bill_is_cancelled_when_loaded() {
        let f = fixture();
        let now = Utc::now();
        let overdue = existing_bill(&f.store, now - Duration::minutes(30), PaymentStatus::DepositPaid, vec![1]).await;
        let upcoming = existing_bill(&f.store, now + Duration::hours(30), PaymentStatus::DepositPaid, vec![2]).await;

        let listed = f.service.list_bills(9, now).await.unwrap();
        let shown = listed.iter().find(|b| b.bill.id == overdue.id).unwrap();
        assert_eq!(shown.bill.phase(), (BillState::Cancelled, VisitStatus::UnVisited));
        assert_eq!(f.store.find_tables(&[1]).await.unwrap()[0].state, TableState::Empty);

        // Upcoming bills are left alone
        let kept = f.service.get_bill(9, upcoming.id, now).await.unwrap();
        assert_eq!(kept.bill.state, BillState::InOrder);
        assert_eq!(f.store.find_tables(&[2]).await.unwrap()[0].state, TableState::Reserved);

        // A second read sees the stored result
        let again = f.service.get_bill(9, overdue.id, now).await.unwrap();
        assert_eq!(again.bill.state, BillState::Cancelled);
    }
}
