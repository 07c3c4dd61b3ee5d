// Refund Engine
//
// A refund is only ever issued once per bill: the refund slot is reserved in the
// store before the gateway is called, and released again if the call fails.
// Completing the refund and cancelling the bill happen in one store call.

use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bookings::{Bill, BillEvent, BillState, PaymentStatus, StatusMachine, VisitStatus};
use crate::error::ApiError;
use crate::metrics::EngineMetrics;
use crate::policy::PolicyEngine;
use crate::refunds::gateway::{RefundGateway, RefundGatewayRequest};
use crate::refunds::{NewRefund, Refund, RefundEligibility};
use crate::store::{BookingStore, RefundCompleted, RefundCompletion, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error("Bill {0} not found")]
    NotFound(Uuid),

    #[error("Bill is not eligible for a refund")]
    NotEligible(Vec<String>),

    #[error("Refund amount {amount} must be positive and at most {max}")]
    InvalidAmount { amount: Decimal, max: Decimal },

    #[error("Bill {0} has already been refunded")]
    AlreadyRefunded(Uuid),

    #[error("{0}")]
    Gateway(String),

    #[error("{message}")]
    Inconsistent { message: String, step: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RefundError> for ApiError {
    fn from(error: RefundError) -> Self {
        match error {
            RefundError::NotFound(id) => ApiError::not_found("Bill", id),
            RefundError::NotEligible(reasons) => ApiError::Rejected {
                message: "Bill is not eligible for a refund".to_string(),
                reasons,
                unprocessable: true,
            },
            RefundError::InvalidAmount { .. } => ApiError::rejected(error.to_string()),
            RefundError::AlreadyRefunded(_) => ApiError::Conflict {
                message: error.to_string(),
            },
            RefundError::Gateway(message) => ApiError::External { message },
            RefundError::Inconsistent { message, step } => ApiError::Inconsistency {
                message,
                step: step.to_string(),
            },
            RefundError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for RefundError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

pub struct RefundEngine {
    store: Arc<dyn BookingStore>,
    policy: PolicyEngine,
    gateway: Arc<dyn RefundGateway>,
    timeout: Duration,
    metrics: EngineMetrics,
}

impl RefundEngine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        policy: PolicyEngine,
        gateway: Arc<dyn RefundGateway>,
        timeout: Duration,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            store,
            policy,
            gateway,
            timeout,
            metrics,
        }
    }

    /// Eligibility of a loaded bill; `existing` is its refund record, if any
    pub fn validate_eligibility(&self, bill: &Bill, existing: Option<&Refund>, now: DateTime<Utc>) -> RefundEligibility {
        let mut reasons = Vec::new();

        if bill.state != BillState::InOrder {
            reasons.push(format!("Bill is already {}", bill.state));
        } else if bill.visit != VisitStatus::OnProcess {
            reasons.push("Party has already arrived".to_string());
        }
        if !bill.payment_status.has_online_payment() {
            reasons.push(format!("Payment status {} has no online payment to refund", bill.payment_status));
        }
        if !bill.payment_method.is_gateway() {
            reasons.push(format!("Bill was paid by {}, not online", bill.payment_method));
        }
        if !self.policy.within_refund_window(bill.time, now) {
            reasons.push(format!(
                "Refunds close {} hours before the appointment",
                self.policy.config().refund_window_hours
            ));
        }
        if existing.is_some() {
            reasons.push("A refund has already been issued for this bill".to_string());
        }

        let can_refund = reasons.is_empty();
        RefundEligibility {
            can_refund,
            reasons,
            max_amount: if can_refund { Self::paid_online(bill) } else { Decimal::ZERO },
        }
    }

    fn paid_online(bill: &Bill) -> Decimal {
        match bill.payment_status {
            PaymentStatus::DepositPaid => bill.deposit_amount,
            PaymentStatus::FullyPaid => bill.total_amount,
            _ => Decimal::ZERO,
        }
    }

    async fn load_bill(&self, user_id: i32, bill_id: Uuid) -> Result<Bill, RefundError> {
        match self.store.find_bill(bill_id).await? {
            Some(bill) if bill.user_id == user_id => Ok(bill),
            _ => Err(RefundError::NotFound(bill_id)),
        }
    }

    pub async fn eligibility(&self, user_id: i32, bill_id: Uuid, now: DateTime<Utc>) -> Result<RefundEligibility, RefundError> {
        let bill = self.load_bill(user_id, bill_id).await?;
        let existing = self.store.find_refund(bill_id).await?;
        Ok(self.validate_eligibility(&bill, existing.as_ref(), now))
    }

    /// Refund up to the eligible maximum and cancel the bill
    pub async fn execute(
        &self,
        user_id: i32,
        bill_id: Uuid,
        amount: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundCompleted, RefundError> {
        let bill = self.load_bill(user_id, bill_id).await?;

        // Rejected before the gateway is ever contacted
        if self.store.find_refund(bill_id).await?.is_some() {
            return Err(RefundError::AlreadyRefunded(bill_id));
        }

        let eligibility = self.validate_eligibility(&bill, None, now);
        if !eligibility.can_refund {
            return Err(RefundError::NotEligible(eligibility.reasons));
        }
        if amount <= Decimal::ZERO || amount > eligibility.max_amount {
            return Err(RefundError::InvalidAmount {
                amount,
                max: eligibility.max_amount,
            });
        }

        let transition =
            StatusMachine::plan(&bill, BillEvent::Cancel, now).map_err(|reason| RefundError::NotEligible(vec![reason]))?;

        let reservation = self
            .store
            .reserve_refund(NewRefund {
                id: Uuid::new_v4(),
                bill_id,
                original_amount: eligibility.max_amount,
                refund_amount: amount,
                refund_reason: reason.to_string(),
                created_at: now,
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => RefundError::AlreadyRefunded(bill_id),
                other => other.into(),
            })?;

        let request = RefundGatewayRequest {
            bill_id,
            transaction_no: bill.payment_id.clone(),
            amount,
            reason: reason.to_string(),
        };
        let receipt = match tokio::time::timeout(self.timeout, self.gateway.refund(&request)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => return Err(self.abandon(reservation.id, e.to_string()).await),
            Err(_) => {
                let message = format!("Refund gateway did not answer within {} ms", self.timeout.as_millis());
                return Err(self.abandon(reservation.id, message).await);
            }
        };

        let completed = self
            .store
            .complete_refund(RefundCompletion {
                refund_id: reservation.id,
                transaction_no: receipt.transaction_no.clone(),
                transition,
            })
            .await
            .map_err(|e| {
                error!(
                    manual_review = true,
                    step = "complete_refund",
                    "Refund {} was paid out by the gateway but could not be recorded for bill {}: {}",
                    receipt.transaction_no,
                    bill_id,
                    e
                );
                RefundError::Inconsistent {
                    message: format!(
                        "Refund {} was issued but the bill could not be cancelled: {}",
                        receipt.transaction_no, e
                    ),
                    step: "complete_refund",
                }
            })?;

        self.metrics.record_refund_executed();
        info!(
            "Refunded {} of {} for bill {} ({}), bill cancelled",
            amount, eligibility.max_amount, bill_id, receipt.transaction_no
        );
        Ok(completed)
    }

    /// Free the refund slot after a failed gateway call so the customer can retry
    async fn abandon(&self, refund_id: Uuid, cause: String) -> RefundError {
        warn!("Refund {} abandoned: {}", refund_id, cause);
        match self.store.discard_refund(refund_id).await {
            Ok(()) => RefundError::Gateway(cause),
            Err(e) => {
                error!(
                    manual_review = true,
                    step = "discard_refund",
                    "Refund reservation {} could not be released: {}",
                    refund_id,
                    e
                );
                RefundError::Inconsistent {
                    message: format!("Refund failed ({}) and its reservation is still held", cause),
                    step: "discard_refund",
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::{NewBill, PaymentMethod};
    use crate::config::PolicyConfig;
    use crate::refunds::gateway::{RefundGatewayError, RefundReceipt, SimulatedRefundGateway};
    use crate::refunds::RefundStatus;
    use crate::store::MemoryStore;
    use crate::tables::TableState;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fails (or hangs) until switched on, counting every call
    #[derive(Default)]
    struct FlakyGateway {
        healthy: AtomicBool,
        hang: bool,
        calls: AtomicUsize,
    }

    #[axum::async_trait]
    impl RefundGateway for FlakyGateway {
        async fn refund(&self, _request: &RefundGatewayRequest) -> Result<RefundReceipt, RefundGatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                return Ok(RefundReceipt {
                    transaction_no: "RF-TEST-1".to_string(),
                });
            }
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Err(RefundGatewayError::Unavailable("connection refused".to_string()))
        }
    }

    fn engine_with(store: Arc<MemoryStore>, gateway: Arc<dyn RefundGateway>) -> RefundEngine {
        RefundEngine::new(
            store,
            PolicyEngine::new(PolicyConfig::default()),
            gateway,
            Duration::from_millis(50),
            EngineMetrics::new(),
        )
    }

    async fn paid_bill(store: &MemoryStore, hours_ahead: i64, status: PaymentStatus, method: PaymentMethod) -> Bill {
        let now = Utc::now();
        store
            .create_bill(NewBill {
                id: Uuid::new_v4(),
                user_id: 5,
                name: "Le Van C".to_string(),
                phone: "0987654321".to_string(),
                time: now + chrono::Duration::hours(hours_ahead),
                num_people: 4,
                note: None,
                price: dec!(1000000),
                total_amount: dec!(1000000),
                deposit_amount: dec!(300000),
                payment_status: status,
                payment_method: method,
                payment_id: Some("14012345".to_string()),
                table_ids: vec![2],
                cart_lines: Vec::new(),
                created_at: now,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_refund_cancels_bill_and_frees_tables() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), Arc::new(SimulatedRefundGateway::default()));
        let bill = paid_bill(&store, 25, PaymentStatus::DepositPaid, PaymentMethod::Vnpay).await;
        let now = Utc::now();

        let eligibility = engine.eligibility(5, bill.id, now).await.unwrap();
        assert!(eligibility.can_refund);
        assert_eq!(eligibility.max_amount, dec!(300000));

        let done = engine
            .execute(5, bill.id, eligibility.max_amount, "Change of plans", now)
            .await
            .unwrap();

        assert_eq!(done.refund.status, RefundStatus::Completed);
        assert_eq!(done.refund.refund_amount, dec!(300000));
        assert!(done.refund.refund_transaction_no.as_deref().unwrap().starts_with("RF"));
        assert_eq!(done.bill.state, BillState::Cancelled);
        assert_eq!(done.bill.visit, VisitStatus::UnVisited);
        assert_eq!(done.bill.refund_status, Some(RefundStatus::Completed));
        let table = &store.find_tables(&[2]).await.unwrap()[0];
        assert_eq!(table.state, TableState::Empty);
    }

    #[tokio::test]
    async fn test_second_refund_is_rejected_before_gateway() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FlakyGateway::default());
        gateway.healthy.store(true, Ordering::SeqCst);
        let engine = engine_with(store.clone(), gateway.clone());
        let bill = paid_bill(&store, 48, PaymentStatus::FullyPaid, PaymentMethod::Vnpay).await;
        let now = Utc::now();

        engine.execute(5, bill.id, dec!(1000000), "first", now).await.unwrap();
        let err = engine.execute(5, bill.id, dec!(1000000), "second", now).await.unwrap_err();

        assert!(matches!(err, RefundError::AlreadyRefunded(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gateway_timeout_releases_reservation() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FlakyGateway {
            hang: true,
            ..FlakyGateway::default()
        });
        let engine = engine_with(store.clone(), gateway.clone());
        let bill = paid_bill(&store, 30, PaymentStatus::DepositPaid, PaymentMethod::Vnpay).await;
        let now = Utc::now();

        let err = engine.execute(5, bill.id, dec!(300000), "sick", now).await.unwrap_err();
        assert!(matches!(err, RefundError::Gateway(_)));
        assert!(store.find_refund(bill.id).await.unwrap().is_none());
        let unchanged = store.find_bill(bill.id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, BillState::InOrder);

        gateway.healthy.store(true, Ordering::SeqCst);
        assert!(engine.execute(5, bill.id, dec!(300000), "sick", now).await.is_ok());
    }

    #[tokio::test]
    async fn test_amount_above_maximum_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), Arc::new(SimulatedRefundGateway::default()));
        let bill = paid_bill(&store, 30, PaymentStatus::DepositPaid, PaymentMethod::Vnpay).await;

        let err = engine
            .execute(5, bill.id, dec!(300001), "too much", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RefundError::InvalidAmount { .. }));
        assert!(store.find_refund(bill.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ineligible_bills_list_every_reason() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), Arc::new(SimulatedRefundGateway::default()));
        let bill = paid_bill(&store, 10, PaymentStatus::CounterPayment, PaymentMethod::Counter).await;

        let eligibility = engine.eligibility(5, bill.id, Utc::now()).await.unwrap();
        assert!(!eligibility.can_refund);
        assert_eq!(eligibility.reasons.len(), 3);
        assert_eq!(eligibility.max_amount, Decimal::ZERO);

        assert!(matches!(
            engine.eligibility(6, bill.id, Utc::now()).await,
            Err(RefundError::NotFound(_))
        ));
    }
}
