// Reconciliation of gateway callbacks.
//
// A callback is applied at most once per order id: the payment row's own status
// is the idempotency key, checked and written under the store's guard. The
// browser return and the server notification go through the same path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::bookings::{NewBill, PaymentMethod, PaymentStatus};
use crate::metrics::EngineMetrics;
use crate::payments::error::PaymentError;
use crate::payments::gateway::{to_minor_units, GatewayCodec, GatewayError};
use crate::payments::{GatewayCallback, IpnResponse, Payment, PaymentState, PaymentType, ReconciliationOutcome};
use crate::store::{BillEffect, BookingStore, SettleResult, Settlement, StoreError};

pub struct ReconciliationProcessor {
    store: Arc<dyn BookingStore>,
    codec: GatewayCodec,
    metrics: EngineMetrics,
}

impl ReconciliationProcessor {
    pub fn new(store: Arc<dyn BookingStore>, codec: GatewayCodec, metrics: EngineMetrics) -> Self {
        Self { store, codec, metrics }
    }

    /// Verify a callback and apply it to its payment (and bill) exactly once
    pub async fn process(
        &self,
        params: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationOutcome, PaymentError> {
        let callback = match self.codec.parse_callback(params) {
            Ok(callback) => callback,
            Err(e @ (GatewayError::SignatureMismatch | GatewayError::MissingHash)) => {
                self.metrics.record_integrity_rejection();
                error!(
                    manual_review = true,
                    "Rejected gateway callback for {:?}: {}",
                    params.get("vnp_TxnRef"),
                    e
                );
                return Err(PaymentError::Integrity(e.to_string()));
            }
            Err(e) => return Err(PaymentError::Validation(e.to_string())),
        };

        let payment = self
            .store
            .find_payment(&callback.order_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(callback.order_id.clone()))?;

        let expected = to_minor_units(payment.amount)?;
        if expected != callback.amount_minor {
            self.metrics.record_amount_mismatch();
            error!(
                manual_review = true,
                "Amount mismatch on {}: stored {} minor units, callback {}",
                payment.order_id, expected, callback.amount_minor
            );
            return Err(PaymentError::AmountMismatch {
                expected,
                received: callback.amount_minor,
            });
        }

        if payment.status.is_terminal() {
            return self.already_processed(payment).await;
        }

        if now > payment.expires_at {
            self.metrics.record_late_callback();
            warn!(
                "Late callback for {}: session expired at {}, accepted after order/amount check",
                payment.order_id, payment.expires_at
            );
        }

        let status = callback.outcome();
        let effect = if status == PaymentState::Completed {
            Self::bill_effect(&payment, &callback, now)
        } else {
            BillEffect::None
        };
        let creates_or_updates_bill = !matches!(effect, BillEffect::None);

        let settlement = Settlement {
            order_id: payment.order_id.clone(),
            status,
            response_code: callback.response_code.clone(),
            transaction_status: callback.transaction_status.clone(),
            transaction_no: callback.transaction_no.clone(),
            bill_effect: effect,
            at: now,
        };

        match self.store.settle_payment(settlement.clone()).await {
            Ok(SettleResult::Settled { payment, bill }) => {
                self.metrics.record_callback_processed();
                info!(
                    "Payment {} settled as {} (response code {})",
                    payment.order_id, payment.status, callback.response_code
                );
                Ok(ReconciliationOutcome {
                    order_id: payment.order_id,
                    status: payment.status,
                    already_processed: false,
                    message: Self::message(payment.status).to_string(),
                    bill,
                    manual_review: false,
                })
            }
            Ok(SettleResult::AlreadySettled(payment)) => self.already_processed(payment).await,
            Err(StoreError::Conflict(reason)) if creates_or_updates_bill => {
                // Money moved but the reservation can no longer be honoured as requested
                error!(
                    manual_review = true,
                    "Payment {} completed but its bill could not be applied: {}",
                    settlement.order_id, reason
                );
                let fallback = Settlement {
                    bill_effect: BillEffect::None,
                    ..settlement
                };
                match self.store.settle_payment(fallback).await? {
                    SettleResult::Settled { payment, .. } => {
                        self.metrics.record_callback_processed();
                        Ok(ReconciliationOutcome {
                            order_id: payment.order_id,
                            status: payment.status,
                            already_processed: false,
                            bill: None,
                            manual_review: true,
                            message: format!("Payment received but the booking needs staff attention: {}", reason),
                        })
                    }
                    SettleResult::AlreadySettled(payment) => self.already_processed(payment).await,
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn bill_effect(payment: &Payment, callback: &GatewayCallback, now: DateTime<Utc>) -> BillEffect {
        match (payment.bill_id, &payment.bill_data) {
            (Some(bill_id), _) => BillEffect::MarkPaid {
                bill_id,
                expected: PaymentStatus::DepositPaid,
                new_status: PaymentStatus::FullyPaid,
                method: PaymentMethod::Vnpay,
            },
            (None, Some(snapshot)) => {
                let status = match payment.payment_type {
                    PaymentType::Deposit => PaymentStatus::DepositPaid,
                    PaymentType::Full | PaymentType::Counter => PaymentStatus::FullyPaid,
                };
                BillEffect::Create(NewBill::from_snapshot(
                    payment.user_id,
                    snapshot,
                    status,
                    PaymentMethod::Vnpay,
                    callback.transaction_no.clone(),
                    now,
                ))
            }
            (None, None) => {
                warn!("Payment {} has neither a bill nor a snapshot", payment.order_id);
                BillEffect::None
            }
        }
    }

    async fn already_processed(&self, payment: Payment) -> Result<ReconciliationOutcome, PaymentError> {
        self.metrics.record_duplicate_callback();
        warn!(
            "Duplicate callback for {} ignored, payment already {}",
            payment.order_id, payment.status
        );

        let bill = match payment.bill_id {
            Some(id) => self.store.find_bill(id).await?,
            None => None,
        };
        Ok(ReconciliationOutcome {
            order_id: payment.order_id,
            status: payment.status,
            already_processed: true,
            message: Self::message(payment.status).to_string(),
            bill,
            manual_review: false,
        })
    }

    fn message(status: PaymentState) -> &'static str {
        match status {
            PaymentState::Completed => "Payment successful",
            PaymentState::Cancelled => "Payment cancelled by customer",
            PaymentState::Failed => "Payment failed",
            PaymentState::Pending => "Payment pending",
            PaymentState::AtCounter => "Payment due at the counter",
        }
    }

    /// Server-to-server notification: same processing, answered with gateway codes
    pub async fn handle_ipn(&self, params: &HashMap<String, String>, now: DateTime<Utc>) -> IpnResponse {
        match self.process(params, now).await {
            Ok(outcome) if outcome.already_processed => IpnResponse::already_confirmed(),
            Ok(_) => IpnResponse::confirmed(),
            Err(PaymentError::Integrity(_)) => IpnResponse::invalid_checksum(),
            Err(PaymentError::NotFound(_)) => IpnResponse::order_not_found(),
            Err(PaymentError::AmountMismatch { .. }) => IpnResponse::invalid_amount(),
            Err(e) => {
                error!("Notification processing failed: {}", e);
                IpnResponse::unknown_error()
            }
        }
    }
}
