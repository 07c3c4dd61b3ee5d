// Booking Policy Engine
//
// Pure functions deciding whether a reservation must be paid in advance, how large
// the deposit is, and which cancel / arrival / sweep transitions are allowed at a
// given instant. No I/O: every decision takes `now` explicitly.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::bookings::{Bill, BillState, VisitStatus};
use crate::config::PolicyConfig;

/// Customer tier carried in the caller's token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CustomerTier {
    Vip,
    #[default]
    Regular,
}

/// Advance-payment requirement for a prospective booking
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PaymentQuote {
    pub hours_until: f64,
    pub payment_required: bool,
    pub deposit_amount: Decimal,
    /// Amount charged when paying everything up front
    pub full_amount: Decimal,
    pub full_payment_available: bool,
}

/// What a cancellation at a given instant is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelEligibility {
    /// Cancellable, and online payments are refunded
    Refundable,
    /// Cancellable, payments are kept
    NonRefundable,
    NotCancellable,
}

impl CancelEligibility {
    pub fn can_cancel(&self) -> bool {
        !matches!(self, CancelEligibility::NotCancellable)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, CancelEligibility::Refundable)
    }
}

/// Policy engine over a fixed set of thresholds
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Hours from `now` until the appointment; negative once it has passed
    pub fn hours_until(time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        (time - now).num_milliseconds() as f64 / 3_600_000.0
    }

    /// Advance payment is required for regular customers booking inside the payment window
    pub fn payment_required(&self, time: DateTime<Utc>, now: DateTime<Utc>, tier: CustomerTier) -> bool {
        tier != CustomerTier::Vip && time - now < Duration::hours(self.config.payment_window_hours)
    }

    /// Deposit for a food subtotal: a clamped share of the subtotal, or the flat
    /// table-hold amount when nothing is pre-ordered
    pub fn deposit_amount(&self, subtotal: Decimal) -> Decimal {
        if subtotal <= Decimal::ZERO {
            return self.config.table_hold_deposit;
        }

        let share = (subtotal * self.config.deposit_rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        share.clamp(self.config.deposit_min, self.config.deposit_max)
    }

    pub fn quote(
        &self,
        time: DateTime<Utc>,
        now: DateTime<Utc>,
        subtotal: Decimal,
        tier: CustomerTier,
    ) -> PaymentQuote {
        PaymentQuote {
            hours_until: Self::hours_until(time, now),
            payment_required: self.payment_required(time, now, tier),
            deposit_amount: self.deposit_amount(subtotal),
            full_amount: subtotal.max(Decimal::ZERO),
            full_payment_available: subtotal > Decimal::ZERO,
        }
    }

    /// Number of tables a party needs
    pub fn required_tables(&self, num_people: i32) -> i32 {
        if num_people <= 0 {
            return 0;
        }
        let seats = self.config.seats_per_table;
        (num_people + seats - 1) / seats
    }

    pub fn cancel_eligibility(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> CancelEligibility {
        let until = time - now;
        if until >= Duration::hours(self.config.refund_window_hours) {
            CancelEligibility::Refundable
        } else if until >= Duration::hours(self.config.cancel_cutoff_hours) {
            CancelEligibility::NonRefundable
        } else {
            CancelEligibility::NotCancellable
        }
    }

    /// Whether a refund is still possible for an appointment at `time`
    pub fn within_refund_window(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        time - now >= Duration::hours(self.config.refund_window_hours)
    }

    /// Arrival may only be confirmed close to the appointment
    pub fn check_arrival(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), String> {
        let window = Duration::minutes(self.config.arrival_window_minutes);
        let offset = now - time;

        if offset < -window {
            let minutes = (time - now).num_minutes();
            return Err(format!(
                "Too early to confirm arrival: appointment is in {} minutes, check-in opens {} minutes before",
                minutes, self.config.arrival_window_minutes
            ));
        }
        if offset > window {
            return Err(format!(
                "Too late to confirm arrival: check-in closed {} minutes after the appointment",
                self.config.arrival_window_minutes
            ));
        }
        Ok(())
    }

    /// Overdue, never showed up, and not paid in full or at the counter
    pub fn should_auto_cancel(&self, bill: &Bill, now: DateTime<Utc>) -> bool {
        bill.state == BillState::InOrder
            && bill.visit == VisitStatus::OnProcess
            && now - bill.time >= Duration::minutes(self.config.auto_cancel_grace_minutes)
            && !bill.payment_status.is_settled_or_counter()
    }

    /// Party has been seated long enough to close the bill
    pub fn should_auto_complete(&self, bill: &Bill, now: DateTime<Utc>) -> bool {
        if bill.state != BillState::InOrder || bill.visit != VisitStatus::Visited {
            return false;
        }
        let since = bill.visited_at.unwrap_or(bill.updated_at);
        now - since >= Duration::minutes(self.config.auto_complete_minutes)
    }
}
