use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bookings::{Bill, BillState, VisitStatus};
use crate::tables::TableState;

/// (state, visit) pair a bill is in
pub type BillPhase = (BillState, VisitStatus);

/// Lifecycle events a bill can go through after creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillEvent {
    /// Staff or customer confirmed the party is at the venue
    ConfirmArrival,
    /// Visit finished (sweep after the seating period)
    Complete,
    /// No-show past the grace period (sweep)
    AutoCancel,
    /// Customer cancelled, possibly after a refund
    Cancel,
}

impl BillEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillEvent::ConfirmArrival => "confirm_arrival",
            BillEvent::Complete => "complete",
            BillEvent::AutoCancel => "auto_cancel",
            BillEvent::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for BillEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to the bill's tables alongside the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEffect {
    /// reserved -> occupied
    Occupy,
    /// -> empty, only for tables this bill still holds
    Release,
}

/// A fully planned transition, applied by the store as one unit.
/// `from` is the compare-and-set guard: the write only happens if the bill is
/// still in that phase when the store re-reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct BillTransition {
    pub bill_id: Uuid,
    pub event: BillEvent,
    pub from: BillPhase,
    pub to: BillPhase,
    pub tables: TableEffect,
    pub at: DateTime<Utc>,
}

/// Transition table for bills
pub struct StatusMachine;

impl StatusMachine {
    /// Source phase, target phase and table effect of an event
    ///
    /// # Transitions
    /// - in_order/on_process -> ConfirmArrival -> in_order/visited, tables occupied
    /// - in_order/visited -> Complete -> completed/visited, tables released
    /// - in_order/on_process -> AutoCancel | Cancel -> cancelled/un_visited, tables released
    pub fn rule(event: BillEvent) -> (BillPhase, BillPhase, TableEffect) {
        use BillState::*;
        use VisitStatus::*;

        match event {
            BillEvent::ConfirmArrival => ((InOrder, OnProcess), (InOrder, Visited), TableEffect::Occupy),
            BillEvent::Complete => ((InOrder, Visited), (Completed, Visited), TableEffect::Release),
            BillEvent::AutoCancel | BillEvent::Cancel => {
                ((InOrder, OnProcess), (Cancelled, UnVisited), TableEffect::Release)
            }
        }
    }

    pub fn is_valid_transition(from: BillPhase, event: BillEvent) -> bool {
        Self::rule(event).0 == from
    }

    /// Plan `event` for `bill`, or explain why it is not allowed from its current phase
    pub fn plan(bill: &Bill, event: BillEvent, at: DateTime<Utc>) -> Result<BillTransition, String> {
        let (from, to, tables) = Self::rule(event);
        if bill.phase() != from {
            return Err(format!(
                "Cannot {} a bill that is {}/{}",
                event.as_str().replace('_', " "),
                bill.state,
                bill.visit
            ));
        }

        Ok(BillTransition {
            bill_id: bill.id,
            event,
            from,
            to,
            tables,
            at,
        })
    }

    /// Table state a bill in `phase` must hold its tables in; `None` once the
    /// bill is terminal and its tables must no longer be held by it
    pub fn held_table_state(phase: BillPhase) -> Option<TableState> {
        match phase {
            (BillState::InOrder, VisitStatus::OnProcess) => Some(TableState::Reserved),
            (BillState::InOrder, VisitStatus::Visited) => Some(TableState::Occupied),
            _ => None,
        }
    }
}
