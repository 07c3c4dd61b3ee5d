// Sweep Scheduler
//
// Periodically re-evaluates every in-order bill against the auto-cancel and
// auto-complete rules and applies the same transitions the interactive paths
// use. Each write is guarded on the phase the bill was read in, so a bill a
// customer changed meanwhile is simply skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bookings::{Bill, BillEvent, StatusMachine};
use crate::metrics::EngineMetrics;
use crate::policy::PolicyEngine;
use crate::store::{BookingStore, StoreError};

/// What the time rules did to a single bill
#[derive(Debug, Clone)]
pub enum DueTransition {
    NotDue,
    Applied { event: BillEvent, bill: Bill },
    /// The bill moved on between the read and the guarded write
    Stale,
}

/// Apply auto-cancel or auto-complete to `bill` if either is due at `now`.
///
/// Shared by the scheduled sweep and by bill reads, so both go through the
/// same status machine plan and guarded store write.
pub async fn apply_due_transition(
    store: &dyn BookingStore,
    policy: &PolicyEngine,
    bill: &Bill,
    now: DateTime<Utc>,
) -> Result<DueTransition, StoreError> {
    let event = if policy.should_auto_cancel(bill, now) {
        BillEvent::AutoCancel
    } else if policy.should_auto_complete(bill, now) {
        BillEvent::Complete
    } else {
        return Ok(DueTransition::NotDue);
    };

    let plan = match StatusMachine::plan(bill, event, now) {
        Ok(plan) => plan,
        Err(reason) => {
            debug!("Time rules skipped bill {}: {}", bill.id, reason);
            return Ok(DueTransition::NotDue);
        }
    };

    Ok(match store.apply_transition(&plan).await? {
        Some(updated) => DueTransition::Applied { event, bill: updated },
        None => DueTransition::Stale,
    })
}

/// What one sweep run did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub cancelled: Vec<Uuid>,
    pub completed: Vec<Uuid>,
    /// Bills that moved on between the read and the guarded write
    pub stale: usize,
    pub failed: usize,
}

pub struct SweepScheduler {
    store: Arc<dyn BookingStore>,
    policy: PolicyEngine,
    metrics: EngineMetrics,
    running: Mutex<()>,
}

impl SweepScheduler {
    pub fn new(store: Arc<dyn BookingStore>, policy: PolicyEngine, metrics: EngineMetrics) -> Self {
        Self {
            store,
            policy,
            metrics,
            running: Mutex::new(()),
        }
    }

    /// Run one sweep at `now`. Returns `None` if a sweep is already running
    /// in this process.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Option<SweepReport>, StoreError> {
        let Ok(_guard) = self.running.try_lock() else {
            self.metrics.record_sweep_skipped();
            warn!("Previous sweep still running, skipping this one");
            return Ok(None);
        };

        let timer = self.metrics.start_sweep();
        let mut report = SweepReport::default();

        for bill in self.store.list_active_bills().await? {
            match apply_due_transition(self.store.as_ref(), &self.policy, &bill, now).await {
                Ok(DueTransition::NotDue) => {}
                Ok(DueTransition::Applied { event, bill: updated }) => {
                    info!("Sweep applied {} to bill {} ({})", event, updated.id, updated.payment_status);
                    match event {
                        BillEvent::AutoCancel => report.cancelled.push(updated.id),
                        _ => report.completed.push(updated.id),
                    }
                }
                Ok(DueTransition::Stale) => {
                    debug!("Bill {} changed during the sweep, left as is", bill.id);
                    report.stale += 1;
                }
                Err(e) => {
                    // One bad bill must not stop the rest; it is retried next run
                    if e.is_retryable() {
                        warn!("Sweep could not update bill {}: {}", bill.id, e);
                    } else {
                        error!("Sweep could not update bill {}: {}", bill.id, e);
                    }
                    report.failed += 1;
                }
            }
        }

        timer.finish(report.cancelled.len() as u64, report.completed.len() as u64);
        if !report.cancelled.is_empty() || !report.completed.is_empty() || report.failed > 0 {
            info!(
                "Sweep finished: {} cancelled, {} completed, {} stale, {} failed",
                report.cancelled.len(),
                report.completed.len(),
                report.stale,
                report.failed
            );
        }
        Ok(Some(report))
    }

    /// Sweep immediately, then every `interval` until `shutdown` flips
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Sweep scheduler started, interval {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!("Sweep run failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Sweep scheduler stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::{BillState, NewBill, PaymentMethod, PaymentStatus, VisitStatus};
    use crate::config::PolicyConfig;
    use crate::store::MemoryStore;
    use crate::tables::TableState;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn scheduler(store: Arc<MemoryStore>) -> (SweepScheduler, EngineMetrics) {
        let metrics = EngineMetrics::new();
        let sweep = SweepScheduler::new(store, PolicyEngine::new(PolicyConfig::default()), metrics.clone());
        (sweep, metrics)
    }

    async fn bill(store: &MemoryStore, time: DateTime<Utc>, status: PaymentStatus, table: i32) -> Bill {
        store
            .create_bill(NewBill {
                id: Uuid::new_v4(),
                user_id: 3,
                name: "Dang Thi G".to_string(),
                phone: "0934567890".to_string(),
                time,
                num_people: 2,
                note: None,
                price: dec!(0),
                total_amount: dec!(0),
                deposit_amount: dec!(100000),
                payment_status: status,
                payment_method: PaymentMethod::Vnpay,
                payment_id: None,
                table_ids: vec![table],
                cart_lines: Vec::new(),
                created_at: time - ChronoDuration::days(1),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_overdue_unpaid_bill_is_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let (sweep, metrics) = scheduler(store.clone());
        let now = Utc::now();
        let overdue = bill(&store, now - ChronoDuration::minutes(20), PaymentStatus::Pending, 1).await;
        let paid = bill(&store, now - ChronoDuration::minutes(20), PaymentStatus::FullyPaid, 2).await;

        let report = sweep.sweep_once(now).await.unwrap().unwrap();

        assert_eq!(report.cancelled, vec![overdue.id]);
        let cancelled = store.find_bill(overdue.id).await.unwrap().unwrap();
        assert_eq!(cancelled.phase(), (BillState::Cancelled, VisitStatus::UnVisited));
        assert_eq!(store.find_tables(&[1]).await.unwrap()[0].state, TableState::Empty);

        // Paid in full: kept for the customer even when late
        let kept = store.find_bill(paid.id).await.unwrap().unwrap();
        assert_eq!(kept.state, BillState::InOrder);
        assert_eq!(metrics.snapshot().auto_cancelled, 1);
    }

    #[tokio::test]
    async fn test_long_visit_is_completed() {
        let store = Arc::new(MemoryStore::new());
        let (sweep, metrics) = scheduler(store.clone());
        let now = Utc::now();
        let seated = bill(&store, now - ChronoDuration::minutes(50), PaymentStatus::DepositPaid, 3).await;

        let arrival = StatusMachine::plan(&seated, BillEvent::ConfirmArrival, now - ChronoDuration::minutes(45)).unwrap();
        store.apply_transition(&arrival).await.unwrap().unwrap();
        assert_eq!(store.find_tables(&[3]).await.unwrap()[0].state, TableState::Occupied);

        let report = sweep.sweep_once(now).await.unwrap().unwrap();

        assert_eq!(report.completed, vec![seated.id]);
        let completed = store.find_bill(seated.id).await.unwrap().unwrap();
        assert_eq!(completed.state, BillState::Completed);
        assert_eq!(store.find_tables(&[3]).await.unwrap()[0].state, TableState::Empty);
        assert_eq!(metrics.snapshot().auto_completed, 1);
    }

    #[tokio::test]
    async fn test_second_sweep_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (sweep, _) = scheduler(store.clone());
        let now = Utc::now();
        bill(&store, now - ChronoDuration::minutes(30), PaymentStatus::DepositPaid, 4).await;

        let first = sweep.sweep_once(now).await.unwrap().unwrap();
        let second = sweep.sweep_once(now).await.unwrap().unwrap();
        assert_eq!(first.cancelled.len(), 1);
        assert_eq!(second, SweepReport::default());
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (sweep, metrics) = scheduler(store.clone());

        let _held = sweep.running.lock().await;
        assert!(sweep.sweep_once(Utc::now()).await.unwrap().is_none());
        assert_eq!(metrics.snapshot().sweeps_skipped, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (sweep, metrics) = scheduler(store);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(sweep).run(Duration::from_secs(3600), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // The first tick fires immediately
        assert_eq!(metrics.snapshot().sweep_runs, 1);
    }
}
