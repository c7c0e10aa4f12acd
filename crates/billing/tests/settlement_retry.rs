use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use meridian_billing::settlement::{ReplayWorker, SettlementApi, SettlementFailure, SettlementRequest};
use meridian_billing::{BillingMachine, BillingState, CircuitBreaker};
use meridian_core::{AccountId, CorrelationId, MicroUsd};
use meridian_dlq::{DlqConfig, DlqStore};
use meridian_ledger::Ledger;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use surrealdb::engine::any::connect;

/// Scripted settlement endpoint: pops one outcome per call.
struct ScriptedSettlement {
    outcomes: Mutex<VecDeque<Result<(), SettlementFailure>>>,
    calls: Mutex<u32>,
}

impl ScriptedSettlement {
    fn new(outcomes: Vec<Result<(), SettlementFailure>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(0),
        }
    }

    fn failing(reason: &str, status: u16) -> Result<(), SettlementFailure> {
        Err(SettlementFailure {
            reason: reason.to_string(),
            response_status: Some(status),
        })
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl SettlementApi for ScriptedSettlement {
    async fn settle(&self, _request: &SettlementRequest) -> Result<(), SettlementFailure> {
        *self.calls.lock() += 1;
        self.outcomes.lock().pop_front().unwrap_or_else(|| {
            Err(SettlementFailure {
                reason: "script exhausted".to_string(),
                response_status: None,
            })
        })
    }
}

struct Harness {
    machine: Arc<BillingMachine>,
    dlq: Arc<DlqStore>,
    worker: ReplayWorker,
    api: Arc<ScriptedSettlement>,
}

async fn setup(outcomes: Vec<Result<(), SettlementFailure>>) -> Harness {
    let db = connect("mem://").await.unwrap();
    db.use_ns("meridian").use_db("settlement").await.unwrap();

    let ledger = Arc::new(Ledger::open(db.clone()).await.unwrap());
    let machine = Arc::new(BillingMachine::new(db.clone(), ledger));
    let config = DlqConfig {
        max_retries: 5,
        retry_interval: ChronoDuration::milliseconds(1),
        ..DlqConfig::default()
    };
    let dlq = Arc::new(DlqStore::new(db, "mem://", config));
    let api = Arc::new(ScriptedSettlement::new(outcomes));
    // Wide-open breaker so the script drives the outcome.
    let breaker = Arc::new(CircuitBreaker::new().with_thresholds(
        100,
        Duration::from_secs(30),
        Duration::from_millis(10),
    ));
    let worker = ReplayWorker::new(
        Arc::clone(&machine),
        Arc::clone(&dlq),
        api.clone() as Arc<dyn SettlementApi>,
        breaker,
    );
    Harness {
        machine,
        dlq,
        worker,
        api,
    }
}

/// Reserve + commit one entry and park its settlement in the DLQ.
async fn park_entry(harness: &Harness) -> SettlementRequest {
    let u1 = AccountId::new("u1").unwrap();
    harness.machine.mint(&u1, MicroUsd::new(100_000)).await.unwrap();
    let entry = harness
        .machine
        .reserve(&u1, MicroUsd::new(3_000), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();
    harness
        .machine
        .commit(&entry.billing_entry_id, MicroUsd::new(2_500), None)
        .await
        .unwrap();

    let request = SettlementRequest {
        reservation_id: entry.billing_entry_id,
        actual_cost_micro: MicroUsd::new(2_500),
        account_id: Some(u1),
        identity_anchor: None,
        ensemble_id: None,
    };
    harness
        .worker
        .enqueue_failure(
            &request,
            &SettlementFailure {
                reason: "http 503".to_string(),
                response_status: Some(503),
            },
        )
        .await
        .unwrap();
    request
}

#[tokio::test]
async fn test_replay_success_acks_entry() {
    let harness = setup(vec![Ok(())]).await;
    let request = park_entry(&harness).await;

    let later = Utc::now() + ChronoDuration::minutes(1);
    let stats = harness.worker.run_once(later).await.unwrap();
    assert_eq!(stats.acked, 1);

    let entry = harness
        .machine
        .get(&request.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, BillingState::FinalizeAcked);
    assert!(harness.dlq.get(&request.reservation_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retries_exhausted_then_manual_finalize() {
    // Every replay attempt fails.
    let harness = setup(vec![
        ScriptedSettlement::failing("http 503", 503),
        ScriptedSettlement::failing("http 503", 503),
        ScriptedSettlement::failing("http 503", 503),
        ScriptedSettlement::failing("http 503", 503),
        ScriptedSettlement::failing("http 503", 503),
    ])
    .await;
    let request = park_entry(&harness).await;
    let rid = &request.reservation_id;

    // Drain until the entry leaves the queue: attempt 1 was the original
    // failure, attempts 2..=5 happen on replay.
    let mut now = Utc::now() + ChronoDuration::minutes(1);
    for _ in 0..6 {
        harness.worker.run_once(now).await.unwrap();
        now = now + ChronoDuration::minutes(30);
    }
    assert_eq!(harness.api.call_count(), 4);

    let entry = harness.machine.get(rid).await.unwrap().unwrap();
    assert_eq!(entry.state, BillingState::FinalizeFailed);
    assert!(entry.finalize_attempts >= 4);

    // Payload moved to the terminal keyspace.
    assert!(harness.dlq.get(rid).await.unwrap().is_none());
    let terminal = harness.dlq.terminal_records().await.unwrap();
    assert_eq!(terminal.len(), 1);
    assert_eq!(&terminal[0].entry.reservation_id, rid);

    // Operator closes it out by hand.
    let entry = harness.machine.manual_finalize(rid).await.unwrap();
    assert_eq!(entry.state, BillingState::FinalizeAcked);
}

#[tokio::test]
async fn test_replay_failure_keeps_entry_pending() {
    let harness = setup(vec![ScriptedSettlement::failing("http 500", 500)]).await;
    let request = park_entry(&harness).await;

    let later = Utc::now() + ChronoDuration::minutes(1);
    let stats = harness.worker.run_once(later).await.unwrap();
    assert_eq!(stats.retried, 1);

    let entry = harness
        .machine
        .get(&request.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, BillingState::FinalizePending);

    let dlq_entry = harness
        .dlq
        .get(&request.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dlq_entry.attempt_count, 2);
}

#[tokio::test]
async fn test_stale_entry_dropped_from_queue() {
    let harness = setup(vec![Ok(())]).await;
    let request = park_entry(&harness).await;

    // Operator acks out of band before the worker gets to it.
    harness
        .machine
        .mark_finalize_acked(&request.reservation_id)
        .await
        .unwrap();

    let later = Utc::now() + ChronoDuration::minutes(1);
    let stats = harness.worker.run_once(later).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(harness.api.call_count(), 0);
    assert!(harness.dlq.get(&request.reservation_id).await.unwrap().is_none());
}
