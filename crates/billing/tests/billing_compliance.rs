use meridian_billing::error::BillingError;
use meridian_billing::{BillingMachine, BillingState};
use meridian_core::{AccountId, AccountKey, CorrelationId, MicroUsd};
use meridian_ledger::Ledger;
use rust_decimal_macros::dec;
use std::sync::Arc;
use surrealdb::engine::any::connect;

async fn setup_machine() -> BillingMachine {
    let db = connect("mem://").await.expect("Failed to connect to memory db");
    db.use_ns("meridian")
        .use_db("billing")
        .await
        .expect("Failed to select namespace");
    let ledger = Arc::new(Ledger::open(db.clone()).await.expect("Failed to open ledger"));
    BillingMachine::new(db, ledger)
}

fn user() -> AccountId {
    AccountId::new("u1").unwrap()
}

#[tokio::test]
async fn test_happy_path_reserve_commit_finalize() {
    let machine = setup_machine().await;
    let u1 = user();
    let ledger = machine.ledger();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(3_000), CorrelationId::random(), dec!(1.0))
        .await
        .expect("reserve failed");
    assert_eq!(entry.state, BillingState::ReserveHeld);
    assert_eq!(entry.actual_cost, None);

    let entry = machine
        .commit(&entry.billing_entry_id, MicroUsd::new(2_500), None)
        .await
        .expect("commit failed");
    assert_eq!(entry.state, BillingState::FinalizePending);
    assert_eq!(entry.actual_cost, Some(MicroUsd::new(2_500)));

    // Balances after mint 10_000, reserve 3_000, commit 2_500.
    assert_eq!(
        ledger.derive_balance(&AccountKey::available(&u1)),
        MicroUsd::new(7_500)
    );
    assert_eq!(ledger.derive_balance(&AccountKey::held(&u1)), MicroUsd::ZERO);

    let entry = machine
        .mark_finalize_acked(&entry.billing_entry_id)
        .await
        .expect("ack failed");
    assert_eq!(entry.state, BillingState::FinalizeAcked);

    // WAL: mint, reserve, commit, finalize_acked, all checksums intact.
    let wal = ledger.wal().replay().await.unwrap();
    let events: Vec<&str> = wal.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(events, vec!["mint", "reserve", "commit", "finalize_acked"]);
    for envelope in &wal {
        envelope.verify().expect("CRC must recompute");
    }
}

#[tokio::test]
async fn test_pre_stream_failure_release() {
    let machine = setup_machine().await;
    let u1 = user();
    let ledger = machine.ledger();

    machine.mint(&u1, MicroUsd::new(5_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(500), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();

    let entry = machine
        .release(&entry.billing_entry_id, "pre_stream_failure")
        .await
        .expect("release failed");
    assert_eq!(entry.state, BillingState::Released);
    assert_eq!(entry.release_reason.as_deref(), Some("pre_stream_failure"));

    assert_eq!(
        ledger.derive_balance(&AccountKey::available(&u1)),
        MicroUsd::new(5_000)
    );
    assert_eq!(ledger.derive_balance(&AccountKey::held(&u1)), MicroUsd::ZERO);

    // Committing a released entry names both states in the error.
    let result = machine
        .commit(&entry.billing_entry_id, MicroUsd::new(100), None)
        .await;
    match result {
        Err(BillingError::InvalidTransition { current, attempted, .. }) => {
            assert_eq!(current, BillingState::Released);
            assert_eq!(attempted, BillingState::FinalizePending);
        }
        other => panic!("Expected invalid transition, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_reserve_needs_funds() {
    let machine = setup_machine().await;
    let u1 = user();

    machine.mint(&u1, MicroUsd::new(100)).await.unwrap();
    let result = machine
        .reserve(&u1, MicroUsd::new(500), CorrelationId::random(), dec!(1.0))
        .await;
    match result {
        Err(BillingError::InsufficientFunds {
            available,
            requested,
            ..
        }) => {
            assert_eq!(available, 100);
            assert_eq!(requested, 500);
        }
        other => panic!("Expected insufficient funds, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_exchange_rate_is_frozen() {
    let machine = setup_machine().await;
    let u1 = user();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.25))
        .await
        .unwrap();

    // Same rate passes.
    let committed = machine
        .commit(&entry.billing_entry_id, MicroUsd::new(800), Some(dec!(1.25)))
        .await
        .unwrap();
    assert_eq!(committed.exchange_rate_snapshot, dec!(1.25));

    // A different rate on a fresh entry is rejected before any posting.
    let entry2 = machine
        .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.25))
        .await
        .unwrap();
    let result = machine
        .commit(&entry2.billing_entry_id, MicroUsd::new(800), Some(dec!(1.30)))
        .await;
    assert!(matches!(
        result,
        Err(BillingError::ExchangeRateFrozen { .. })
    ));
    let unchanged = machine.get(&entry2.billing_entry_id).await.unwrap().unwrap();
    assert_eq!(unchanged.state, BillingState::ReserveHeld);
    assert_eq!(unchanged.exchange_rate_snapshot, dec!(1.25));
}

#[tokio::test]
async fn test_manual_finalize_after_failure() {
    let machine = setup_machine().await;
    let u1 = user();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();
    machine
        .commit(&entry.billing_entry_id, MicroUsd::new(900), None)
        .await
        .unwrap();

    let entry = machine
        .mark_finalize_failed(&entry.billing_entry_id)
        .await
        .unwrap();
    assert_eq!(entry.state, BillingState::FinalizeFailed);

    let entry = machine
        .manual_finalize(&entry.billing_entry_id)
        .await
        .unwrap();
    assert_eq!(entry.state, BillingState::FinalizeAcked);
}

#[tokio::test]
async fn test_manual_finalize_requires_failed_state() {
    let machine = setup_machine().await;
    let u1 = user();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();

    // Held entries cannot be manually finalized.
    assert!(machine
        .manual_finalize(&entry.billing_entry_id)
        .await
        .is_err());
}

#[tokio::test]
async fn test_operator_void_reverses_commit() {
    let machine = setup_machine().await;
    let u1 = user();
    let ledger = machine.ledger();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();
    machine
        .commit(&entry.billing_entry_id, MicroUsd::new(1_000), None)
        .await
        .unwrap();
    machine
        .mark_finalize_failed(&entry.billing_entry_id)
        .await
        .unwrap();

    let entry = machine
        .operator_void(&entry.billing_entry_id, "irrecoverable")
        .await
        .unwrap();
    assert_eq!(entry.state, BillingState::Voided);

    // Void hands the actual back to the user.
    assert_eq!(
        ledger.derive_balance(&AccountKey::available(&u1)),
        MicroUsd::new(10_000)
    );
}

#[tokio::test]
async fn test_terminal_states_reject_everything() {
    let machine = setup_machine().await;
    let u1 = user();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();
    machine
        .release(&entry.billing_entry_id, "user_cancel")
        .await
        .unwrap();

    assert!(machine
        .release(&entry.billing_entry_id, "again")
        .await
        .is_err());
    assert!(machine
        .commit(&entry.billing_entry_id, MicroUsd::new(1), None)
        .await
        .is_err());
    assert!(machine
        .record_finalize_attempt(&entry.billing_entry_id)
        .await
        .is_err());
}

#[tokio::test]
async fn test_expired_reserves_reconciled() {
    let machine = setup_machine().await;
    let u1 = user();
    let ledger = machine.ledger();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    let entry = machine
        .reserve(&u1, MicroUsd::new(2_000), CorrelationId::random(), dec!(1.0))
        .await
        .unwrap();

    // Zero max age: everything held is expired.
    let released = machine
        .reconcile_expired_reserves(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(released, vec![entry.billing_entry_id.clone()]);

    let entry = machine.get(&entry.billing_entry_id).await.unwrap().unwrap();
    assert_eq!(entry.state, BillingState::Released);
    assert_eq!(entry.release_reason.as_deref(), Some("reserve_expired"));
    assert_eq!(
        ledger.derive_balance(&AccountKey::available(&u1)),
        MicroUsd::new(10_000)
    );
}

#[tokio::test]
async fn test_pending_reconciliation_count() {
    let machine = setup_machine().await;
    let u1 = user();

    machine.mint(&u1, MicroUsd::new(10_000)).await.unwrap();
    for _ in 0..3 {
        let entry = machine
            .reserve(&u1, MicroUsd::new(1_000), CorrelationId::random(), dec!(1.0))
            .await
            .unwrap();
        machine
            .commit(&entry.billing_entry_id, MicroUsd::new(500), None)
            .await
            .unwrap();
    }
    assert_eq!(machine.pending_reconciliation_count().await.unwrap(), 3);
}
