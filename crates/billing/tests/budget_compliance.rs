use meridian_billing::error::BudgetError;
use meridian_billing::{BudgetEnforcer, BudgetLimit};
use meridian_core::MicroUsd;
use surrealdb::engine::any::connect;

async fn setup_enforcer() -> BudgetEnforcer {
    let db = connect("mem://").await.expect("Failed to connect to memory db");
    db.use_ns("meridian")
        .use_db("budget")
        .await
        .expect("Failed to select namespace");
    BudgetEnforcer::new(db)
}

#[tokio::test]
async fn test_record_cost_increments_exactly() {
    let enforcer = setup_enforcer().await;
    enforcer.set_limit("tenant:u1", BudgetLimit::new(MicroUsd::new(10_000)));

    enforcer
        .record_cost("tenant:u1", MicroUsd::new(2_500))
        .await
        .expect("record failed");
    enforcer
        .record_cost("tenant:u1", MicroUsd::new(1_500))
        .await
        .expect("record failed");

    let snapshot = enforcer.budget_snapshot("tenant:u1");
    assert_eq!(snapshot.spent, MicroUsd::new(4_000));
    assert!(!enforcer.is_exceeded("tenant:u1").await);
}

#[tokio::test]
async fn test_negative_delta_refused() {
    let enforcer = setup_enforcer().await;
    let result = enforcer.record_cost("tenant:u1", MicroUsd::new(-5)).await;
    assert!(matches!(result, Err(BudgetError::NegativeDelta(-5))));
    assert_eq!(
        enforcer.budget_snapshot("tenant:u1").spent,
        MicroUsd::ZERO
    );
}

#[tokio::test]
async fn test_exceeded_at_limit() {
    let enforcer = setup_enforcer().await;
    enforcer.set_limit("tenant:u1", BudgetLimit::new(MicroUsd::new(1_000)));

    enforcer
        .record_cost("tenant:u1", MicroUsd::new(999))
        .await
        .unwrap();
    assert!(!enforcer.is_exceeded("tenant:u1").await);

    enforcer
        .record_cost("tenant:u1", MicroUsd::new(1))
        .await
        .unwrap();
    assert!(enforcer.is_exceeded("tenant:u1").await);
}

#[tokio::test]
async fn test_unlimited_scope_never_exceeded() {
    let enforcer = setup_enforcer().await;
    enforcer
        .record_cost("tenant:free", MicroUsd::new(1_000_000))
        .await
        .unwrap();
    assert!(!enforcer.is_exceeded("tenant:free").await);
    assert!(!enforcer.is_warning("tenant:free"));
}

#[tokio::test]
async fn test_warning_is_advisory_and_early() {
    let enforcer = setup_enforcer().await;
    enforcer.set_limit("tenant:u1", BudgetLimit::new(MicroUsd::new(10_000)));

    enforcer
        .record_cost("tenant:u1", MicroUsd::new(7_999))
        .await
        .unwrap();
    assert!(!enforcer.is_warning("tenant:u1"));

    enforcer
        .record_cost("tenant:u1", MicroUsd::new(1))
        .await
        .unwrap();
    assert!(enforcer.is_warning("tenant:u1"));
    // Warning does not mean exceeded.
    assert!(!enforcer.is_exceeded("tenant:u1").await);
}

#[tokio::test]
async fn test_no_drift_when_mirror_tracks_store() {
    let enforcer = setup_enforcer().await;
    enforcer.set_limit("tenant:u1", BudgetLimit::new(MicroUsd::new(10_000)));
    enforcer
        .record_cost("tenant:u1", MicroUsd::new(5_000))
        .await
        .unwrap();

    let alerts = enforcer.reconcile_drift().await;
    assert!(alerts.is_empty(), "mirror and store should agree: {:?}", alerts);
}
