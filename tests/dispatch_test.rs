mod common;

use assert_matches::assert_matches;
use chrono::{Duration, TimeZone, Utc};
use common::TestApp;
use saylogix::entities::{
    ExceptionCategory, ManifestStatus, ManifestTrigger, MemberState, OrderStatus,
};
use saylogix::errors::ServiceError;
use saylogix::events::payloads::DispatchExceptionType;
use saylogix::events::EventCode;
use saylogix::services::dispatch::{is_past_cutoff, manifest_number, ScanOutcome};

async fn staged_orders(app: &TestApp, count: usize) -> Vec<saylogix::entities::Order> {
    let mut orders = Vec::with_capacity(count);
    for i in 0..count {
        orders.push(app.staged_order(&format!("SALLA-5{:03}", i)).await);
    }
    orders
}

fn at_cutoff(app: &TestApp) {
    // 17:00 in Riyadh.
    app.clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap());
}

#[tokio::test]
async fn tenth_staged_order_triggers_the_manifest() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 20).await;

    let first_nine = staged_orders(&app, 9).await;
    assert!(first_nine
        .iter()
        .all(|o| o.status == OrderStatus::StagedForDispatch && o.manifest_id.is_none()));
    assert!(app.system.dispatch.manifests_for("aramex").await.unwrap().is_empty());
    assert_eq!(app.system.dispatch.unmanifested_orders("aramex").await.unwrap().len(), 9);

    let tenth = app.staged_order("SALLA-5999").await;

    let manifests = app.system.dispatch.manifests_for("aramex").await.unwrap();
    assert_eq!(manifests.len(), 1);
    let manifest = &manifests[0];
    assert_eq!(manifest.members.len(), 10);
    assert_eq!(manifest.trigger, ManifestTrigger::BatchSize);
    assert_eq!(manifest.status, ManifestStatus::Open);
    assert_eq!(manifest.manifest_number, "MNF-ARAMEX-20260310-001");
    assert_eq!(tenth.manifest_id, Some(manifest.id));
    assert!(app.system.dispatch.unmanifested_orders("aramex").await.unwrap().is_empty());
    assert_eq!(app.count_events(EventCode::ManifestGenerated).await, 1);
}

#[tokio::test]
async fn cutoff_sweep_manifests_partial_batches() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    staged_orders(&app, 3).await;

    assert!(app.system.dispatch.run_cutoff_sweep().await.unwrap().is_empty());

    at_cutoff(&app);
    let generated = app.system.dispatch.run_cutoff_sweep().await.unwrap();
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].trigger, ManifestTrigger::Cutoff);
    assert_eq!(generated[0].members.len(), 3);

    // A second sweep finds nothing left to claim.
    assert!(app.system.dispatch.run_cutoff_sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn staging_after_cutoff_manifests_immediately() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    at_cutoff(&app);

    let order = app.staged_order("SALLA-5100").await;

    assert!(order.manifest_id.is_some());
    let manifest = app
        .system
        .dispatch
        .get_manifest(order.manifest_id.unwrap())
        .await
        .unwrap();
    assert_eq!(manifest.trigger, ManifestTrigger::Cutoff);
}

#[tokio::test]
async fn orders_staged_after_cutoff_share_the_days_open_manifest() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    at_cutoff(&app);

    let orders = staged_orders(&app, 3).await;

    let manifests = app.system.dispatch.manifests_for("aramex").await.unwrap();
    assert_eq!(manifests.len(), 1);
    let manifest = &manifests[0];
    assert_eq!(manifest.manifest_number, "MNF-ARAMEX-20260310-001");
    assert_eq!(manifest.members.len(), 3);
    for order in &orders {
        assert_eq!(app.order(order.id).await.manifest_id, Some(manifest.id));
    }
    assert_eq!(app.count_events(EventCode::ManifestGenerated).await, 1);
    assert_eq!(app.count_events(EventCode::ManifestMembersAdded).await, 2);

    // Once the courier has taken the manifest, later orders start the next one.
    for order in &orders {
        app.system
            .dispatch
            .scan_package(manifest.id, order.tracking_number().unwrap())
            .await
            .unwrap();
    }
    let late = app.staged_order("SALLA-5300").await;

    let next = app
        .system
        .dispatch
        .get_manifest(late.manifest_id.unwrap())
        .await
        .unwrap();
    assert_eq!(next.manifest_number, "MNF-ARAMEX-20260310-002");
    assert_eq!(next.members.len(), 1);
    assert_eq!(app.system.dispatch.manifests_for("aramex").await.unwrap().len(), 2);
}

#[tokio::test]
async fn scanning_every_package_dispatches_the_manifest() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let orders = staged_orders(&app, 2).await;
    at_cutoff(&app);
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);
    let dispatch = &app.system.dispatch;

    let first = orders[0].tracking_number().unwrap().to_string();
    assert!(first.starts_with("ARA"));
    let outcome = dispatch.scan_package(manifest.id, &first).await.unwrap();
    assert_eq!(outcome, ScanOutcome::Scanned { order_id: orders[0].id, remaining: 1 });
    let again = dispatch.scan_package(manifest.id, &first.to_lowercase()).await.unwrap();
    assert_eq!(again, ScanOutcome::AlreadyScanned { order_id: orders[0].id });
    assert_eq!(app.order(orders[0].id).await.status, OrderStatus::StagedForDispatch);

    // The internal order number identifies a package too.
    let last = dispatch
        .scan_package(manifest.id, &orders[1].saylogix_number)
        .await
        .unwrap();
    assert_matches!(last, ScanOutcome::Dispatched { order_ids } if order_ids.len() == 2);

    let manifest = dispatch.get_manifest(manifest.id).await.unwrap();
    assert_eq!(manifest.status, ManifestStatus::Dispatched);
    assert!(manifest.confirmed_at.is_some());
    assert!(manifest.members.iter().all(|m| m.state == MemberState::Dispatched));
    for order in &orders {
        let order = app.order(order.id).await;
        assert_eq!(order.status, OrderStatus::Dispatched);
        assert!(order.checkpoints.dispatched.is_some());
        assert_eq!(app.count_events_for(order.id, EventCode::TrackingLinkSent).await, 1);
    }
    let stock = app.stock("SKU-1").await;
    assert_eq!((stock.available_quantity, stock.reserved_quantity), (8, 0));
    let link = app.messaging.messages_to(&orders[0].customer.phone);
    assert!(link.iter().any(|m| m.body.contains(&first)));

    // A dispatched manifest never reopens.
    let err = dispatch.scan_package(manifest.id, &first).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
}

#[tokio::test]
async fn unknown_code_raises_scan_mismatch_and_alerts_supervisor() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    staged_orders(&app, 1).await;
    at_cutoff(&app);
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);

    let outcome = app
        .system
        .dispatch
        .scan_package(manifest.id, "SMS99999999")
        .await
        .unwrap();

    assert_eq!(outcome, ScanOutcome::Mismatch);
    assert_eq!(app.count_events(EventCode::ManifestScanMismatch).await, 1);
    assert_eq!(app.count_events(EventCode::DispatchExceptionRaised).await, 1);
    assert_eq!(app.count_events(EventCode::SupervisorNotified).await, 1);
    let alerts = app.messaging.messages_to("+966500000000");
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].body.contains("scan_mismatch"));
    let manifest = app.system.dispatch.get_manifest(manifest.id).await.unwrap();
    assert_eq!(manifest.status, ManifestStatus::Open);
}

#[tokio::test]
async fn held_package_needs_supervisor_override_before_rescan() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let orders = staged_orders(&app, 2).await;
    at_cutoff(&app);
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);
    let dispatch = &app.system.dispatch;
    let damaged = &orders[1];

    dispatch
        .raise_dispatch_exception(
            Some(manifest.id),
            Some(damaged.id),
            DispatchExceptionType::DamagedPackage,
            "box crushed on the dock",
        )
        .await
        .unwrap();
    let parked = app.order(damaged.id).await;
    assert_eq!(parked.status, OrderStatus::Exception);
    assert_eq!(parked.exception_category(), Some(ExceptionCategory::Dispatch));

    let held = dispatch
        .scan_package(manifest.id, damaged.tracking_number().unwrap())
        .await
        .unwrap_err();
    assert_matches!(held, ServiceError::InvalidOperation(_));
    // The sibling is unaffected.
    dispatch
        .scan_package(manifest.id, orders[0].tracking_number().unwrap())
        .await
        .unwrap();
    assert_eq!(
        dispatch.get_manifest(manifest.id).await.unwrap().status,
        ManifestStatus::Open
    );

    let not_parked = dispatch
        .supervisor_override(orders[0].id, "supervisor-1", "n/a")
        .await
        .unwrap_err();
    assert_matches!(not_parked, ServiceError::InvalidStatus(_));

    let resumed = dispatch
        .supervisor_override(damaged.id, "supervisor-1", "repacked")
        .await
        .unwrap();
    assert_eq!(resumed.status, OrderStatus::StagedForDispatch);
    let member_state = dispatch
        .get_manifest(manifest.id)
        .await
        .unwrap()
        .members
        .iter()
        .find(|m| m.order_id == damaged.id)
        .map(|m| m.state);
    assert_eq!(member_state, Some(MemberState::Staged));

    let outcome = dispatch
        .scan_package(manifest.id, damaged.tracking_number().unwrap())
        .await
        .unwrap();
    assert_matches!(outcome, ScanOutcome::Dispatched { .. });
    assert_eq!(app.order(damaged.id).await.status, OrderStatus::Dispatched);
}

#[tokio::test]
async fn member_states_only_move_forward() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let orders = staged_orders(&app, 3).await;
    at_cutoff(&app);
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);
    let rank = |state: MemberState| match state {
        MemberState::Staged | MemberState::Held => 0,
        MemberState::Scanned => 1,
        MemberState::Dispatched => 2,
    };

    let mut previous: Vec<u8> = vec![0; 3];
    for order in orders.iter().chain(orders.iter()) {
        app.system
            .dispatch
            .scan_package(manifest.id, order.tracking_number().unwrap())
            .await
            .ok();
        let current: Vec<u8> = app
            .system
            .dispatch
            .get_manifest(manifest.id)
            .await
            .unwrap()
            .members
            .iter()
            .map(|m| rank(m.state))
            .collect();
        assert!(current.iter().zip(&previous).all(|(now, before)| now >= before));
        previous = current;
    }
    assert_eq!(previous, vec![2, 2, 2]);
}

#[tokio::test]
async fn cancelled_member_leaves_the_manifest() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let orders = staged_orders(&app, 2).await;
    at_cutoff(&app);
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);
    app.system
        .dispatch
        .scan_package(manifest.id, orders[0].tracking_number().unwrap())
        .await
        .unwrap();

    app.system
        .orders
        .cancel_order(orders[1].id, "customer changed mind")
        .await
        .unwrap();

    let manifest = app.system.dispatch.get_manifest(manifest.id).await.unwrap();
    assert_eq!(manifest.members.len(), 1);
    assert_eq!(manifest.status, ManifestStatus::Dispatched);
    assert_eq!(app.order(orders[0].id).await.status, OrderStatus::Dispatched);
    assert_eq!(app.order(orders[1].id).await.status, OrderStatus::Cancelled);
    let stock = app.stock("SKU-1").await;
    assert_eq!((stock.available_quantity, stock.reserved_quantity), (9, 0));
}

#[test]
fn cutoff_is_evaluated_in_warehouse_local_time() {
    let config = saylogix::config::DispatchConfig::default();
    let before = Utc.with_ymd_and_hms(2026, 3, 10, 13, 59, 0).unwrap();

    assert!(!is_past_cutoff(before, &config));
    assert!(is_past_cutoff(before + Duration::minutes(1), &config));
    assert_eq!(
        manifest_number("smsa", Utc.with_ymd_and_hms(2026, 3, 10, 22, 30, 0).unwrap(), 3, 7),
        "MNF-SMSA-20260311-007"
    );
}
