mod common;

use assert_matches::assert_matches;
use std::sync::Arc;

use common::{FlakyInventoryStore, OrderBuilder, TestApp};
use saylogix::config::AppConfig;
use saylogix::entities::{
    BinLocation, ExceptionCategory, GoodsReceipt, OrderStatus, SkuQuantity, TaskStatus,
};
use saylogix::errors::ServiceError;
use saylogix::events::EventCode;
use saylogix::services::warehouse::PurchaseOrder;

async fn released_order(app: &TestApp, channel_ref: &str, lines: &[(&str, u32)]) -> uuid::Uuid {
    app.register_code("RRRD2929", "Riyadh");
    let mut builder = OrderBuilder::new(channel_ref).short_code("RRRD2929");
    for (sku, quantity) in lines {
        builder = builder.item(sku, *quantity);
    }
    app.ingest(builder.build()).await.id
}

#[tokio::test]
async fn picking_completes_only_when_every_line_is_scanned_in_full() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-A", 10).await;
    app.seed_sku("SKU-B", 10).await;
    let order_id = released_order(&app, "SALLA-4001", &[("SKU-A", 3), ("SKU-B", 5)]).await;
    let warehouse = &app.system.warehouse;
    let task = warehouse.picking_task_for(order_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    warehouse.scan_pick(task.id, "SKU-A", 3).await.unwrap();
    let task = warehouse.scan_pick(task.id, "SKU-B", 4).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(app.order(order_id).await.status, OrderStatus::Picking);
    let err = warehouse.complete_picking(task.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(msg) if msg.contains("SKU-B"));

    let task = warehouse.scan_pick(task.id, "SKU-B", 1).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let order = app.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Packing);
    assert!(order.checkpoints.picked.is_some());
    let pack = warehouse.packing_task_for(order_id).await.unwrap().unwrap();
    assert_eq!(pack.lines.len(), 2);
    assert_eq!(app.count_events_for(order_id, EventCode::PickTaskCompleted).await, 1);
}

#[tokio::test]
async fn scans_outside_the_task_are_rejected() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let order_id = released_order(&app, "SALLA-4002", &[("SKU-1", 1)]).await;
    let warehouse = &app.system.warehouse;
    let task = warehouse.picking_task_for(order_id).await.unwrap().unwrap();

    let unknown = warehouse.scan_pick(task.id, "SKU-9", 1).await.unwrap_err();
    assert_matches!(unknown, ServiceError::ValidationError(_));
    let zero = warehouse.scan_pick(task.id, "SKU-1", 0).await.unwrap_err();
    assert_matches!(zero, ServiceError::ValidationError(_));
    let no_picker = warehouse.assign_picker(task.id, "  ").await.unwrap_err();
    assert_matches!(no_picker, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn packing_waits_for_weight_and_label_then_stages_the_order() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let order_id = released_order(&app, "SALLA-4003", &[("SKU-1", 2)]).await;
    let warehouse = &app.system.warehouse;
    let pick = warehouse.picking_task_for(order_id).await.unwrap().unwrap();
    warehouse.assign_picker(pick.id, "picker-7").await.unwrap();
    warehouse.start_picking(pick.id).await.unwrap();
    warehouse.scan_pick(pick.id, "SKU-1", 2).await.unwrap();

    let pack = warehouse.packing_task_for(order_id).await.unwrap().unwrap();
    warehouse.assign_packer(pack.id, "packer-3").await.unwrap();
    warehouse.start_packing(pack.id).await.unwrap();
    let pack = warehouse.scan_pack(pack.id, "SKU-1", 2).await.unwrap();
    assert_eq!(pack.status, TaskStatus::InProgress);
    assert!(!pack.ready_to_complete());
    assert_eq!(app.order(order_id).await.status, OrderStatus::Packing);

    let bad_weight = warehouse.capture_label(pack.id, 0.0, "LBL-1").await.unwrap_err();
    assert_matches!(bad_weight, ServiceError::ValidationError(_));

    let pack = warehouse.capture_label(pack.id, 1.1, "LBL-4003").await.unwrap();
    assert_eq!(pack.status, TaskStatus::Completed);
    assert_eq!(pack.assigned_to.as_deref(), Some("packer-3"));

    let order = app.order(order_id).await;
    assert!(order.checkpoints.packed.is_some());
    assert_eq!(order.status, OrderStatus::StagedForDispatch);
    assert_eq!(order.staging_area.as_deref(), Some("STG-A"));
    assert_eq!(app.count_events_for(order_id, EventCode::OrderPacked).await, 1);
    assert_eq!(app.count_events_for(order_id, EventCode::OrderStaged).await, 1);
}

#[tokio::test]
async fn pick_exception_parks_order_and_resolution_reopens_the_task() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let order_id = released_order(&app, "SALLA-4004", &[("SKU-1", 2)]).await;
    let warehouse = &app.system.warehouse;
    let task = warehouse.picking_task_for(order_id).await.unwrap().unwrap();
    warehouse.scan_pick(task.id, "SKU-1", 1).await.unwrap();

    let task = warehouse
        .report_pick_exception(task.id, "bin empty")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Exception);
    let parked = app.order(order_id).await;
    assert_eq!(parked.status, OrderStatus::Exception);
    assert_eq!(parked.exception_category(), Some(ExceptionCategory::Picking));
    let blocked = warehouse.scan_pick(task.id, "SKU-1", 1).await.unwrap_err();
    assert_matches!(blocked, ServiceError::InvalidStatus(_));

    let order = app
        .system
        .orders
        .resolve_exception(order_id, "supervisor", "found stock in overflow bin")
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Picking);
    let task = warehouse.picking_task_for(order_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.lines[0].scanned_quantity, 1);

    warehouse.scan_pick(task.id, "SKU-1", 1).await.unwrap();
    assert_eq!(app.order(order_id).await.status, OrderStatus::Packing);
}

#[tokio::test]
async fn pack_exception_parks_order_until_resolved() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    let order_id = released_order(&app, "SALLA-4005", &[("SKU-1", 1)]).await;
    let warehouse = &app.system.warehouse;
    let pick = warehouse.picking_task_for(order_id).await.unwrap().unwrap();
    warehouse.scan_pick(pick.id, "SKU-1", 1).await.unwrap();
    let pack = warehouse.packing_task_for(order_id).await.unwrap().unwrap();

    warehouse
        .report_pack_exception(pack.id, "damaged item")
        .await
        .unwrap();
    assert_eq!(
        app.order(order_id).await.exception_category(),
        Some(ExceptionCategory::Packing)
    );

    app.system
        .orders
        .resolve_exception(order_id, "supervisor", "item replaced")
        .await
        .unwrap();
    warehouse.scan_pack(pack.id, "SKU-1", 1).await.unwrap();
    warehouse.capture_label(pack.id, 0.6, "LBL-4005").await.unwrap();

    assert_eq!(app.order(order_id).await.status, OrderStatus::StagedForDispatch);
}

#[tokio::test]
async fn purchase_order_is_received_once_and_put_away() {
    let app = TestApp::new().await;
    let warehouse = &app.system.warehouse;
    let full = warehouse.add_bin(BinLocation::new("A", 1, 1, "01"), 5).await.unwrap();
    let open = warehouse.add_bin(BinLocation::new("B", 1, 1, "01"), 100).await.unwrap();
    let first = warehouse
        .receive_goods("PO-7780", "Riyadh Textiles", &[SkuQuantity::new("SKU-NEW", 5)])
        .await
        .unwrap();
    let filler = warehouse.putaway_tasks_for(first.id).await.unwrap().remove(0);
    assert_eq!(filler.target_bin_id, Some(full.id));
    warehouse.complete_putaway(filler.id, None).await.unwrap();

    let po = PurchaseOrder {
        po_number: "PO-7781".to_string(),
        supplier: "Riyadh Textiles".to_string(),
        lines: vec![SkuQuantity::new("SKU-NEW", 40)],
    };
    warehouse.receive_purchase_order(po.clone()).await.unwrap();
    warehouse.receive_purchase_order(po).await.unwrap();

    assert_eq!(app.stock("SKU-NEW").await.available_quantity, 45);
    assert_eq!(app.count_events(EventCode::GoodsReceived).await, 2);

    let receipt_id = saylogix::entities::GoodsReceipt::id_for_po("PO-7781");
    let tasks = warehouse.putaway_tasks_for(receipt_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].target_bin_id, Some(open.id));

    let done = warehouse.complete_putaway(tasks[0].id, None).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let bins = warehouse.bins().await.unwrap();
    let shelved = bins.iter().find(|b| b.id == open.id).unwrap();
    assert_eq!(shelved.current_occupancy, 40);
}

#[tokio::test]
async fn padded_po_number_is_the_same_purchase_order() {
    let app = TestApp::new().await;
    let warehouse = &app.system.warehouse;

    warehouse
        .receive_purchase_order(PurchaseOrder {
            po_number: " PO-1 ".to_string(),
            supplier: "Acme".to_string(),
            lines: vec![SkuQuantity::new("SKU-PAD", 6)],
        })
        .await
        .unwrap();
    let again = warehouse
        .receive_goods("PO-1", "Acme", &[SkuQuantity::new("SKU-PAD", 6)])
        .await
        .unwrap();

    assert_eq!(again.id, GoodsReceipt::id_for_po("PO-1"));
    assert_eq!(again.po_number, "PO-1");
    assert_eq!(app.stock("SKU-PAD").await.available_quantity, 6);
    assert_eq!(app.count_events(EventCode::GoodsReceived).await, 1);
}

#[tokio::test]
async fn failed_receipt_is_undone_and_can_be_received_again() {
    let store = Arc::new(FlakyInventoryStore::refusing("SKU-NEW"));
    let app = TestApp::with_store(AppConfig::default(), store.clone()).await;
    app.seed_sku("SKU-1", 10).await;
    let warehouse = &app.system.warehouse;
    let lines = [SkuQuantity::new("SKU-1", 5), SkuQuantity::new("SKU-NEW", 3)];

    let err = warehouse.receive_goods("PO-42", "Acme", &lines).await.unwrap_err();
    assert_matches!(err, ServiceError::StoreError(_));
    assert_eq!(app.stock("SKU-1").await.available_quantity, 10);
    assert_eq!(app.count_events(EventCode::GoodsReceived).await, 0);

    store.clear();
    let receipt = warehouse.receive_goods("PO-42", "Acme", &lines).await.unwrap();

    assert_eq!(receipt.lines.len(), 2);
    assert_eq!(app.stock("SKU-1").await.available_quantity, 15);
    assert_eq!(app.stock("SKU-NEW").await.available_quantity, 3);
    assert_eq!(app.count_events(EventCode::GoodsReceived).await, 1);
}

#[tokio::test]
async fn putaway_without_free_bin_needs_an_explicit_target() {
    let app = TestApp::new().await;
    let warehouse = &app.system.warehouse;
    warehouse
        .receive_goods("PO-9", "Acme", &[SkuQuantity::new("SKU-1", 3)])
        .await
        .unwrap();
    assert_eq!(app.count_events(EventCode::PutawayNoBinAvailable).await, 1);

    let receipt_id = saylogix::entities::GoodsReceipt::id_for_po("PO-9");
    let task = warehouse.putaway_tasks_for(receipt_id).await.unwrap().remove(0);
    let err = warehouse.complete_putaway(task.id, None).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let bin = warehouse.add_bin(BinLocation::new("C", 2, 1, "04"), 10).await.unwrap();
    let task = warehouse.complete_putaway(task.id, Some(bin.id)).await.unwrap();
    assert_eq!(task.target_location, Some(BinLocation::new("C", 2, 1, "04")));
}

#[tokio::test]
async fn adjustments_require_reason_and_never_go_negative() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 5).await;
    let warehouse = &app.system.warehouse;

    let no_reason = warehouse.adjust_inventory("SKU-1", -1, " ").await.unwrap_err();
    assert_matches!(no_reason, ServiceError::ValidationError(_));
    let too_many = warehouse.adjust_inventory("SKU-1", -6, "damaged").await.unwrap_err();
    assert_matches!(too_many, ServiceError::InsufficientStock(_));

    let adjustment = warehouse.adjust_inventory("SKU-1", -2, "damaged in transit").await.unwrap();
    assert_eq!(adjustment.available_after, 3);
    assert_eq!(app.count_events(EventCode::InventoryAdjusted).await, 1);
    let audit = app.system.ledger.adjustments_for("SKU-1").await.unwrap();
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn cycle_count_books_the_difference_against_available() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    released_order(&app, "SALLA-4006", &[("SKU-1", 2)]).await;
    let before = app.stock("SKU-1").await;
    assert_eq!((before.available_quantity, before.reserved_quantity), (8, 2));

    let counted = app.system.warehouse.record_cycle_count("SKU-1", 7).await.unwrap();

    assert_eq!(counted.expected, 10);
    assert_eq!(counted.delta, -3);
    let after = app.stock("SKU-1").await;
    assert_eq!((after.available_quantity, after.reserved_quantity), (5, 2));

    let missing = app.system.warehouse.record_cycle_count("SKU-404", 1).await.unwrap_err();
    assert_matches!(missing, ServiceError::NotFound(_));
}
