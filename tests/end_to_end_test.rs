//! One order from channel ingest to doorstep, observed through tracking and reports.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{OrderBuilder, TestApp};
use saylogix::entities::{DeliveryOutcome, GeoPoint, OrderStatus};
use saylogix::events::EventCode;

#[tokio::test]
async fn order_travels_from_channel_to_doorstep() {
    let app = TestApp::new().await;
    app.register_code("RRRD2929", "Riyadh");
    app.seed_sku("SKU-1", 10).await;
    app.seed_sku("SKU-2", 10).await;
    let driver = app
        .system
        .last_mile
        .register_driver("Faisal", "+966551000001")
        .await
        .unwrap();

    let order = app
        .ingest(
            OrderBuilder::new("SALLA-9001")
                .short_code("RRRD2929")
                .item("SKU-1", 2)
                .item("SKU-2", 1)
                .build(),
        )
        .await;
    assert_eq!(order.status, OrderStatus::Picking);
    app.clock.advance(Duration::minutes(20));
    app.pick_and_pack(order.id).await;
    let order = app.order(order.id).await;
    assert_eq!(order.status, OrderStatus::StagedForDispatch);

    app.clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap());
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);
    let tracking_number = order.tracking_number().unwrap().to_string();
    app.system
        .dispatch
        .scan_package(manifest.id, &tracking_number)
        .await
        .unwrap();

    let route = app
        .system
        .last_mile
        .routes_for_manifest(manifest.id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(route.driver_id, Some(driver.id));
    app.clock.advance(Duration::hours(18));
    app.system.last_mile.start_route(route.id).await.unwrap();
    app.clock.advance(Duration::minutes(45));
    app.system
        .last_mile
        .record_delivery(
            route.id,
            order.id,
            DeliveryOutcome::Delivered {
                recipient_name: "Noura".to_string(),
                location: GeoPoint::new(24.7137, 46.6752),
                photo_url: None,
            },
        )
        .await
        .unwrap();

    let delivered = app.order(order.id).await;
    assert_eq!(delivered.status, OrderStatus::Delivered);
    let checkpoints = &delivered.checkpoints;
    assert!(checkpoints.order_fetched <= checkpoints.order_validated);
    assert!(checkpoints.picked <= checkpoints.packed);
    assert!(checkpoints.dispatched < checkpoints.delivered);
    let stock = app.stock("SKU-1").await;
    assert_eq!((stock.available_quantity, stock.reserved_quantity), (8, 0));

    // Tracking: the projection covers events about the order and its route.
    let view = app.system.tracking.track(order.id).await.unwrap();
    assert_eq!(view.status, OrderStatus::Delivered);
    assert_eq!(view.courier.as_deref(), Some("aramex"));
    let types: Vec<&str> = view.timeline.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(view.timeline[0].event_id, "EV001");
    for code in [
        EventCode::OrderReadyForWms,
        EventCode::ManifestGenerated,
        EventCode::RouteCreated,
        EventCode::OrderDelivered,
    ] {
        assert!(types.contains(&code.event_type()), "{} missing", code.event_type());
    }
    assert!(view.timeline.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let by_reference = app
        .system
        .tracking
        .track_by_reference(&tracking_number.to_lowercase())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_reference.order_id, order.id);
    let by_number = app
        .system
        .tracking
        .track_by_reference(&order.saylogix_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_number.order_id, order.id);
    assert!(app.system.tracking.track_by_reference("NOPE-1").await.unwrap().is_none());

    let before = app.system.tracking.timeline(order.id);
    let replayed = app.system.tracking.rebuild().await.unwrap();
    assert_eq!(replayed, app.all_events().await.len());
    assert_eq!(app.system.tracking.timeline(order.id), before);
}

#[tokio::test]
async fn report_summarizes_statuses_funnel_and_sources() {
    let app = TestApp::new().await;
    app.seed_sku("SKU-1", 10).await;
    app.system
        .last_mile
        .register_driver("Faisal", "+966551000001")
        .await
        .unwrap();

    let shipped = app.staged_order("SALLA-9101").await;
    let cancelled = app
        .ingest(OrderBuilder::new("SALLA-9102").short_code("RRRD2929").item("SKU-1", 1).build())
        .await;
    app.system
        .orders
        .cancel_order(cancelled.id, "duplicate checkout")
        .await
        .unwrap();
    let waiting = app
        .ingest(OrderBuilder::new("SALLA-9103").phone("+966550009103").item("SKU-1", 1).build())
        .await;

    app.clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap());
    let manifest = app.system.dispatch.run_cutoff_sweep().await.unwrap().remove(0);
    app.system
        .dispatch
        .scan_package(manifest.id, shipped.tracking_number().unwrap())
        .await
        .unwrap();
    let route = app
        .system
        .last_mile
        .routes_for_manifest(manifest.id)
        .await
        .unwrap()
        .remove(0);
    app.system.last_mile.start_route(route.id).await.unwrap();
    app.system
        .last_mile
        .record_delivery(
            route.id,
            shipped.id,
            DeliveryOutcome::Delivered {
                recipient_name: "Reem".to_string(),
                location: GeoPoint::new(24.7136, 46.6753),
                photo_url: None,
            },
        )
        .await
        .unwrap();

    let report = app.system.reports.fulfillment_report().await.unwrap();

    assert_eq!(report.status.total_orders, 3);
    assert_eq!(report.status.orders_by_status["delivered"], 1);
    assert_eq!(report.status.orders_by_status["cancelled"], 1);
    assert_eq!(report.status.orders_by_status["validated"], 1);
    let delivered_step = report
        .funnel
        .iter()
        .find(|s| s.checkpoint == "delivered")
        .unwrap();
    assert_eq!(delivered_step.orders, 1);
    let fetched_step = report.funnel.iter().find(|s| s.checkpoint == "order_fetched").unwrap();
    assert_eq!(fetched_step.orders, 3);
    let delivery = report
        .stage_durations
        .iter()
        .find(|s| s.stage == "delivery")
        .unwrap();
    assert_eq!(delivery.samples, 1);
    for source in ["oms", "nas", "wms", "dms", "lms"] {
        assert!(report.events_by_source.get(source).copied().unwrap_or(0) > 0, "{}", source);
    }
    assert!(report.stale_verifications.iter().any(|s| s.order_id == waiting.id));
    // Only the order still waiting on its address holds stock.
    let stock = app.stock("SKU-1").await;
    assert_eq!((stock.available_quantity, stock.reserved_quantity), (8, 1));
}
