mod common;

use std::sync::{Arc, Mutex};

use common::{start_time, OrderBuilder, TestApp};
use saylogix::clock::ManualClock;
use saylogix::errors::ServiceError;
use saylogix::events::payloads::OrderRef;
use saylogix::events::{EntityRef, EventBus, EventCode, EventPayload, ModuleName};
use saylogix::store::{EntityStore, EntityType, InMemoryStore};
use uuid::Uuid;

fn bus() -> EventBus {
    EventBus::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(ManualClock::new(start_time())),
    )
}

fn order_ref(order_id: Uuid) -> EventPayload {
    EventPayload::WmsOrderReceived(OrderRef {
        order_id,
        saylogix_number: "SLX-TEST".to_string(),
    })
}

#[tokio::test]
async fn handlers_run_in_registration_order_after_observers() {
    let bus = bus();
    let calls = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second"] {
        let calls = calls.clone();
        bus.subscribe_fn(EventCode::WmsOrderReceived, name, move |_| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(name);
                Ok(())
            }
        });
    }
    let observed = calls.clone();
    bus.subscribe_any(Arc::new(saylogix::events::FnHandler::new("observer", move |_| {
        let calls = observed.clone();
        async move {
            calls.lock().unwrap().push("observer");
            Ok(())
        }
    })));

    bus.emit(ModuleName::Wms, EntityRef::order(Uuid::new_v4()), order_ref(Uuid::new_v4()))
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["observer", "first", "second"]);
    assert_eq!(bus.subscriber_count(EventCode::WmsOrderReceived), 2);
    assert_eq!(bus.subscriber_count(EventCode::OrderPicked), 0);
}

#[tokio::test]
async fn failing_handler_is_dead_lettered_and_siblings_still_run() {
    let bus = bus();
    let ran = Arc::new(Mutex::new(0));

    bus.subscribe_fn(EventCode::WmsOrderReceived, "broken", |_| async {
        Err(ServiceError::InternalError("boom".to_string()))
    });
    bus.subscribe_fn(EventCode::WmsOrderReceived, "panicking", |_| async {
        if true {
            panic!("handler blew up");
        }
        Ok(())
    });
    let counter = ran.clone();
    bus.subscribe_fn(EventCode::WmsOrderReceived, "healthy", move |_| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        }
    });

    let record = bus
        .emit(ModuleName::Wms, EntityRef::order(Uuid::new_v4()), order_ref(Uuid::new_v4()))
        .await
        .expect("emit succeeds despite handler failures");

    assert_eq!(*ran.lock().unwrap(), 1);
    let letters = bus.dead_letters().pending();
    assert_eq!(letters.len(), 2);
    assert_eq!(letters[0].handler, "broken");
    assert_eq!(letters[0].kind, "internal");
    assert!(letters[0].error.contains("boom"));
    assert_eq!(letters[1].handler, "panicking");
    assert_eq!(letters[1].kind, "panic");
    let failures = saylogix::metrics::HANDLER_FAILURES
        .with_label_values(&["broken", "internal"])
        .get();
    assert!(failures >= 1);
    assert_eq!(letters[1].record.record_id, record.record_id);

    let report = bus.replay(record.record_id).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(*ran.lock().unwrap(), 2);
    // Replay does not append the event a second time.
    assert_eq!(bus.store().query_events(None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn replay_of_unknown_record_is_not_found() {
    let bus = bus();

    let err = bus.replay(Uuid::new_v4()).await.unwrap_err();

    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn events_emitted_inside_handlers_are_logged_after_their_cause() {
    let bus = Arc::new(bus());
    let inner = bus.clone();
    bus.subscribe_fn(EventCode::WmsOrderReceived, "cascade", move |event| {
        let bus = inner.clone();
        async move {
            let EventPayload::WmsOrderReceived(order) = event.payload else {
                return Ok(());
            };
            bus.emit(
                ModuleName::Wms,
                EntityRef::order(order.order_id),
                EventPayload::OrderAddressConfirmed(order),
            )
            .await?;
            Ok(())
        }
    });

    let order_id = Uuid::new_v4();
    bus.emit(ModuleName::Wms, EntityRef::order(order_id), order_ref(order_id))
        .await
        .unwrap();

    let log = bus
        .store()
        .query_events(Some(EntityType::Order), Some(order_id))
        .await
        .unwrap();
    let codes: Vec<EventCode> = log.iter().map(|r| r.code()).collect();
    assert_eq!(codes, vec![EventCode::WmsOrderReceived, EventCode::OrderAddressConfirmed]);
    assert_eq!(log[0].sequence + 1, log[1].sequence);
    assert_eq!(log[0].event_id, "EV201");
    assert_eq!(log[0].event_type, "wms.order_received");
}

#[tokio::test]
async fn order_history_is_totally_ordered_and_stable() {
    let app = TestApp::new().await;
    app.register_code("RRRD2929", "Riyadh");
    app.seed_sku("SKU-1", 5).await;
    let order = app
        .ingest(OrderBuilder::new("SALLA-3001").short_code("RRRD2929").item("SKU-1", 1).build())
        .await;

    let first = app.events_for(order.id).await;
    let second = app.events_for(order.id).await;

    assert_eq!(first, second);
    assert!(first.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(first[0].code(), EventCode::OrderFetched);
    assert!(first.iter().all(|r| r.entity_id == order.id));

    let position = |code: EventCode| first.iter().position(|r| r.code() == code).unwrap();
    assert!(position(EventCode::OrderValidated) < position(EventCode::CourierAssigned));
    assert!(position(EventCode::CourierAssigned) < position(EventCode::InventoryAllocated));
    assert!(position(EventCode::AddressVerified) < position(EventCode::OrderReadyForWms));
    assert!(position(EventCode::OrderReadyForWms) < position(EventCode::PickTaskCreated));
}

#[tokio::test]
async fn payload_serializes_with_code_and_data() {
    let order_id = Uuid::new_v4();

    let json = serde_json::to_value(order_ref(order_id)).unwrap();

    assert_eq!(json["code"], "WmsOrderReceived");
    assert_eq!(json["data"]["order_id"], order_id.to_string());
    let back: EventPayload = serde_json::from_value(json).unwrap();
    assert_eq!(back.code(), EventCode::WmsOrderReceived);
}

#[tokio::test]
async fn system_registers_a_handler_for_every_cross_module_trigger() {
    let app = TestApp::new().await;
    let bus = &app.system.bus;

    for code in [
        EventCode::OrderFetched,
        EventCode::AddressVerificationRequested,
        EventCode::AddressVerified,
        EventCode::OrderReadyForWms,
        EventCode::PickTaskCompleted,
        EventCode::PackTaskCompleted,
        EventCode::OrderDispatched,
        EventCode::ManifestDispatched,
        EventCode::DeliveryCompleted,
        EventCode::OrderCancelled,
    ] {
        assert!(bus.subscriber_count(code) > 0, "{} has no handler", code.event_type());
    }
}
