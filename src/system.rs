//! Wiring of the fulfillment pipeline.
//!
//! Builds one bus over one store and registers every module on it. Handlers
//! run in registration order, so the order below is part of the contract:
//! WMS must see `pack.task_completed` before DMS stages the order.

use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::events::EventBus;
use crate::integrations::memory::{
    CityCentroidGeocoder, InMemoryAddressRegistry, InMemoryMessaging, StaticCourierRates,
};
use crate::integrations::{AddressRegistry, CourierRates, Geocoder, MessagingClient};
use crate::retry::RetryPolicy;
use crate::services::address_verification::AddressVerificationService;
use crate::services::dispatch::DispatchService;
use crate::services::geocoding::GeocodingService;
use crate::services::inventory::InventoryLedger;
use crate::services::last_mile::LastMileService;
use crate::services::notifications::Notifier;
use crate::services::orders::OrderService;
use crate::services::reports::ReportService;
use crate::services::tracking::TrackingService;
use crate::services::warehouse::WarehouseService;
use crate::store::EntityStore;

/// External systems the pipeline calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub messaging: Arc<dyn MessagingClient>,
    pub courier_rates: Arc<dyn CourierRates>,
    pub address_registry: Arc<dyn AddressRegistry>,
    pub geocoder: Arc<dyn Geocoder>,
}

impl Collaborators {
    /// Deterministic in-process stand-ins, used by the CLI simulation.
    pub fn in_memory() -> Self {
        Self {
            messaging: Arc::new(InMemoryMessaging::new()),
            courier_rates: Arc::new(StaticCourierRates::domestic()),
            address_registry: Arc::new(InMemoryAddressRegistry::new()),
            geocoder: Arc::new(CityCentroidGeocoder::default()),
        }
    }
}

pub struct FulfillmentSystem {
    pub config: AppConfig,
    pub store: Arc<dyn EntityStore>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<InventoryLedger>,
    pub notifier: Arc<Notifier>,
    pub orders: Arc<OrderService>,
    pub addresses: Arc<AddressVerificationService>,
    pub warehouse: Arc<WarehouseService>,
    pub dispatch: Arc<DispatchService>,
    pub last_mile: Arc<LastMileService>,
    pub tracking: Arc<TrackingService>,
    pub reports: ReportService,
}

impl FulfillmentSystem {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn EntityStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.integrations);
        let bus = Arc::new(EventBus::new(store.clone(), clock.clone()));
        let ledger = Arc::new(InventoryLedger::new(store.clone(), clock.clone()));
        let notifier = Arc::new(Notifier::new(
            bus.clone(),
            collaborators.messaging,
            retry.clone(),
            clock.clone(),
        ));
        let geocoding = Arc::new(GeocodingService::new(collaborators.geocoder));

        let orders = Arc::new(OrderService::new(
            bus.clone(),
            ledger.clone(),
            collaborators.courier_rates,
            config.orders.clone(),
            retry.clone(),
            clock.clone(),
        ));
        let addresses = Arc::new(AddressVerificationService::new(
            bus.clone(),
            collaborators.address_registry,
            notifier.clone(),
            config.address.clone(),
            retry,
            clock.clone(),
        ));
        let warehouse = Arc::new(WarehouseService::new(bus.clone(), ledger.clone(), clock.clone()));
        let dispatch = Arc::new(DispatchService::new(
            bus.clone(),
            notifier.clone(),
            config.dispatch.clone(),
            clock.clone(),
        ));
        let last_mile = Arc::new(LastMileService::new(
            bus.clone(),
            notifier.clone(),
            geocoding,
            config.last_mile.clone(),
            clock.clone(),
        ));
        let tracking = Arc::new(TrackingService::new(store.clone()));
        let reports = ReportService::new(store.clone(), config.address.stale_after_minutes, clock.clone());

        tracking.register(&bus);
        orders.register();
        addresses.register();
        warehouse.register();
        dispatch.register();
        last_mile.register();
        info!(environment = %config.environment, "fulfillment pipeline wired");

        Self {
            config,
            store,
            bus,
            clock,
            ledger,
            notifier,
            orders,
            addresses,
            warehouse,
            dispatch,
            last_mile,
            tracking,
            reports,
        }
    }
}
