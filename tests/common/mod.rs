#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use saylogix::clock::ManualClock;
use saylogix::config::AppConfig;
use saylogix::entities::{Address, BinLocation, Customer, GeoPoint, InventoryRecord, Order};
use saylogix::events::{EventCode, EventRecord};
use saylogix::integrations::memory::{
    CityCentroidGeocoder, InMemoryAddressRegistry, InMemoryMessaging, StaticCourierRates,
};
use saylogix::services::orders::{NewOrder, NewOrderItem};
use saylogix::store::{EntityStore, EntityType, Filter, InMemoryStore, StoreError, StoredRow};
use saylogix::{Collaborators, FulfillmentSystem};
use serde_json::Value;
use uuid::Uuid;

/// Whole pipeline over an in-memory store, a manual clock and in-process collaborators.
pub struct TestApp {
    pub system: FulfillmentSystem,
    pub clock: Arc<ManualClock>,
    pub messaging: Arc<InMemoryMessaging>,
    pub courier_rates: Arc<StaticCourierRates>,
    pub registry: Arc<InMemoryAddressRegistry>,
}

/// 09:00 in Riyadh, well before the dispatch cutoff.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap()
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::default()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new())).await
    }

    pub async fn with_store(config: AppConfig, store: Arc<dyn EntityStore>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let messaging = Arc::new(InMemoryMessaging::new());
        let courier_rates = Arc::new(StaticCourierRates::domestic());
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let collaborators = Collaborators {
            messaging: messaging.clone(),
            courier_rates: courier_rates.clone(),
            address_registry: registry.clone(),
            geocoder: Arc::new(CityCentroidGeocoder::default()),
        };
        let system = FulfillmentSystem::new(config, store, collaborators, clock.clone());
        Self {
            system,
            clock,
            messaging,
            courier_rates,
            registry,
        }
    }

    pub async fn seed_sku(&self, sku: &str, available: i64) -> InventoryRecord {
        self.system
            .ledger
            .upsert_sku(
                sku,
                &format!("{} description", sku),
                available,
                Some(BinLocation::new("A", 1, 1, "01")),
            )
            .await
            .expect("seed sku")
    }

    pub async fn stock(&self, sku: &str) -> InventoryRecord {
        self.system
            .ledger
            .get(sku)
            .await
            .expect("read inventory")
            .expect("sku exists")
    }

    /// Makes a short code resolvable by the national registry.
    pub fn register_code(&self, code: &str, city: &str) {
        self.registry.insert(
            code,
            address("Registry St 1", city, Some(code)),
            GeoPoint::new(24.7136, 46.6753),
            0.95,
        );
    }

    pub async fn ingest(&self, order: NewOrder) -> Order {
        self.system.orders.ingest_order(order).await.expect("ingest order")
    }

    pub async fn order(&self, order_id: Uuid) -> Order {
        self.system.orders.get_order(order_id).await.expect("order exists")
    }

    /// Runs the order through picking and packing, scanning every line in full.
    pub async fn pick_and_pack(&self, order_id: Uuid) {
        let warehouse = &self.system.warehouse;
        let pick = warehouse
            .picking_task_for(order_id)
            .await
            .unwrap()
            .expect("picking task");
        for line in &pick.lines {
            warehouse
                .scan_pick(pick.id, &line.sku, line.requested_quantity)
                .await
                .unwrap();
        }
        let pack = warehouse
            .packing_task_for(order_id)
            .await
            .unwrap()
            .expect("packing task");
        for line in &pack.lines {
            warehouse
                .scan_pack(pack.id, &line.sku, line.requested_quantity)
                .await
                .unwrap();
        }
        warehouse
            .capture_label(pack.id, 1.2, &format!("LBL-{}", order_id.simple()))
            .await
            .unwrap();
    }

    /// Ingests a verified Riyadh order for one unit of `SKU-1` and takes it to staging.
    pub async fn staged_order(&self, channel_ref: &str) -> Order {
        self.register_code("RRRD2929", "Riyadh");
        let order = self
            .ingest(OrderBuilder::new(channel_ref).short_code("RRRD2929").item("SKU-1", 1).build())
            .await;
        self.pick_and_pack(order.id).await;
        self.order(order.id).await
    }

    pub async fn events_for(&self, order_id: Uuid) -> Vec<EventRecord> {
        self.system
            .store
            .query_events(Some(EntityType::Order), Some(order_id))
            .await
            .unwrap()
    }

    pub async fn all_events(&self) -> Vec<EventRecord> {
        self.system.store.query_events(None, None).await.unwrap()
    }

    pub async fn count_events(&self, code: EventCode) -> usize {
        self.all_events()
            .await
            .iter()
            .filter(|r| r.code() == code)
            .count()
    }

    pub async fn count_events_for(&self, order_id: Uuid, code: EventCode) -> usize {
        self.events_for(order_id)
            .await
            .iter()
            .filter(|r| r.code() == code)
            .count()
    }
}

pub fn address(line1: &str, city: &str, short_code: Option<&str>) -> Address {
    Address {
        line1: line1.to_string(),
        line2: None,
        district: None,
        city: city.to_string(),
        postal_code: None,
        country: "SA".to_string(),
        short_code: short_code.map(str::to_string),
        coordinates: None,
    }
}

/// Builds channel orders. Defaults to one Riyadh customer with no lines.
pub struct OrderBuilder {
    channel_ref: String,
    customer_name: String,
    phone: String,
    line1: String,
    city: String,
    short_code: Option<String>,
    unit_price: Decimal,
    items: Vec<(String, u32)>,
}

impl OrderBuilder {
    pub fn new(channel_ref: &str) -> Self {
        let digits: String = channel_ref.chars().filter(char::is_ascii_digit).collect();
        Self {
            channel_ref: channel_ref.to_string(),
            customer_name: "Noura Al-Harbi".to_string(),
            phone: format!("+96655{:0>7}", digits),
            line1: "King Fahd Rd 1200".to_string(),
            city: "Riyadh".to_string(),
            short_code: None,
            unit_price: dec!(100),
            items: Vec::new(),
        }
    }

    pub fn city(mut self, city: &str) -> Self {
        self.city = city.to_string();
        self
    }

    pub fn phone(mut self, phone: &str) -> Self {
        self.phone = phone.to_string();
        self
    }

    pub fn customer_name(mut self, name: &str) -> Self {
        self.customer_name = name.to_string();
        self
    }

    pub fn short_code(mut self, code: &str) -> Self {
        self.short_code = Some(code.to_string());
        self
    }

    pub fn unit_price(mut self, price: Decimal) -> Self {
        self.unit_price = price;
        self
    }

    pub fn item(mut self, sku: &str, quantity: u32) -> Self {
        self.items.push((sku.to_string(), quantity));
        self
    }

    pub fn build(self) -> NewOrder {
        NewOrder {
            channel: "salla".to_string(),
            channel_ref: self.channel_ref,
            customer: Customer {
                name: self.customer_name,
                phone: self.phone,
                email: None,
            },
            shipping_address: address(&self.line1, &self.city, self.short_code.as_deref()),
            billing_address: None,
            currency: "SAR".to_string(),
            items: self
                .items
                .into_iter()
                .map(|(sku, quantity)| NewOrderItem {
                    name: format!("{} item", sku),
                    sku,
                    quantity,
                    unit_price: self.unit_price,
                    weight_kg: Some(0.5),
                })
                .collect(),
        }
    }
}

/// In-memory store that refuses to create inventory rows for one SKU until
/// the SKU is cleared.
#[derive(Default)]
pub struct FlakyInventoryStore {
    inner: InMemoryStore,
    refused_sku: Mutex<Option<String>>,
}

impl FlakyInventoryStore {
    pub fn refusing(sku: &str) -> Self {
        Self {
            inner: InMemoryStore::new(),
            refused_sku: Mutex::new(Some(sku.to_string())),
        }
    }

    pub fn clear(&self) {
        *self.refused_sku.lock().unwrap() = None;
    }
}

#[async_trait]
impl EntityStore for FlakyInventoryStore {
    async fn get(&self, entity_type: EntityType, id: Uuid) -> Result<Option<StoredRow>, StoreError> {
        self.inner.get(entity_type, id).await
    }

    async fn create(&self, entity_type: EntityType, fields: Value) -> Result<Uuid, StoreError> {
        let refused = self.refused_sku.lock().unwrap().clone();
        if entity_type == EntityType::Inventory {
            if let (Some(refused), Some(sku)) = (refused, fields.get("sku").and_then(Value::as_str)) {
                if refused == sku {
                    return Err(StoreError::Backend(format!("disk full writing {}", sku)));
                }
            }
        }
        self.inner.create(entity_type, fields).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: Uuid,
        partial: Value,
    ) -> Result<u64, StoreError> {
        self.inner.update(entity_type, id, partial).await
    }

    async fn compare_and_update(
        &self,
        entity_type: EntityType,
        id: Uuid,
        expected_version: u64,
        partial: Value,
    ) -> Result<u64, StoreError> {
        self.inner
            .compare_and_update(entity_type, id, expected_version, partial)
            .await
    }

    async fn query(
        &self,
        entity_type: EntityType,
        filter: &Filter,
    ) -> Result<Vec<StoredRow>, StoreError> {
        self.inner.query(entity_type, filter).await
    }

    async fn append_event(&self, record: EventRecord) -> Result<EventRecord, StoreError> {
        self.inner.append_event(record).await
    }

    async fn query_events(
        &self,
        entity_type: Option<EntityType>,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.inner.query_events(entity_type, entity_id).await
    }
}
