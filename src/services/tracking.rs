//! Order tracking projection.
//!
//! Observes every event on the bus and keeps a per-order timeline in memory.
//! The projection holds no state the event log does not: it can be dropped
//! and rebuilt from the log at any time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::entities::{Checkpoints, Order, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{EventBus, EventHandler, EventRecord, ModuleName};
use crate::store::{EntityStore, EntityType, Filter, Repository};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub record_id: Uuid,
    pub sequence: u64,
    pub event_id: String,
    pub event_type: String,
    pub source: ModuleName,
    pub timestamp: DateTime<Utc>,
}

impl From<&EventRecord> for TimelineEntry {
    fn from(record: &EventRecord) -> Self {
        Self {
            record_id: record.record_id,
            sequence: record.sequence,
            event_id: record.event_id.clone(),
            event_type: record.event_type.clone(),
            source: record.source,
            timestamp: record.timestamp,
        }
    }
}

/// What a customer or operator sees when looking an order up.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingView {
    pub order_id: Uuid,
    pub saylogix_number: String,
    pub status: OrderStatus,
    pub courier: Option<String>,
    pub tracking_number: Option<String>,
    pub checkpoints: Checkpoints,
    pub timeline: Vec<TimelineEntry>,
}

/// Orders an event concerns: its subject when that is an order, plus any
/// `order_id` or `order_ids` carried in the payload.
pub fn related_orders(record: &EventRecord) -> Vec<Uuid> {
    let mut ids = Vec::new();
    if record.entity_type == EntityType::Order {
        ids.push(record.entity_id);
    }
    if let Ok(payload) = serde_json::to_value(&record.payload) {
        let data = &payload["data"];
        if let Some(id) = data.get("order_id").and_then(|v| serde_json::from_value::<Uuid>(v.clone()).ok()) {
            ids.push(id);
        }
        if let Some(Value::Array(many)) = data.get("order_ids") {
            ids.extend(many.iter().filter_map(|v| serde_json::from_value::<Uuid>(v.clone()).ok()));
        }
    }
    ids.sort();
    ids.dedup();
    ids
}

pub struct TrackingService {
    store: Arc<dyn EntityStore>,
    orders: Repository<Order>,
    timelines: DashMap<Uuid, Vec<TimelineEntry>>,
}

impl TrackingService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            orders: Repository::new(store.clone()),
            store,
            timelines: DashMap::new(),
        }
    }

    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe_any(self.clone());
    }

    fn apply(&self, record: &EventRecord) {
        for order_id in related_orders(record) {
            let mut timeline = self.timelines.entry(order_id).or_default();
            if timeline.iter().any(|e| e.record_id == record.record_id) {
                continue;
            }
            let entry = TimelineEntry::from(record);
            let at = timeline.partition_point(|e| e.sequence <= entry.sequence);
            timeline.insert(at, entry);
        }
    }

    pub fn timeline(&self, order_id: Uuid) -> Vec<TimelineEntry> {
        self.timelines
            .get(&order_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Discards the projection and replays the whole event log into it.
    pub async fn rebuild(&self) -> Result<usize, ServiceError> {
        let records = self.store.query_events(None, None).await?;
        self.timelines.clear();
        for record in &records {
            self.apply(record);
        }
        info!(events = records.len(), orders = self.timelines.len(), "tracking projection rebuilt");
        Ok(records.len())
    }

    pub async fn track(&self, order_id: Uuid) -> Result<TrackingView, ServiceError> {
        let order = self.orders.find(order_id).await?;
        Ok(self.view(order))
    }

    /// Looks an order up by its internal number or courier tracking number.
    pub async fn track_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TrackingView>, ServiceError> {
        let reference = reference.trim();
        let found = self
            .orders
            .query(Filter::new().eq("saylogix_number", reference))
            .await?
            .into_iter()
            .next();
        let found = match found {
            Some(order) => Some(order),
            None => self
                .orders
                .all()
                .await?
                .into_iter()
                .find(|o| o.tracking_number().map_or(false, |t| t.eq_ignore_ascii_case(reference))),
        };
        Ok(found.map(|order| self.view(order)))
    }

    fn view(&self, order: Order) -> TrackingView {
        TrackingView {
            order_id: order.id,
            timeline: self.timeline(order.id),
            courier: order.courier_name().map(str::to_string),
            tracking_number: order.tracking_number().map(str::to_string),
            saylogix_number: order.saylogix_number,
            status: order.status,
            checkpoints: order.checkpoints,
        }
    }
}

#[async_trait]
impl EventHandler for TrackingService {
    fn name(&self) -> &str {
        "tracking.timeline"
    }

    async fn handle_event(&self, event: EventRecord) -> Result<(), ServiceError> {
        self.apply(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::payloads::{ManifestSummary, OrderRef};
    use crate::events::EventPayload;

    fn record(
        sequence: u64,
        entity_type: EntityType,
        entity_id: Uuid,
        payload: EventPayload,
    ) -> EventRecord {
        let code = payload.code();
        EventRecord {
            record_id: Uuid::new_v4(),
            sequence,
            event_id: code.event_id().into(),
            event_type: code.event_type().into(),
            entity_type,
            entity_id,
            source: code.owner(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn manifest_events_land_on_every_member() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = record(
            1,
            EntityType::Manifest,
            Uuid::new_v4(),
            EventPayload::ManifestConfirmed(ManifestSummary {
                manifest_id: Uuid::new_v4(),
                manifest_number: "MNF-ARAMEX-20260310-001".into(),
                courier: "aramex".into(),
                order_ids: vec![a, b],
            }),
        );
        let mut related = related_orders(&event);
        related.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(related, expected);
    }

    #[tokio::test]
    async fn timeline_is_ordered_and_deduplicated() {
        let tracking = TrackingService::new(Arc::new(crate::store::InMemoryStore::new()));
        let order_id = Uuid::new_v4();
        let order_ref = || {
            EventPayload::OrderValidationStarted(OrderRef {
                order_id,
                saylogix_number: "SLX-1".into(),
            })
        };
        let late = record(7, EntityType::Order, order_id, order_ref());
        let early = record(3, EntityType::Order, order_id, order_ref());

        tracking.handle_event(late.clone()).await.unwrap();
        tracking.handle_event(early).await.unwrap();
        tracking.handle_event(late).await.unwrap();

        let sequences: Vec<u64> = tracking.timeline(order_id).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 7]);
    }
}
