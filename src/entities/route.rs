use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::address::{Address, GeoPoint};
use crate::store::{Entity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RouteStatus {
    Planned,
    Assigned,
    InProgress,
    Completed,
}

/// Terminal result recorded by the driver for one stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered {
        recipient_name: String,
        location: GeoPoint,
        photo_url: Option<String>,
    },
    Failed {
        reason: String,
    },
    Rescheduled {
        reason: String,
        next_attempt: Option<NaiveDate>,
    },
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Failed { .. } => "failed",
            DeliveryOutcome::Rescheduled { .. } => "rescheduled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    pub sequence: u32,
    pub order_id: Uuid,
    pub saylogix_number: String,
    pub address: Address,
    pub customer_phone: String,
    pub outcome: Option<DeliveryOutcome>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub route_number: String,
    pub manifest_id: Uuid,
    pub city: String,
    pub driver_id: Option<Uuid>,
    pub status: RouteStatus,
    pub stops: Vec<RouteStop>,
    pub estimated_distance_km: f64,
    pub estimated_duration_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Route {
    pub fn all_stops_resolved(&self) -> bool {
        self.stops.iter().all(|s| s.outcome.is_some())
    }

    pub fn count_outcomes(&self, label: &str) -> usize {
        self.stops
            .iter()
            .filter(|s| s.outcome.as_ref().map(DeliveryOutcome::label) == Some(label))
            .count()
    }
}

impl Entity for Route {
    const ENTITY_TYPE: EntityType = EntityType::Route;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub available: bool,
    pub current_route_id: Option<Uuid>,
}

impl Entity for Driver {
    const ENTITY_TYPE: EntityType = EntityType::Driver;

    fn id(&self) -> Uuid {
        self.id
    }
}
