use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::store::{Entity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationPurpose {
    AddressConfirmation,
    TrackingLink,
    DeliveryConfirmation,
    SupervisorAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Every outbound customer or supervisor message, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundDelivery {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub purpose: NotificationPurpose,
    pub recipient: String,
    pub body: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for OutboundDelivery {
    const ENTITY_TYPE: EntityType = EntityType::OutboundDelivery;

    fn id(&self) -> Uuid {
        self.id
    }
}
