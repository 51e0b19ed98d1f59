use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::warehouse::BinLocation;
use crate::store::{Entity, EntityType};

/// Stock position for one SKU. Quantities never go negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: Uuid,
    pub sku: String,
    pub description: String,
    pub available_quantity: i64,
    pub reserved_quantity: i64,
    pub primary_bin: Option<BinLocation>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    /// Records are keyed by SKU so concurrent writers address the same row.
    pub fn id_for_sku(sku: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("sku:{}", sku).as_bytes())
    }

    pub fn on_hand(&self) -> i64 {
        self.available_quantity + self.reserved_quantity
    }
}

impl Entity for InventoryRecord {
    const ENTITY_TYPE: EntityType = EntityType::Inventory;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdjustmentKind {
    Manual,
    CycleCount,
    Receipt,
}

/// Audit row written for every manual adjustment, receipt and cycle count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub id: Uuid,
    pub sku: String,
    pub kind: AdjustmentKind,
    pub delta: i64,
    pub reason: String,
    pub available_after: i64,
    pub created_at: DateTime<Utc>,
}

impl Entity for InventoryAdjustment {
    const ENTITY_TYPE: EntityType = EntityType::InventoryAdjustment;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// A quantity of one SKU, as carried by allocation and movement events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuQuantity {
    pub sku: String,
    pub quantity: u32,
}

impl SkuQuantity {
    pub fn new(sku: impl Into<String>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub sku: String,
    pub requested: u32,
    pub available: i64,
}
