use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::inventory::SkuQuantity;
use crate::store::{Entity, EntityType};

/// Physical slot. Field order gives the pick-path ordering (zone, aisle, shelf, bin).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinLocation {
    pub zone: String,
    pub aisle: u32,
    pub shelf: u32,
    pub bin: String,
}

impl BinLocation {
    pub fn new(zone: impl Into<String>, aisle: u32, shelf: u32, bin: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            aisle,
            shelf,
            bin: bin.into(),
        }
    }

    pub fn path_key(&self) -> (&str, u32, u32) {
        (self.zone.as_str(), self.aisle, self.shelf)
    }
}

impl std::fmt::Display for BinLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}-{:02}-{}", self.zone, self.aisle, self.shelf, self.bin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub id: Uuid,
    pub location: BinLocation,
    pub capacity: u32,
    pub current_occupancy: u32,
}

impl Bin {
    pub fn has_space(&self) -> bool {
        self.current_occupancy < self.capacity
    }
}

impl Entity for Bin {
    const ENTITY_TYPE: EntityType = EntityType::Bin;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Exception,
    Cancelled,
}

impl TaskStatus {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::InProgress
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLine {
    pub sku: String,
    pub location: Option<BinLocation>,
    pub requested_quantity: u32,
    pub scanned_quantity: u32,
}

impl TaskLine {
    pub fn is_satisfied(&self) -> bool {
        self.scanned_quantity >= self.requested_quantity
    }
}

pub fn all_lines_satisfied(lines: &[TaskLine]) -> bool {
    !lines.is_empty() && lines.iter().all(TaskLine::is_satisfied)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickingTask {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub lines: Vec<TaskLine>,
    pub exception_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Entity for PickingTask {
    const ENTITY_TYPE: EntityType = EntityType::PickingTask;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackingTask {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub lines: Vec<TaskLine>,
    pub weight_kg: Option<f64>,
    pub label: Option<String>,
    pub exception_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Entity for PackingTask {
    const ENTITY_TYPE: EntityType = EntityType::PackingTask;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsReceipt {
    pub id: Uuid,
    pub po_number: String,
    pub supplier: String,
    pub lines: Vec<SkuQuantity>,
    pub received_at: DateTime<Utc>,
}

impl GoodsReceipt {
    /// One receipt per purchase order.
    pub fn id_for_po(po_number: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("po:{}", po_number.trim()).as_bytes())
    }
}

impl Entity for GoodsReceipt {
    const ENTITY_TYPE: EntityType = EntityType::GoodsReceipt;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutawayTask {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub sku: String,
    pub quantity: u32,
    pub target_bin_id: Option<Uuid>,
    pub target_location: Option<BinLocation>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Entity for PutawayTask {
    const ENTITY_TYPE: EntityType = EntityType::PutawayTask;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_order_by_zone_then_aisle_then_shelf() {
        let mut locations = vec![
            BinLocation::new("B", 1, 1, "01"),
            BinLocation::new("A", 3, 1, "01"),
            BinLocation::new("A", 1, 2, "01"),
            BinLocation::new("A", 1, 1, "02"),
        ];
        locations.sort();
        let rendered: Vec<String> = locations.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["A-01-01-02", "A-01-02-01", "A-03-01-01", "B-01-01-01"]);
    }

    #[test]
    fn empty_task_is_never_satisfied() {
        assert!(!all_lines_satisfied(&[]));
        let line = TaskLine {
            sku: "SKU-1".into(),
            location: None,
            requested_quantity: 2,
            scanned_quantity: 3,
        };
        assert!(all_lines_satisfied(&[line]));
    }
}
