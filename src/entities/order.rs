use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;
use validator::Validate;

use super::address::Address;
use crate::events::ModuleName;
use crate::store::{Entity, EntityType};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Fetched,
    Validated,
    ReadyForWms,
    Picking,
    Picked,
    Packing,
    Packed,
    StagedForDispatch,
    Dispatched,
    OutForDelivery,
    Delivered,
    Exception,
    Cancelled,
}

impl OrderStatus {
    /// Position on the happy path, `None` for the off-path states.
    pub fn rank(self) -> Option<u8> {
        use OrderStatus::*;
        Some(match self {
            Fetched => 0,
            Validated => 1,
            ReadyForWms => 2,
            Picking => 3,
            Picked => 4,
            Packing => 5,
            Packed => 6,
            StagedForDispatch => 7,
            Dispatched => 8,
            OutForDelivery => 9,
            Delivered => 10,
            Exception | Cancelled => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Cancellation and exceptions are only allowed before the order leaves the warehouse.
    pub fn is_pre_dispatch(self) -> bool {
        matches!(self.rank(), Some(rank) if rank <= 7)
    }

    /// Module allowed to move an order into this status. `None` means any module.
    pub fn owner(self) -> Option<ModuleName> {
        use OrderStatus::*;
        match self {
            Fetched | Validated | ReadyForWms | Cancelled => Some(ModuleName::Oms),
            Picking | Picked | Packing | Packed => Some(ModuleName::Wms),
            StagedForDispatch | Dispatched => Some(ModuleName::Dms),
            OutForDelivery | Delivered => Some(ModuleName::Lms),
            Exception => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionCategory {
    Validation,
    Address,
    Courier,
    Stock,
    Picking,
    Packing,
    Dispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AllocationState {
    Pending,
    Allocated,
    Shortage,
    Released,
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Checkpoint {
    OrderFetched,
    VerifyCompleted,
    OrderValidated,
    OrderReleasedToWms,
    Picked,
    Packed,
    Dispatched,
    Delivered,
}

impl Checkpoint {
    pub fn for_status(status: OrderStatus) -> Option<Checkpoint> {
        match status {
            OrderStatus::Fetched => Some(Checkpoint::OrderFetched),
            OrderStatus::Validated => Some(Checkpoint::OrderValidated),
            OrderStatus::ReadyForWms => Some(Checkpoint::OrderReleasedToWms),
            OrderStatus::Picked => Some(Checkpoint::Picked),
            OrderStatus::Packed => Some(Checkpoint::Packed),
            OrderStatus::Dispatched => Some(Checkpoint::Dispatched),
            OrderStatus::Delivered => Some(Checkpoint::Delivered),
            _ => None,
        }
    }
}

/// Milestone timestamps. Each one is written once and never moved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoints {
    pub order_fetched: Option<DateTime<Utc>>,
    pub verify_completed: Option<DateTime<Utc>>,
    pub order_validated: Option<DateTime<Utc>>,
    pub order_released_to_wms: Option<DateTime<Utc>>,
    pub picked: Option<DateTime<Utc>>,
    pub packed: Option<DateTime<Utc>>,
    pub dispatched: Option<DateTime<Utc>>,
    pub delivered: Option<DateTime<Utc>>,
}

impl Checkpoints {
    fn slot(&mut self, checkpoint: Checkpoint) -> &mut Option<DateTime<Utc>> {
        match checkpoint {
            Checkpoint::OrderFetched => &mut self.order_fetched,
            Checkpoint::VerifyCompleted => &mut self.verify_completed,
            Checkpoint::OrderValidated => &mut self.order_validated,
            Checkpoint::OrderReleasedToWms => &mut self.order_released_to_wms,
            Checkpoint::Picked => &mut self.picked,
            Checkpoint::Packed => &mut self.packed,
            Checkpoint::Dispatched => &mut self.dispatched,
            Checkpoint::Delivered => &mut self.delivered,
        }
    }

    pub fn get(&self, checkpoint: Checkpoint) -> Option<DateTime<Utc>> {
        match checkpoint {
            Checkpoint::OrderFetched => self.order_fetched,
            Checkpoint::VerifyCompleted => self.verify_completed,
            Checkpoint::OrderValidated => self.order_validated,
            Checkpoint::OrderReleasedToWms => self.order_released_to_wms,
            Checkpoint::Picked => self.picked,
            Checkpoint::Packed => self.packed,
            Checkpoint::Dispatched => self.dispatched,
            Checkpoint::Delivered => self.delivered,
        }
    }

    /// Records the checkpoint unless it is already set. Returns whether it was written.
    pub fn mark(&mut self, checkpoint: Checkpoint, at: DateTime<Utc>) -> bool {
        let slot = self.slot(checkpoint);
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Customer {
    #[validate(length(min = 1, message = "Customer name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Customer phone is required"))]
    pub phone: String,
    #[validate(email)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierAssignment {
    pub courier: String,
    pub service_level: String,
    pub rate: Decimal,
    pub transit_days: u32,
    pub tracking_number: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderException {
    pub category: ExceptionCategory,
    pub message: String,
    pub prior_status: OrderStatus,
    pub raised_by: ModuleName,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Internal reference shown to customers and printed on labels.
    pub saylogix_number: String,
    pub channel: String,
    pub channel_ref: String,
    pub customer: Customer,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    pub order_value: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    pub priority: Option<u8>,
    pub nas_verified: bool,
    pub courier: Option<CourierAssignment>,
    pub allocation: AllocationState,
    pub exception: Option<OrderException>,
    /// Exceptions raised while the order was already parked, oldest first.
    #[serde(default)]
    pub pending_exceptions: Vec<OrderException>,
    #[serde(default)]
    pub resolved_exceptions: Vec<OrderException>,
    pub cancellation_reason: Option<String>,
    pub checkpoints: Checkpoints,
    pub staging_area: Option<String>,
    pub manifest_id: Option<Uuid>,
    pub route_id: Option<Uuid>,
    pub delivery_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn tracking_number(&self) -> Option<&str> {
        self.courier.as_ref().map(|c| c.tracking_number.as_str())
    }

    pub fn courier_name(&self) -> Option<&str> {
        self.courier.as_ref().map(|c| c.courier.as_str())
    }

    /// The live exception category, if the order is currently parked.
    pub fn exception_category(&self) -> Option<ExceptionCategory> {
        match (&self.status, &self.exception) {
            (OrderStatus::Exception, Some(exception)) => Some(exception.category),
            _ => None,
        }
    }
}

impl Entity for Order {
    const ENTITY_TYPE: EntityType = EntityType::Order;

    fn id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn checkpoints_are_write_once() {
        let mut checkpoints = Checkpoints::default();
        let first = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();

        assert!(checkpoints.mark(Checkpoint::Picked, first));
        assert!(!checkpoints.mark(Checkpoint::Picked, later));
        assert_eq!(checkpoints.get(Checkpoint::Picked), Some(first));
    }

    #[test]
    fn pre_dispatch_boundary() {
        assert!(OrderStatus::StagedForDispatch.is_pre_dispatch());
        assert!(!OrderStatus::Dispatched.is_pre_dispatch());
        assert!(!OrderStatus::Exception.is_pre_dispatch());
        assert_eq!(OrderStatus::ReadyForWms.to_string(), "ready_for_wms");
    }
}
