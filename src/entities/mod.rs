//! Persisted domain records. All of them round-trip through
//! [`crate::store::EntityStore`] as JSON field maps.

pub mod address;
pub mod inventory;
pub mod manifest;
pub mod order;
pub mod order_item;
pub mod outbound;
pub mod route;
pub mod warehouse;

pub use address::{
    Address, AddressCacheEntry, AddressVerification, GeoPoint, VerificationMethod,
    VerificationStatus,
};
pub use inventory::{AdjustmentKind, InventoryAdjustment, InventoryRecord, Shortage, SkuQuantity};
pub use manifest::{Manifest, ManifestMember, ManifestStatus, ManifestTrigger, MemberState};
pub use order::{
    AllocationState, Checkpoint, Checkpoints, CourierAssignment, Customer, ExceptionCategory,
    Order, OrderException, OrderStatus,
};
pub use order_item::OrderItem;
pub use outbound::{DeliveryStatus, NotificationPurpose, OutboundDelivery};
pub use route::{DeliveryOutcome, Driver, Route, RouteStatus, RouteStop};
pub use warehouse::{
    all_lines_satisfied, Bin, BinLocation, GoodsReceipt, PackingTask, PickingTask, PutawayTask,
    TaskLine, TaskStatus,
};
