//! Payload bodies carried by [`super::EventPayload`] variants.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ModuleName;
use crate::entities::{
    Address, BinLocation, ExceptionCategory, GeoPoint, ManifestTrigger, NotificationPurpose,
    OrderStatus, Shortage, SkuQuantity, TaskLine, VerificationMethod,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
    pub saylogix_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFetched {
    pub order_id: Uuid,
    pub saylogix_number: String,
    pub channel: String,
    pub channel_ref: String,
    pub item_count: usize,
    pub order_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderValidated {
    pub order_id: Uuid,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailed {
    pub order_id: Uuid,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityAssigned {
    pub order_id: Uuid,
    pub priority: u8,
    pub high_value: bool,
    pub metro: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierAssigned {
    pub order_id: Uuid,
    pub courier: String,
    pub service_level: String,
    pub rate: Decimal,
    pub transit_days: u32,
    pub tracking_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFailure {
    pub order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub order_id: Uuid,
    pub lines: Vec<SkuQuantity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockShortage {
    pub order_id: Uuid,
    pub shortages: Vec<Shortage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessChecked {
    pub order_id: Uuid,
    pub ready: bool,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReady {
    pub order_id: Uuid,
    pub saylogix_number: String,
    pub courier: String,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCorrected {
    pub order_id: Uuid,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: Uuid,
    pub reason: String,
    pub prior_status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRaised {
    pub order_id: Uuid,
    pub category: ExceptionCategory,
    pub message: String,
    pub prior_status: OrderStatus,
    pub raised_by: ModuleName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionOverride {
    pub order_id: Uuid,
    pub operator: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionResolved {
    pub order_id: Uuid,
    pub category: ExceptionCategory,
    pub resumed_status: OrderStatus,
    pub resolved_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequested {
    pub order_id: Uuid,
    pub short_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    Cache,
    Registry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCodeResolved {
    pub order_id: Uuid,
    pub short_code: String,
    pub source: LookupSource,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCodeUnresolved {
    pub order_id: Uuid,
    pub short_code: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequested {
    pub order_id: Uuid,
    pub phone: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerReply {
    pub order_id: Uuid,
    pub phone: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressVerified {
    pub order_id: Uuid,
    pub method: VerificationMethod,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub order_id: Uuid,
    pub operator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyChecked {
    pub order_id: Uuid,
    pub short_code: String,
    pub divergence_meters: f64,
    pub threshold_meters: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub lines: Vec<TaskLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub assignee: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: Uuid,
    pub order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScanned {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: u32,
    pub scanned_total: u32,
    pub requested: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskException {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelCaptured {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub weight_kg: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackCompleted {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub weight_kg: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCheckpointReached {
    pub order_id: Uuid,
    pub saylogix_number: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrderReceived {
    pub po_number: String,
    pub supplier: String,
    pub lines: Vec<SkuQuantity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub receipt_id: Uuid,
    pub po_number: String,
    pub lines: Vec<SkuQuantity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutawayPlanned {
    pub task_id: Uuid,
    pub receipt_id: Uuid,
    pub sku: String,
    pub quantity: u32,
    pub target: Option<BinLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutawayCompleted {
    pub task_id: Uuid,
    pub sku: String,
    pub quantity: u32,
    pub bin_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAdjusted {
    pub sku: String,
    pub delta: i64,
    pub reason: String,
    pub available_after: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleCountRecorded {
    pub sku: String,
    pub expected: i64,
    pub counted: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStaged {
    pub order_id: Uuid,
    pub courier: String,
    pub staging_area: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestReadinessChecked {
    pub courier: String,
    pub staged_count: usize,
    pub batch_size: usize,
    pub past_cutoff: bool,
    pub generate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestGenerated {
    pub manifest_id: Uuid,
    pub manifest_number: String,
    pub courier: String,
    pub order_ids: Vec<Uuid>,
    pub trigger: ManifestTrigger,
}

/// Late staged orders joined to a manifest that is still open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMembersAdded {
    pub manifest_id: Uuid,
    pub manifest_number: String,
    pub courier: String,
    pub order_ids: Vec<Uuid>,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageScanned {
    pub manifest_id: Uuid,
    pub order_id: Uuid,
    pub code: String,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMismatch {
    pub manifest_id: Uuid,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub manifest_id: Uuid,
    pub manifest_number: String,
    pub courier: String,
    pub order_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDispatched {
    pub order_id: Uuid,
    pub manifest_id: Uuid,
    pub courier: String,
    pub tracking_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerNotified {
    pub order_id: Uuid,
    pub message_id: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DispatchExceptionType {
    ScanMismatch,
    DamagedPackage,
    MissingPackage,
    MissingCourier,
    LabelError,
    CourierNoShow,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchExceptionRaised {
    pub order_id: Option<Uuid>,
    pub manifest_id: Option<Uuid>,
    pub exception_type: DispatchExceptionType,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorNotified {
    pub order_id: Option<Uuid>,
    pub manifest_id: Option<Uuid>,
    pub exception_type: DispatchExceptionType,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorOverride {
    pub order_id: Uuid,
    pub supervisor: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCreated {
    pub route_id: Uuid,
    pub route_number: String,
    pub manifest_id: Uuid,
    pub city: String,
    pub order_ids: Vec<Uuid>,
    pub estimated_distance_km: f64,
    pub estimated_duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverAssigned {
    pub route_id: Uuid,
    pub driver_id: Uuid,
    pub driver_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRef {
    pub route_id: Uuid,
    pub driver_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutForDelivery {
    pub order_id: Uuid,
    pub route_id: Uuid,
    pub driver_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryCompleted {
    pub order_id: Uuid,
    pub route_id: Uuid,
    pub recipient_name: String,
    pub location: GeoPoint,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailed {
    pub order_id: Uuid,
    pub route_id: Uuid,
    pub reason: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRescheduled {
    pub order_id: Uuid,
    pub route_id: Uuid,
    pub reason: String,
    pub next_attempt: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCompleted {
    pub route_id: Uuid,
    pub delivered: usize,
    pub failed: usize,
    pub rescheduled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFailed {
    pub delivery_id: Uuid,
    pub order_id: Option<Uuid>,
    pub purpose: NotificationPurpose,
    pub recipient: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResent {
    pub delivery_id: Uuid,
    pub message_id: String,
}
