//! The closed event taxonomy.
//!
//! Every event the system can emit is declared once in the table below. The
//! macro expands it into [`EventCode`] (the stable `EV###` identifier plus the
//! dotted type name) and [`EventPayload`] (the typed body), so a payload can
//! never be published under the wrong code.

use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter};

use super::payloads::*;
use super::ModuleName;

macro_rules! event_taxonomy {
    ($( $variant:ident => $id:literal, $name:literal, $owner:ident, $payload:ty; )*) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, EnumIter, EnumCount,
        )]
        pub enum EventCode {
            $( $variant, )*
        }

        impl EventCode {
            /// Stable identifier, e.g. `EV001`.
            pub fn event_id(self) -> &'static str {
                match self {
                    $( EventCode::$variant => $id, )*
                }
            }

            /// Dotted name, e.g. `order.fetched`.
            pub fn event_type(self) -> &'static str {
                match self {
                    $( EventCode::$variant => $name, )*
                }
            }

            /// Module expected to emit this event.
            pub fn owner(self) -> ModuleName {
                match self {
                    $( EventCode::$variant => ModuleName::$owner, )*
                }
            }

            pub fn from_event_id(event_id: &str) -> Option<Self> {
                match event_id {
                    $( $id => Some(EventCode::$variant), )*
                    _ => None,
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "code", content = "data")]
        pub enum EventPayload {
            $( $variant($payload), )*
        }

        impl EventPayload {
            pub fn code(&self) -> EventCode {
                match self {
                    $( EventPayload::$variant(_) => EventCode::$variant, )*
                }
            }
        }
    };
}

event_taxonomy! {
    // Order management
    OrderFetched                => "EV001", "order.fetched", Oms, OrderFetched;
    OrderValidationStarted      => "EV002", "order.validation_started", Oms, OrderRef;
    OrderValidated              => "EV003", "order.validated", Oms, OrderValidated;
    OrderValidationFailed       => "EV004", "order.validation_failed", Oms, ValidationFailed;
    OrderPriorityAssigned       => "EV005", "order.priority_assigned", Oms, PriorityAssigned;
    CourierAssignmentRequested  => "EV006", "courier.assignment_requested", Oms, OrderRef;
    CourierAssigned             => "EV007", "courier.assigned", Oms, CourierAssigned;
    CourierAssignmentFailed     => "EV008", "courier.assignment_failed", Oms, OrderFailure;
    InventoryAllocationRequested => "EV009", "inventory.allocation_requested", Oms, OrderRef;
    InventoryAllocated          => "EV010", "inventory.allocated", Oms, InventoryMovement;
    InventoryStockShortage      => "EV011", "inventory.stock_shortage", Oms, StockShortage;
    OrderReadinessChecked       => "EV012", "order.readiness_checked", Oms, ReadinessChecked;
    OrderReadyForWms            => "EV013", "order.ready_for_wms", Oms, OrderReady;
    OrderCorrected              => "EV014", "order.corrected", Oms, OrderCorrected;
    OrderCancelled              => "EV015", "order.cancelled", Oms, OrderCancelled;
    InventoryReleased           => "EV016", "inventory.released", Oms, InventoryMovement;
    OrderExceptionRaised        => "EV017", "order.exception_raised", Oms, ExceptionRaised;
    OrderExceptionOverride      => "EV018", "order.exception_override", Oms, ExceptionOverride;
    OrderExceptionResolved      => "EV019", "order.exception_resolved", Oms, ExceptionResolved;
    OrderAddressConfirmed       => "EV020", "order.address_confirmed", Oms, OrderRef;

    // Address verification
    AddressVerificationRequested => "EV101", "address.verification_requested", Oms, VerificationRequested;
    AddressCacheHit             => "EV102", "address.cache_hit", Nas, AddressCodeResolved;
    AddressRegistryResolved     => "EV103", "address.registry_resolved", Nas, AddressCodeResolved;
    AddressCodeUnresolved       => "EV104", "address.code_unresolved", Nas, AddressCodeUnresolved;
    AddressConfirmationRequested => "EV105", "address.confirmation_requested", Nas, ConfirmationRequested;
    AddressReplyReceived        => "EV106", "address.reply_received", Nas, CustomerReply;
    AddressVerified             => "EV107", "address.verified", Nas, AddressVerified;
    AddressVerificationFailed   => "EV108", "address.verification_failed", Nas, OrderFailure;
    AddressManualOverride       => "EV109", "address.manual_override", Nas, ManualOverride;
    AddressAccuracyConfirmed    => "EV110", "address.accuracy_confirmed", Nas, AccuracyChecked;
    AddressAccuracyFlagged      => "EV111", "address.accuracy_flagged", Nas, AccuracyChecked;

    // Warehouse
    WmsOrderReceived            => "EV201", "wms.order_received", Wms, OrderRef;
    PickTaskCreated             => "EV202", "pick.task_created", Wms, TaskCreated;
    PickTaskAssigned            => "EV203", "pick.task_assigned", Wms, TaskAssigned;
    PickTaskStarted             => "EV204", "pick.task_started", Wms, TaskRef;
    PickItemScanned             => "EV205", "pick.item_scanned", Wms, ItemScanned;
    PickTaskCompleted           => "EV206", "pick.task_completed", Wms, TaskRef;
    PickTaskException           => "EV207", "pick.task_exception", Wms, TaskException;
    OrderPicked                 => "EV208", "order.picked", Wms, OrderCheckpointReached;
    PackTaskCreated             => "EV209", "pack.task_created", Wms, TaskCreated;
    PackTaskAssigned            => "EV210", "pack.task_assigned", Wms, TaskAssigned;
    PackTaskStarted             => "EV211", "pack.task_started", Wms, TaskRef;
    PackItemScanned             => "EV212", "pack.item_scanned", Wms, ItemScanned;
    PackLabelCaptured           => "EV213", "pack.label_captured", Wms, LabelCaptured;
    PackTaskCompleted           => "EV214", "pack.task_completed", Wms, PackCompleted;
    PackTaskException           => "EV215", "pack.task_exception", Wms, TaskException;
    OrderPacked                 => "EV216", "order.packed", Wms, OrderCheckpointReached;
    PurchaseOrderReceived       => "EV217", "inbound.po_received", Wms, PurchaseOrderReceived;
    GoodsReceived               => "EV218", "inbound.goods_received", Wms, GoodsReceived;
    PutawayTaskCreated          => "EV219", "putaway.task_created", Wms, PutawayPlanned;
    PutawayTaskCompleted        => "EV220", "putaway.task_completed", Wms, PutawayCompleted;
    PutawayNoBinAvailable       => "EV221", "putaway.no_bin_available", Wms, PutawayPlanned;
    InventoryAdjusted           => "EV222", "inventory.adjusted", Wms, InventoryAdjusted;
    CycleCountRecorded          => "EV223", "inventory.cycle_count_recorded", Wms, CycleCountRecorded;
    InventoryShipped            => "EV224", "inventory.shipped", Wms, InventoryMovement;

    // Dispatch
    OrderStaged                 => "EV301", "dispatch.order_staged", Dms, OrderStaged;
    ManifestReadinessChecked    => "EV302", "manifest.readiness_checked", Dms, ManifestReadinessChecked;
    ManifestGenerated           => "EV303", "manifest.generated", Dms, ManifestGenerated;
    ManifestPackageScanned      => "EV304", "manifest.package_scanned", Dms, PackageScanned;
    ManifestScanMismatch        => "EV305", "manifest.scan_mismatch", Dms, ScanMismatch;
    ManifestConfirmed           => "EV306", "manifest.confirmed", Dms, ManifestSummary;
    OrderDispatched             => "EV307", "order.dispatched", Dms, OrderDispatched;
    TrackingLinkSent            => "EV308", "notify.tracking_link_sent", Dms, CustomerNotified;
    DispatchExceptionRaised     => "EV309", "dispatch.exception_raised", Dms, DispatchExceptionRaised;
    SupervisorNotified          => "EV310", "dispatch.supervisor_notified", Dms, SupervisorNotified;
    SupervisorOverride          => "EV311", "dispatch.supervisor_override", Dms, SupervisorOverride;
    ManifestDispatched          => "EV312", "manifest.dispatched", Dms, ManifestSummary;
    ManifestMembersAdded        => "EV313", "manifest.members_added", Dms, ManifestMembersAdded;

    // Last mile
    RouteCreated                => "EV401", "route.created", Lms, RouteCreated;
    RouteDriverAssigned         => "EV402", "route.driver_assigned", Lms, DriverAssigned;
    RouteNoDriverAvailable      => "EV403", "route.no_driver_available", Lms, RouteRef;
    RouteStarted                => "EV404", "route.started", Lms, RouteRef;
    OrderOutForDelivery         => "EV405", "order.out_for_delivery", Lms, OutForDelivery;
    DeliveryCompleted           => "EV406", "delivery.completed", Lms, DeliveryCompleted;
    DeliveryFailed              => "EV407", "delivery.failed", Lms, DeliveryFailed;
    DeliveryRescheduled         => "EV408", "delivery.rescheduled", Lms, DeliveryRescheduled;
    OrderDelivered              => "EV409", "order.delivered", Lms, OrderCheckpointReached;
    DeliveryConfirmationSent    => "EV410", "notify.delivery_confirmation_sent", Lms, CustomerNotified;
    RouteCompleted              => "EV411", "route.completed", Lms, RouteCompleted;
    RouteDriverReleased         => "EV412", "route.driver_released", Lms, RouteRef;

    // Outbound integrations
    NotificationFailed          => "EV501", "notify.permanently_failed", Integrations, NotificationFailed;
    NotificationResent          => "EV502", "notify.resent", Integrations, NotificationResent;
}
