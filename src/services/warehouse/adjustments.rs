use tracing::info;

use super::WarehouseService;
use crate::entities::{AdjustmentKind, InventoryAdjustment, InventoryRecord};
use crate::errors::ServiceError;
use crate::events::payloads::{CycleCountRecorded, InventoryAdjusted};
use crate::events::EventPayload;
use crate::store::EntityType;

impl WarehouseService {
    /// Manual correction of available stock. A reason is mandatory.
    pub async fn adjust_inventory(
        &self,
        sku: &str,
        delta: i64,
        reason: &str,
    ) -> Result<InventoryAdjustment, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "Adjustment reason is required".to_string(),
            ));
        }
        if delta == 0 {
            return Err(ServiceError::ValidationError(
                "Adjustment quantity must not be zero".to_string(),
            ));
        }

        let adjustment = self
            .ledger
            .adjust(sku, delta, reason, AdjustmentKind::Manual)
            .await?;
        self.emit_for(
            EntityType::Inventory,
            InventoryRecord::id_for_sku(sku),
            EventPayload::InventoryAdjusted(InventoryAdjusted {
                sku: sku.to_string(),
                delta,
                reason: reason.to_string(),
                available_after: adjustment.available_after,
            }),
        )
        .await?;
        Ok(adjustment)
    }

    /// Reconciles a physical count against the ledger. The difference is
    /// booked against available stock; reserved units are assumed present.
    pub async fn record_cycle_count(
        &self,
        sku: &str,
        counted: i64,
    ) -> Result<CycleCountRecorded, ServiceError> {
        if counted < 0 {
            return Err(ServiceError::ValidationError(
                "Counted quantity cannot be negative".to_string(),
            ));
        }
        let record = self
            .ledger
            .get(sku)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("SKU {} not found", sku)))?;

        let expected = record.on_hand();
        let delta = counted - expected;
        if delta != 0 {
            self.ledger
                .adjust(
                    sku,
                    delta,
                    &format!("Cycle count: expected {}, counted {}", expected, counted),
                    AdjustmentKind::CycleCount,
                )
                .await?;
        }
        info!(sku, expected, counted, delta, "cycle count recorded");

        let recorded = CycleCountRecorded {
            sku: sku.to_string(),
            expected,
            counted,
            delta,
        };
        self.emit_for(
            EntityType::Inventory,
            record.id,
            EventPayload::CycleCountRecorded(recorded.clone()),
        )
        .await?;
        Ok(recorded)
    }
}
