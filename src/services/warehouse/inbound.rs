use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::WarehouseService;
use crate::entities::{
    AdjustmentKind, Bin, BinLocation, GoodsReceipt, PutawayTask, SkuQuantity, TaskStatus,
};
use crate::errors::ServiceError;
use crate::events::payloads::{
    GoodsReceived, PurchaseOrderReceived, PutawayCompleted, PutawayPlanned,
};
use crate::events::{EventPayload, EventRecord};
use crate::store::{EntityType, Filter, StoreError};

/// A supplier delivery announced at the receiving dock.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PurchaseOrder {
    #[validate(length(min = 1, message = "PO number is required"))]
    pub po_number: String,
    #[validate(length(min = 1, message = "Supplier is required"))]
    pub supplier: String,
    #[validate(length(min = 1, message = "At least one line is required"))]
    pub lines: Vec<SkuQuantity>,
}

/// First bin with free space, in pick-path order.
fn first_bin_with_space(bins: &[Bin]) -> Option<&Bin> {
    bins.iter()
        .filter(|b| b.has_space())
        .min_by(|a, b| a.location.cmp(&b.location))
}

impl WarehouseService {
    pub async fn add_bin(&self, location: BinLocation, capacity: u32) -> Result<Bin, ServiceError> {
        if capacity == 0 {
            return Err(ServiceError::ValidationError("Bin capacity must be positive".to_string()));
        }
        let bin = Bin {
            id: Uuid::new_v4(),
            location,
            capacity,
            current_occupancy: 0,
        };
        self.bins.insert(&bin).await?;
        Ok(bin)
    }

    pub async fn bins(&self) -> Result<Vec<Bin>, ServiceError> {
        let mut bins = self.bins.all().await?;
        bins.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(bins)
    }

    /// Announces a supplier delivery. Receiving happens in the handler so a
    /// replayed announcement is absorbed by the receipt's fixed id.
    pub async fn receive_purchase_order(&self, po: PurchaseOrder) -> Result<(), ServiceError> {
        po.validate()?;
        if po.lines.iter().any(|l| l.quantity == 0) {
            return Err(ServiceError::ValidationError(
                "Received quantities must be positive".to_string(),
            ));
        }
        let po_number = po.po_number.trim().to_string();
        if po_number.is_empty() {
            return Err(ServiceError::ValidationError("PO number is required".to_string()));
        }
        self.emit_for(
            EntityType::GoodsReceipt,
            GoodsReceipt::id_for_po(&po_number),
            EventPayload::PurchaseOrderReceived(PurchaseOrderReceived {
                po_number,
                supplier: po.supplier,
                lines: po.lines,
            }),
        )
        .await
    }

    pub(super) async fn on_purchase_order(&self, event: EventRecord) -> Result<(), ServiceError> {
        let EventPayload::PurchaseOrderReceived(po) = event.payload else {
            return Ok(());
        };
        self.receive_goods(&po.po_number, &po.supplier, &po.lines)
            .await
            .map(|_| ())
    }

    /// Books received stock and plans putaway for each line. A purchase order
    /// is received at most once.
    ///
    /// The receipt is written only after every line is booked. A line that
    /// fails reverses the lines booked before it, so the delivery can be
    /// received again from scratch.
    #[instrument(skip(self, supplier, lines))]
    pub async fn receive_goods(
        &self,
        po_number: &str,
        supplier: &str,
        lines: &[SkuQuantity],
    ) -> Result<GoodsReceipt, ServiceError> {
        let po_number = po_number.trim();
        let receipt_id = GoodsReceipt::id_for_po(po_number);
        if let Some(existing) = self.receipts.get(receipt_id).await? {
            info!(po_number, "purchase order already received");
            return Ok(existing);
        }

        let reason = format!("PO {}", po_number);
        let mut booked: Vec<&SkuQuantity> = Vec::with_capacity(lines.len());
        for line in lines {
            let adjusted = self
                .ledger
                .adjust(&line.sku, i64::from(line.quantity), &reason, AdjustmentKind::Receipt)
                .await;
            if let Err(e) = adjusted {
                self.reverse_receipt(&booked, &reason).await?;
                return Err(e);
            }
            booked.push(line);
        }

        let receipt = GoodsReceipt {
            id: receipt_id,
            po_number: po_number.to_string(),
            supplier: supplier.to_string(),
            lines: lines.to_vec(),
            received_at: self.clock.now(),
        };
        match self.receipts.insert(&receipt).await {
            Ok(_) => {}
            Err(ServiceError::StoreError(StoreError::AlreadyExists { .. })) => {
                info!(po_number, "purchase order received concurrently, undoing duplicate booking");
                self.reverse_receipt(&booked, &reason).await?;
                return self.receipts.find(receipt_id).await;
            }
            Err(e) => {
                self.reverse_receipt(&booked, &reason).await?;
                return Err(e);
            }
        }

        self.emit_for(
            EntityType::GoodsReceipt,
            receipt.id,
            EventPayload::GoodsReceived(GoodsReceived {
                receipt_id: receipt.id,
                po_number: po_number.to_string(),
                lines: lines.to_vec(),
            }),
        )
        .await?;

        for line in lines {
            self.plan_putaway(receipt.id, line).await?;
        }
        Ok(receipt)
    }

    async fn reverse_receipt(
        &self,
        booked: &[&SkuQuantity],
        reason: &str,
    ) -> Result<(), ServiceError> {
        for line in booked {
            warn!(sku = %line.sku, quantity = line.quantity, "reversing received stock");
            self.ledger
                .adjust(
                    &line.sku,
                    -i64::from(line.quantity),
                    &format!("{} reversed", reason),
                    AdjustmentKind::Receipt,
                )
                .await?;
        }
        Ok(())
    }

    async fn plan_putaway(
        &self,
        receipt_id: Uuid,
        line: &SkuQuantity,
    ) -> Result<PutawayTask, ServiceError> {
        let bins = self.bins.all().await?;
        let target = first_bin_with_space(&bins);

        let task = PutawayTask {
            id: Uuid::new_v4(),
            receipt_id,
            sku: line.sku.clone(),
            quantity: line.quantity,
            target_bin_id: target.map(|b| b.id),
            target_location: target.map(|b| b.location.clone()),
            status: TaskStatus::Pending,
            created_at: self.clock.now(),
            completed_at: None,
        };
        self.putaways.insert(&task).await?;

        let planned = PutawayPlanned {
            task_id: task.id,
            receipt_id,
            sku: task.sku.clone(),
            quantity: task.quantity,
            target: task.target_location.clone(),
        };
        let payload = if task.target_bin_id.is_some() {
            EventPayload::PutawayTaskCreated(planned)
        } else {
            warn!(sku = %task.sku, "no bin with free space for putaway");
            EventPayload::PutawayNoBinAvailable(planned)
        };
        self.emit_for(EntityType::PutawayTask, task.id, payload).await?;
        Ok(task)
    }

    /// Confirms the goods are shelved. `bin_id` overrides the planned bin,
    /// which is required when none was available at planning time.
    pub async fn complete_putaway(
        &self,
        task_id: Uuid,
        bin_id: Option<Uuid>,
    ) -> Result<PutawayTask, ServiceError> {
        let now = self.clock.now();
        let planned = self.putaways.find(task_id).await?;
        if planned.status == TaskStatus::Completed {
            return Ok(planned);
        }
        let target = bin_id.or(planned.target_bin_id).ok_or_else(|| {
            ServiceError::InvalidOperation(format!("Putaway task {} has no target bin", task_id))
        })?;
        let quantity = planned.quantity;

        let (bin, _) = self
            .bins
            .update_with(target, |b| {
                b.current_occupancy = b.current_occupancy.saturating_add(quantity);
                Ok(())
            })
            .await?;
        let (task, _) = self
            .putaways
            .update_with(task_id, |t| {
                t.status = TaskStatus::Completed;
                t.target_bin_id = Some(bin.id);
                t.target_location = Some(bin.location.clone());
                t.completed_at = Some(now);
                Ok(())
            })
            .await?;

        self.emit_for(
            EntityType::PutawayTask,
            task_id,
            EventPayload::PutawayTaskCompleted(PutawayCompleted {
                task_id,
                sku: task.sku.clone(),
                quantity,
                bin_id: Some(bin.id),
            }),
        )
        .await?;
        Ok(task)
    }

    pub async fn putaway_tasks_for(
        &self,
        receipt_id: Uuid,
    ) -> Result<Vec<PutawayTask>, ServiceError> {
        self.putaways
            .query(Filter::new().eq("receipt_id", receipt_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(zone: &str, capacity: u32, occupancy: u32) -> Bin {
        Bin {
            id: Uuid::new_v4(),
            location: BinLocation::new(zone, 1, 1, "01"),
            capacity,
            current_occupancy: occupancy,
        }
    }

    #[test]
    fn putaway_skips_full_bins() {
        let bins = vec![bin("A", 10, 10), bin("C", 10, 0), bin("B", 10, 9)];
        let target = first_bin_with_space(&bins).unwrap();
        assert_eq!(target.location.zone, "B");
        assert!(first_bin_with_space(&[bin("A", 5, 5)]).is_none());
    }

    #[test]
    fn purchase_order_requires_lines() {
        let po = PurchaseOrder {
            po_number: "PO-1".into(),
            supplier: "Acme".into(),
            lines: vec![],
        };
        assert!(po.validate().is_err());
    }
}
