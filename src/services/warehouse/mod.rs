//! Warehouse execution (WMS): picking, packing, inbound receipts, putaway
//! and stock adjustments.
//!
//! The service reacts to orders released by OMS, drives them through
//! `picking → picked → packing → packed`, and hands them to dispatch with
//! `pack.task_completed`.

mod adjustments;
mod inbound;
mod packing;
mod picking;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{
    AllocationState, Bin, ExceptionCategory, GoodsReceipt, Order, OrderItem, OrderStatus,
    PackingTask, PickingTask, PutawayTask, SkuQuantity, TaskLine, TaskStatus,
};
use crate::errors::ServiceError;
use crate::events::payloads::{InventoryMovement, OrderCheckpointReached, OrderRef};
use crate::events::{EntityRef, EventBus, EventCode, EventPayload, EventRecord, ModuleName};
use crate::services::inventory::InventoryLedger;
use crate::services::order_status::{apply_transition, raise_order_exception};
use crate::store::{EntityType, Filter, Repository};

pub use inbound::PurchaseOrder;

pub struct WarehouseService {
    bus: Arc<EventBus>,
    orders: Repository<Order>,
    items: Repository<OrderItem>,
    picks: Repository<PickingTask>,
    packs: Repository<PackingTask>,
    bins: Repository<Bin>,
    receipts: Repository<GoodsReceipt>,
    putaways: Repository<PutawayTask>,
    ledger: Arc<InventoryLedger>,
    clock: Arc<dyn Clock>,
}

impl WarehouseService {
    pub fn new(bus: Arc<EventBus>, ledger: Arc<InventoryLedger>, clock: Arc<dyn Clock>) -> Self {
        let store = bus.store();
        Self {
            orders: Repository::new(store.clone()),
            items: Repository::new(store.clone()),
            picks: Repository::new(store.clone()),
            packs: Repository::new(store.clone()),
            bins: Repository::new(store.clone()),
            receipts: Repository::new(store.clone()),
            putaways: Repository::new(store),
            bus,
            ledger,
            clock,
        }
    }

    pub fn register(self: &Arc<Self>) {
        let bus = &self.bus;
        bus.subscribe_with(
            EventCode::OrderReadyForWms,
            "wms.receive_order",
            self.clone(),
            |svc, event| async move {
                let EventPayload::OrderReadyForWms(ready) = event.payload else {
                    return Ok(());
                };
                svc.emit_for_order(
                    ready.order_id,
                    EventPayload::WmsOrderReceived(OrderRef {
                        order_id: ready.order_id,
                        saylogix_number: ready.saylogix_number,
                    }),
                )
                .await
            },
        );
        bus.subscribe_with(
            EventCode::WmsOrderReceived,
            "wms.create_pick_task",
            self.clone(),
            |svc, event| async move {
                let EventPayload::WmsOrderReceived(received) = event.payload else {
                    return Ok(());
                };
                svc.create_picking_task(received.order_id).await.map(|_| ())
            },
        );
        bus.subscribe_with(
            EventCode::PickTaskCompleted,
            "wms.picking_done",
            self.clone(),
            |svc, event| async move {
                let EventPayload::PickTaskCompleted(task) = event.payload else {
                    return Ok(());
                };
                svc.on_picking_completed(task.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::PackTaskCompleted,
            "wms.packing_done",
            self.clone(),
            |svc, event| async move {
                let EventPayload::PackTaskCompleted(task) = event.payload else {
                    return Ok(());
                };
                svc.on_packing_completed(task.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::PurchaseOrderReceived,
            "wms.receive_goods",
            self.clone(),
            |svc, event| async move { svc.on_purchase_order(event).await },
        );
        bus.subscribe_with(
            EventCode::OrderDispatched,
            "wms.consume_reservation",
            self.clone(),
            |svc, event| async move {
                let EventPayload::OrderDispatched(dispatched) = event.payload else {
                    return Ok(());
                };
                svc.consume_for_order(dispatched.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::OrderCancelled,
            "wms.cancel_tasks",
            self.clone(),
            |svc, event| async move {
                let EventPayload::OrderCancelled(cancelled) = event.payload else {
                    return Ok(());
                };
                svc.cancel_open_tasks(cancelled.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::OrderExceptionResolved,
            "wms.reopen_tasks",
            self.clone(),
            |svc, event| async move { svc.on_exception_resolved(event).await },
        );
    }

    async fn emit_for_order(
        &self,
        order_id: Uuid,
        payload: EventPayload,
    ) -> Result<(), ServiceError> {
        self.bus
            .emit(ModuleName::Wms, EntityRef::order(order_id), payload)
            .await?;
        Ok(())
    }

    async fn emit_for(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        payload: EventPayload,
    ) -> Result<(), ServiceError> {
        self.bus
            .emit(ModuleName::Wms, EntityRef::new(entity_type, entity_id), payload)
            .await?;
        Ok(())
    }

    /// Moves the order forward on behalf of the warehouse. Returns whether it moved.
    async fn advance_order(
        &self,
        order_id: Uuid,
        to: OrderStatus,
    ) -> Result<(Order, bool), ServiceError> {
        let now = self.clock.now();
        self.orders
            .update_with(order_id, |o| apply_transition(o, to, ModuleName::Wms, now))
            .await
    }

    async fn park_order(
        &self,
        order_id: Uuid,
        category: ExceptionCategory,
        reason: &str,
    ) -> Result<(), ServiceError> {
        raise_order_exception(
            &self.bus,
            &self.orders,
            self.clock.as_ref(),
            order_id,
            category,
            reason,
            ModuleName::Wms,
        )
        .await?;
        Ok(())
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, ServiceError> {
        let mut items = self.items.query(Filter::new().eq("order_id", order_id)).await?;
        items.sort_by_key(|i| i.line_number);
        Ok(items)
    }

    async fn mark_items(
        &self,
        order_id: Uuid,
        picked: bool,
        packed: bool,
    ) -> Result<(), ServiceError> {
        for item in self.order_items(order_id).await? {
            self.items
                .update_with(item.id, |i| {
                    i.picked |= picked;
                    i.packed |= packed;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    async fn on_picking_completed(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let (order, moved) = self.advance_order(order_id, OrderStatus::Picked).await?;
        if moved {
            self.mark_items(order_id, true, false).await?;
            self.emit_for_order(
                order_id,
                EventPayload::OrderPicked(OrderCheckpointReached {
                    order_id,
                    saylogix_number: order.saylogix_number.clone(),
                    at: order.checkpoints.picked.unwrap_or(order.updated_at),
                }),
            )
            .await?;
        }
        if order.status == OrderStatus::Picked {
            self.create_packing_task(order_id).await?;
        }
        Ok(())
    }

    async fn on_packing_completed(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let (order, moved) = self.advance_order(order_id, OrderStatus::Packed).await?;
        if !moved {
            return Ok(());
        }
        self.mark_items(order_id, true, true).await?;
        info!(order = %order.saylogix_number, "order packed");
        self.emit_for_order(
            order_id,
            EventPayload::OrderPacked(OrderCheckpointReached {
                order_id,
                saylogix_number: order.saylogix_number.clone(),
                at: order.checkpoints.packed.unwrap_or(order.updated_at),
            }),
        )
        .await
    }

    /// Confirmed shipment: the reservation leaves the building.
    async fn consume_for_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let (_, consume) = self
            .orders
            .update_with(order_id, |o| {
                if o.allocation != AllocationState::Allocated {
                    return Ok(false);
                }
                o.allocation = AllocationState::Consumed;
                Ok(true)
            })
            .await?;
        if !consume {
            debug!(order_id = %order_id, "no reservation to consume");
            return Ok(());
        }

        let lines: Vec<SkuQuantity> = self
            .order_items(order_id)
            .await?
            .into_iter()
            .map(|i| SkuQuantity::new(i.sku, i.quantity))
            .collect();
        let consumed = self.ledger.consume(&lines).await?;
        self.emit_for_order(
            order_id,
            EventPayload::InventoryShipped(InventoryMovement {
                order_id,
                lines: consumed,
            }),
        )
        .await
    }

    async fn cancel_open_tasks(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let now = self.clock.now();
        for task in self.picks.query(Filter::new().eq("order_id", order_id)).await? {
            if task.status.is_open() || task.status == TaskStatus::Exception {
                self.picks
                    .update_with(task.id, |t| {
                        t.status = TaskStatus::Cancelled;
                        t.completed_at = Some(now);
                        Ok(())
                    })
                    .await?;
            }
        }
        for task in self.packs.query(Filter::new().eq("order_id", order_id)).await? {
            if task.status.is_open() || task.status == TaskStatus::Exception {
                self.packs
                    .update_with(task.id, |t| {
                        t.status = TaskStatus::Cancelled;
                        t.completed_at = Some(now);
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// A resolved picking or packing exception puts its task back in progress.
    async fn on_exception_resolved(&self, event: EventRecord) -> Result<(), ServiceError> {
        let EventPayload::OrderExceptionResolved(resolved) = event.payload else {
            return Ok(());
        };
        match resolved.category {
            ExceptionCategory::Picking => {
                for task in self.picks.query(Filter::new().eq("order_id", resolved.order_id)).await? {
                    if task.status == TaskStatus::Exception {
                        self.picks
                            .update_with(task.id, |t| {
                                t.status = TaskStatus::InProgress;
                                t.exception_reason = None;
                                Ok(())
                            })
                            .await?;
                    }
                }
            }
            ExceptionCategory::Packing => {
                for task in self.packs.query(Filter::new().eq("order_id", resolved.order_id)).await? {
                    if task.status == TaskStatus::Exception {
                        self.packs
                            .update_with(task.id, |t| {
                                t.status = TaskStatus::InProgress;
                                t.exception_reason = None;
                                Ok(())
                            })
                            .await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn picking_task_for(
        &self,
        order_id: Uuid,
    ) -> Result<Option<PickingTask>, ServiceError> {
        Ok(self
            .picks
            .query(Filter::new().eq("order_id", order_id))
            .await?
            .into_iter()
            .next())
    }

    pub async fn packing_task_for(
        &self,
        order_id: Uuid,
    ) -> Result<Option<PackingTask>, ServiceError> {
        Ok(self
            .packs
            .query(Filter::new().eq("order_id", order_id))
            .await?
            .into_iter()
            .next())
    }
}

/// Adds `quantity` scanned units of `sku` to the first unsatisfied line for
/// that SKU (or the last line for it when all are satisfied).
pub(crate) fn record_scan(
    lines: &mut [TaskLine],
    sku: &str,
    quantity: u32,
) -> Result<(u32, u32), ServiceError> {
    let sku = sku.trim();
    let position = lines
        .iter()
        .position(|l| l.sku == sku && !l.is_satisfied())
        .or_else(|| lines.iter().rposition(|l| l.sku == sku))
        .ok_or_else(|| ServiceError::ValidationError(format!("SKU {} is not part of this task", sku)))?;
    let line = &mut lines[position];
    line.scanned_quantity += quantity;
    Ok((line.scanned_quantity, line.requested_quantity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::all_lines_satisfied;

    fn line(sku: &str, requested: u32) -> TaskLine {
        TaskLine {
            sku: sku.into(),
            location: None,
            requested_quantity: requested,
            scanned_quantity: 0,
        }
    }

    #[test]
    fn task_completes_only_when_every_line_is_satisfied() {
        let mut lines = vec![line("SKU-A", 3), line("SKU-B", 5)];
        record_scan(&mut lines, "SKU-A", 3).unwrap();
        record_scan(&mut lines, "SKU-B", 4).unwrap();
        assert!(!all_lines_satisfied(&lines));

        record_scan(&mut lines, "SKU-B", 1).unwrap();
        assert!(all_lines_satisfied(&lines));
    }

    #[test]
    fn scans_fill_duplicate_sku_lines_in_order() {
        let mut lines = vec![line("SKU-A", 1), line("SKU-A", 2)];
        assert_eq!(record_scan(&mut lines, "SKU-A", 1).unwrap(), (1, 1));
        assert_eq!(record_scan(&mut lines, "SKU-A", 2).unwrap(), (2, 2));
        assert!(record_scan(&mut lines, "SKU-Z", 1).is_err());
    }
}
