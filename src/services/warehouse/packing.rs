use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{record_scan, WarehouseService};
use crate::entities::{
    all_lines_satisfied, ExceptionCategory, OrderStatus, PackingTask, TaskLine, TaskStatus,
};
use crate::errors::ServiceError;
use crate::events::payloads::{
    ItemScanned, LabelCaptured, PackCompleted, TaskAssigned, TaskCreated, TaskException, TaskRef,
};
use crate::events::EventPayload;
use crate::store::EntityType;

impl PackingTask {
    /// Everything needed to seal the parcel has been recorded.
    pub fn ready_to_complete(&self) -> bool {
        all_lines_satisfied(&self.lines) && self.weight_kg.is_some() && self.label.is_some()
    }
}

impl WarehouseService {
    /// Opens the packing task for a picked order, moving it to `packing`.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn create_packing_task(&self, order_id: Uuid) -> Result<PackingTask, ServiceError> {
        if let Some(existing) = self.packing_task_for(order_id).await? {
            return Ok(existing);
        }

        let lines: Vec<TaskLine> = self
            .order_items(order_id)
            .await?
            .into_iter()
            .map(|item| TaskLine {
                sku: item.sku,
                location: None,
                requested_quantity: item.quantity,
                scanned_quantity: 0,
            })
            .collect();

        let task = PackingTask {
            id: Uuid::new_v4(),
            order_id,
            status: TaskStatus::Pending,
            assigned_to: None,
            lines,
            weight_kg: None,
            label: None,
            exception_reason: None,
            created_at: self.clock.now(),
            completed_at: None,
        };
        self.packs.insert(&task).await?;
        self.advance_order(order_id, OrderStatus::Packing).await?;

        info!(task_id = %task.id, "packing task created");
        self.emit_for_order(
            order_id,
            EventPayload::PackTaskCreated(TaskCreated {
                task_id: task.id,
                order_id,
                lines: task.lines.clone(),
            }),
        )
        .await?;
        Ok(task)
    }

    pub async fn assign_packer(
        &self,
        task_id: Uuid,
        packer: &str,
    ) -> Result<PackingTask, ServiceError> {
        let packer = packer.trim();
        if packer.is_empty() {
            return Err(ServiceError::ValidationError("Packer is required".to_string()));
        }
        let (task, _) = self
            .packs
            .update_with(task_id, |t| {
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Packing task {} is {}",
                        t.id, t.status
                    )));
                }
                t.assigned_to = Some(packer.to_string());
                if t.status == TaskStatus::Pending {
                    t.status = TaskStatus::Assigned;
                }
                Ok(())
            })
            .await?;

        self.emit_for_order(
            task.order_id,
            EventPayload::PackTaskAssigned(TaskAssigned {
                task_id,
                order_id: task.order_id,
                assignee: packer.to_string(),
            }),
        )
        .await?;
        Ok(task)
    }

    pub async fn start_packing(&self, task_id: Uuid) -> Result<PackingTask, ServiceError> {
        let (task, started) = self
            .packs
            .update_with(task_id, |t| match t.status {
                TaskStatus::Pending | TaskStatus::Assigned => {
                    t.status = TaskStatus::InProgress;
                    Ok(true)
                }
                TaskStatus::InProgress => Ok(false),
                other => Err(ServiceError::InvalidStatus(format!(
                    "Packing task {} is {}",
                    t.id, other
                ))),
            })
            .await?;

        if started {
            self.emit_for_order(
                task.order_id,
                EventPayload::PackTaskStarted(TaskRef {
                    task_id,
                    order_id: task.order_id,
                }),
            )
            .await?;
        }
        Ok(task)
    }

    pub async fn scan_pack(
        &self,
        task_id: Uuid,
        sku: &str,
        quantity: u32,
    ) -> Result<PackingTask, ServiceError> {
        if quantity == 0 {
            return Err(ServiceError::ValidationError("Scanned quantity must be positive".to_string()));
        }
        let (task, (scanned_total, requested)) = self
            .packs
            .update_with(task_id, |t| {
                match t.status {
                    TaskStatus::Pending | TaskStatus::Assigned => t.status = TaskStatus::InProgress,
                    TaskStatus::InProgress => {}
                    other => {
                        return Err(ServiceError::InvalidStatus(format!(
                            "Cannot scan into packing task {} while {}",
                            t.id, other
                        )))
                    }
                }
                record_scan(&mut t.lines, sku, quantity)
            })
            .await?;

        self.emit_for_order(
            task.order_id,
            EventPayload::PackItemScanned(ItemScanned {
                task_id,
                order_id: task.order_id,
                sku: sku.trim().to_string(),
                quantity,
                scanned_total,
                requested,
            }),
        )
        .await?;

        if task.ready_to_complete() {
            return self.complete_packing(task_id).await;
        }
        Ok(task)
    }

    /// Records the parcel weight and the courier label printed for it.
    pub async fn capture_label(
        &self,
        task_id: Uuid,
        weight_kg: f64,
        label: &str,
    ) -> Result<PackingTask, ServiceError> {
        if !(weight_kg > 0.0) {
            return Err(ServiceError::ValidationError("Parcel weight must be positive".to_string()));
        }
        let label = label.trim();
        if label.is_empty() {
            return Err(ServiceError::ValidationError("Label reference is required".to_string()));
        }

        let (task, _) = self
            .packs
            .update_with(task_id, |t| {
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Packing task {} is {}",
                        t.id, t.status
                    )));
                }
                t.weight_kg = Some(weight_kg);
                t.label = Some(label.to_string());
                Ok(())
            })
            .await?;

        self.emit_for_order(
            task.order_id,
            EventPayload::PackLabelCaptured(LabelCaptured {
                task_id,
                order_id: task.order_id,
                weight_kg,
                label: label.to_string(),
            }),
        )
        .await?;

        if task.ready_to_complete() {
            return self.complete_packing(task_id).await;
        }
        Ok(task)
    }

    /// Seals the parcel. Requires every line scanned plus weight and label.
    pub async fn complete_packing(&self, task_id: Uuid) -> Result<PackingTask, ServiceError> {
        let now = self.clock.now();
        let (task, completed) = self
            .packs
            .update_with(task_id, |t| {
                if t.status == TaskStatus::Completed {
                    return Ok(false);
                }
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Packing task {} is {}",
                        t.id, t.status
                    )));
                }
                if !all_lines_satisfied(&t.lines) {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Packing task {} has unscanned lines",
                        t.id
                    )));
                }
                if t.weight_kg.is_none() || t.label.is_none() {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Packing task {} needs weight and label before completion",
                        t.id
                    )));
                }
                t.status = TaskStatus::Completed;
                t.completed_at = Some(now);
                Ok(true)
            })
            .await?;

        if completed {
            info!(task_id = %task_id, order_id = %task.order_id, "packing completed");
            self.emit_for_order(
                task.order_id,
                EventPayload::PackTaskCompleted(PackCompleted {
                    task_id,
                    order_id: task.order_id,
                    weight_kg: task.weight_kg.unwrap_or_default(),
                    label: task.label.clone().unwrap_or_default(),
                }),
            )
            .await?;
        }
        Ok(task)
    }

    pub async fn report_pack_exception(
        &self,
        task_id: Uuid,
        reason: &str,
    ) -> Result<PackingTask, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError("Exception reason is required".to_string()));
        }
        let (task, _) = self
            .packs
            .update_with(task_id, |t| {
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Packing task {} is {}",
                        t.id, t.status
                    )));
                }
                t.status = TaskStatus::Exception;
                t.exception_reason = Some(reason.to_string());
                Ok(())
            })
            .await?;

        warn!(task_id = %task_id, order_id = %task.order_id, reason, "packing exception");
        self.emit_for(
            EntityType::PackingTask,
            task_id,
            EventPayload::PackTaskException(TaskException {
                task_id,
                order_id: task.order_id,
                reason: reason.to_string(),
            }),
        )
        .await?;
        self.park_order(task.order_id, ExceptionCategory::Packing, reason)
            .await?;
        Ok(task)
    }
}
