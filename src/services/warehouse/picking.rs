use std::cmp::Ordering;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{record_scan, WarehouseService};
use crate::entities::{
    all_lines_satisfied, ExceptionCategory, OrderStatus, PickingTask, TaskLine, TaskStatus,
};
use crate::errors::ServiceError;
use crate::events::payloads::{ItemScanned, TaskAssigned, TaskCreated, TaskException, TaskRef};
use crate::events::EventPayload;
use crate::store::{EntityType, Filter};

/// Sorts lines along the pick path. Lines without a known location go last,
/// and equal locations keep their order-line order.
pub(crate) fn sort_pick_path(lines: &mut [TaskLine]) {
    lines.sort_by(|a, b| match (&a.location, &b.location) {
        (Some(a), Some(b)) => a.path_key().cmp(&b.path_key()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

impl WarehouseService {
    /// Creates the picking task for a released order. Re-delivery of the
    /// release returns the existing task.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn create_picking_task(&self, order_id: Uuid) -> Result<PickingTask, ServiceError> {
        if let Some(existing) = self.picking_task_for(order_id).await? {
            return Ok(existing);
        }

        let mut lines = Vec::new();
        for item in self.order_items(order_id).await? {
            let location = self
                .ledger
                .get(&item.sku)
                .await?
                .and_then(|record| record.primary_bin);
            lines.push(TaskLine {
                sku: item.sku,
                location,
                requested_quantity: item.quantity,
                scanned_quantity: 0,
            });
        }
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} has no items to pick",
                order_id
            )));
        }
        sort_pick_path(&mut lines);

        let task = PickingTask {
            id: Uuid::new_v4(),
            order_id,
            status: TaskStatus::Pending,
            assigned_to: None,
            lines,
            exception_reason: None,
            created_at: self.clock.now(),
            completed_at: None,
        };
        self.picks.insert(&task).await?;
        self.advance_order(order_id, OrderStatus::Picking).await?;

        info!(task_id = %task.id, lines = task.lines.len(), "picking task created");
        self.emit_for_order(
            order_id,
            EventPayload::PickTaskCreated(TaskCreated {
                task_id: task.id,
                order_id,
                lines: task.lines.clone(),
            }),
        )
        .await?;
        Ok(task)
    }

    pub async fn assign_picker(
        &self,
        task_id: Uuid,
        picker: &str,
    ) -> Result<PickingTask, ServiceError> {
        let picker = picker.trim();
        if picker.is_empty() {
            return Err(ServiceError::ValidationError("Picker is required".to_string()));
        }
        let (task, _) = self
            .picks
            .update_with(task_id, |t| {
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Picking task {} is {}",
                        t.id, t.status
                    )));
                }
                t.assigned_to = Some(picker.to_string());
                if t.status == TaskStatus::Pending {
                    t.status = TaskStatus::Assigned;
                }
                Ok(())
            })
            .await?;

        self.emit_for_order(
            task.order_id,
            EventPayload::PickTaskAssigned(TaskAssigned {
                task_id,
                order_id: task.order_id,
                assignee: picker.to_string(),
            }),
        )
        .await?;
        Ok(task)
    }

    pub async fn start_picking(&self, task_id: Uuid) -> Result<PickingTask, ServiceError> {
        let (task, started) = self
            .picks
            .update_with(task_id, |t| match t.status {
                TaskStatus::Pending | TaskStatus::Assigned => {
                    t.status = TaskStatus::InProgress;
                    Ok(true)
                }
                TaskStatus::InProgress => Ok(false),
                other => Err(ServiceError::InvalidStatus(format!(
                    "Picking task {} is {}",
                    t.id, other
                ))),
            })
            .await?;

        if started {
            self.emit_for_order(
                task.order_id,
                EventPayload::PickTaskStarted(TaskRef {
                    task_id,
                    order_id: task.order_id,
                }),
            )
            .await?;
        }
        Ok(task)
    }

    /// Records a scan. The task completes on its own once every line is satisfied.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn scan_pick(
        &self,
        task_id: Uuid,
        sku: &str,
        quantity: u32,
    ) -> Result<PickingTask, ServiceError> {
        if quantity == 0 {
            return Err(ServiceError::ValidationError("Scanned quantity must be positive".to_string()));
        }
        let (task, (scanned_total, requested)) = self
            .picks
            .update_with(task_id, |t| {
                match t.status {
                    TaskStatus::Pending | TaskStatus::Assigned => t.status = TaskStatus::InProgress,
                    TaskStatus::InProgress => {}
                    other => {
                        return Err(ServiceError::InvalidStatus(format!(
                            "Cannot scan into picking task {} while {}",
                            t.id, other
                        )))
                    }
                }
                record_scan(&mut t.lines, sku, quantity)
            })
            .await?;

        self.emit_for_order(
            task.order_id,
            EventPayload::PickItemScanned(ItemScanned {
                task_id,
                order_id: task.order_id,
                sku: sku.trim().to_string(),
                quantity,
                scanned_total,
                requested,
            }),
        )
        .await?;

        if all_lines_satisfied(&task.lines) {
            return self.complete_picking(task_id).await;
        }
        Ok(task)
    }

    /// Completes the task. Every line must have been scanned in full.
    pub async fn complete_picking(&self, task_id: Uuid) -> Result<PickingTask, ServiceError> {
        let now = self.clock.now();
        let (task, completed) = self
            .picks
            .update_with(task_id, |t| {
                if t.status == TaskStatus::Completed {
                    return Ok(false);
                }
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Picking task {} is {}",
                        t.id, t.status
                    )));
                }
                if !all_lines_satisfied(&t.lines) {
                    let open: Vec<&str> = t
                        .lines
                        .iter()
                        .filter(|l| !l.is_satisfied())
                        .map(|l| l.sku.as_str())
                        .collect();
                    return Err(ServiceError::InvalidOperation(format!(
                        "Picking task {} has unscanned lines: {}",
                        t.id,
                        open.join(", ")
                    )));
                }
                t.status = TaskStatus::Completed;
                t.completed_at = Some(now);
                Ok(true)
            })
            .await?;

        if completed {
            info!(task_id = %task_id, order_id = %task.order_id, "picking completed");
            self.emit_for_order(
                task.order_id,
                EventPayload::PickTaskCompleted(TaskRef {
                    task_id,
                    order_id: task.order_id,
                }),
            )
            .await?;
        }
        Ok(task)
    }

    /// Flags the task (short pick, damaged item, wrong bin) and parks the order.
    pub async fn report_pick_exception(
        &self,
        task_id: Uuid,
        reason: &str,
    ) -> Result<PickingTask, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError("Exception reason is required".to_string()));
        }
        let (task, _) = self
            .picks
            .update_with(task_id, |t| {
                if !t.status.is_open() {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Picking task {} is {}",
                        t.id, t.status
                    )));
                }
                t.status = TaskStatus::Exception;
                t.exception_reason = Some(reason.to_string());
                Ok(())
            })
            .await?;

        warn!(task_id = %task_id, order_id = %task.order_id, reason, "picking exception");
        self.emit_for(
            EntityType::PickingTask,
            task_id,
            EventPayload::PickTaskException(TaskException {
                task_id,
                order_id: task.order_id,
                reason: reason.to_string(),
            }),
        )
        .await?;
        self.park_order(task.order_id, ExceptionCategory::Picking, reason)
            .await?;
        Ok(task)
    }

    pub async fn open_picking_tasks(&self) -> Result<Vec<PickingTask>, ServiceError> {
        Ok(self
            .picks
            .query(Filter::new())
            .await?
            .into_iter()
            .filter(|t| t.status.is_open())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::BinLocation;

    fn line(sku: &str, location: Option<BinLocation>) -> TaskLine {
        TaskLine {
            sku: sku.into(),
            location,
            requested_quantity: 1,
            scanned_quantity: 0,
        }
    }

    #[test]
    fn pick_path_follows_zone_aisle_shelf() {
        let mut lines = vec![
            line("UNSLOTTED", None),
            line("B-1", Some(BinLocation::new("B", 1, 1, "01"))),
            line("A-3", Some(BinLocation::new("A", 3, 1, "01"))),
            line("A-1-2", Some(BinLocation::new("A", 1, 2, "07"))),
            line("A-1-1", Some(BinLocation::new("A", 1, 1, "09"))),
        ];
        sort_pick_path(&mut lines);
        let skus: Vec<&str> = lines.iter().map(|l| l.sku.as_str()).collect();
        assert_eq!(skus, vec!["A-1-1", "A-1-2", "A-3", "B-1", "UNSLOTTED"]);
    }

    #[test]
    fn same_shelf_keeps_line_order() {
        let mut lines = vec![
            line("FIRST", Some(BinLocation::new("A", 1, 1, "09"))),
            line("SECOND", Some(BinLocation::new("A", 1, 1, "01"))),
        ];
        sort_pick_path(&mut lines);
        assert_eq!(lines[0].sku, "FIRST");
    }
}
