use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{
    AdjustmentKind, BinLocation, InventoryAdjustment, InventoryRecord, Shortage, SkuQuantity,
};
use crate::errors::{InventoryError, ServiceError};
use crate::store::{EntityStore, Repository};

/// Result of an all-or-nothing allocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    Allocated(Vec<SkuQuantity>),
    StockShortage(Vec<Shortage>),
}

/// Stock ledger. Every quantity change goes through a compare-and-update on
/// the SKU's record, so concurrent reservations can never oversell.
#[derive(Clone)]
pub struct InventoryLedger {
    records: Repository<InventoryRecord>,
    adjustments: Repository<InventoryAdjustment>,
    clock: Arc<dyn Clock>,
}

/// Sums quantities per SKU, keeping first-seen order.
fn aggregate(lines: &[SkuQuantity]) -> Vec<SkuQuantity> {
    let mut order: Vec<String> = Vec::new();
    let mut totals: BTreeMap<String, u32> = BTreeMap::new();
    for line in lines {
        if !totals.contains_key(&line.sku) {
            order.push(line.sku.clone());
        }
        *totals.entry(line.sku.clone()).or_insert(0) += line.quantity;
    }
    order
        .into_iter()
        .map(|sku| {
            let quantity = totals.get(&sku).copied().unwrap_or(0);
            SkuQuantity { sku, quantity }
        })
        .collect()
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Repository::new(store.clone()),
            adjustments: Repository::new(store),
            clock,
        }
    }

    pub async fn get(&self, sku: &str) -> Result<Option<InventoryRecord>, InventoryError> {
        self.records.get(InventoryRecord::id_for_sku(sku)).await
    }

    pub async fn all(&self) -> Result<Vec<InventoryRecord>, InventoryError> {
        self.records.all().await
    }

    /// Creates the SKU or overwrites its available quantity and primary bin.
    #[instrument(skip(self, description, primary_bin))]
    pub async fn upsert_sku(
        &self,
        sku: &str,
        description: &str,
        available: i64,
        primary_bin: Option<BinLocation>,
    ) -> Result<InventoryRecord, InventoryError> {
        if available < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Available quantity for {} cannot be negative",
                sku
            )));
        }
        let id = InventoryRecord::id_for_sku(sku);
        let now = self.clock.now();
        if self.records.get(id).await?.is_some() {
            let (record, _) = self
                .records
                .update_with(id, |record| {
                    record.available_quantity = available;
                    record.description = description.to_string();
                    record.primary_bin = primary_bin.clone();
                    record.updated_at = now;
                    Ok(())
                })
                .await?;
            return Ok(record);
        }

        let record = InventoryRecord {
            id,
            sku: sku.to_string(),
            description: description.to_string(),
            available_quantity: available,
            reserved_quantity: 0,
            primary_bin,
            updated_at: now,
        };
        self.records.insert(&record).await?;
        Ok(record)
    }

    /// Reserves every line or none of them.
    ///
    /// Lines are reserved one SKU at a time; if any SKU is short, the lines
    /// already reserved in this call are released again before returning
    /// [`AllocationOutcome::StockShortage`].
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn allocate(
        &self,
        lines: &[SkuQuantity],
    ) -> Result<AllocationOutcome, InventoryError> {
        let wanted = aggregate(lines);
        let mut reserved: Vec<SkuQuantity> = Vec::new();
        let mut shortages: Vec<Shortage> = Vec::new();

        for line in &wanted {
            match self.try_reserve(line).await? {
                None => reserved.push(line.clone()),
                Some(shortage) => {
                    warn!(
                        sku = %shortage.sku,
                        requested = shortage.requested,
                        available = shortage.available,
                        "stock shortage during allocation"
                    );
                    shortages.push(shortage);
                }
            }
        }

        if shortages.is_empty() {
            info!(skus = reserved.len(), "inventory allocated");
            return Ok(AllocationOutcome::Allocated(reserved));
        }

        if !reserved.is_empty() {
            self.release(&reserved).await?;
        }
        Ok(AllocationOutcome::StockShortage(shortages))
    }

    async fn try_reserve(&self, line: &SkuQuantity) -> Result<Option<Shortage>, InventoryError> {
        let id = InventoryRecord::id_for_sku(&line.sku);
        if self.records.get(id).await?.is_none() {
            return Ok(Some(Shortage {
                sku: line.sku.clone(),
                requested: line.quantity,
                available: 0,
            }));
        }

        let now = self.clock.now();
        let quantity = i64::from(line.quantity);
        let (_, shortage) = self
            .records
            .update_with(id, |record| {
                if record.available_quantity < quantity {
                    return Ok(Some(Shortage {
                        sku: record.sku.clone(),
                        requested: line.quantity,
                        available: record.available_quantity,
                    }));
                }
                record.available_quantity -= quantity;
                record.reserved_quantity += quantity;
                record.updated_at = now;
                Ok(None)
            })
            .await?;
        Ok(shortage)
    }

    /// Returns reserved quantities to available. Reserved never drops below zero,
    /// so releasing more than was reserved only returns what was actually held.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn release(&self, lines: &[SkuQuantity]) -> Result<Vec<SkuQuantity>, InventoryError> {
        let mut released = Vec::new();
        for line in aggregate(lines) {
            let id = InventoryRecord::id_for_sku(&line.sku);
            if self.records.get(id).await?.is_none() {
                debug!(sku = %line.sku, "release for unknown sku ignored");
                continue;
            }
            let now = self.clock.now();
            let (_, moved) = self
                .records
                .update_with(id, |record| {
                    let moved = record.reserved_quantity.min(i64::from(line.quantity)).max(0);
                    record.reserved_quantity -= moved;
                    record.available_quantity += moved;
                    record.updated_at = now;
                    Ok(moved)
                })
                .await?;
            if moved > 0 {
                released.push(SkuQuantity::new(line.sku.clone(), moved as u32));
            }
        }
        Ok(released)
    }

    /// Removes shipped quantities from reserved. Floors at zero like [`Self::release`].
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn consume(&self, lines: &[SkuQuantity]) -> Result<Vec<SkuQuantity>, InventoryError> {
        let mut consumed = Vec::new();
        for line in aggregate(lines) {
            let id = InventoryRecord::id_for_sku(&line.sku);
            if self.records.get(id).await?.is_none() {
                continue;
            }
            let now = self.clock.now();
            let (_, moved) = self
                .records
                .update_with(id, |record| {
                    let moved = record.reserved_quantity.min(i64::from(line.quantity)).max(0);
                    record.reserved_quantity -= moved;
                    record.updated_at = now;
                    Ok(moved)
                })
                .await?;
            if moved > 0 {
                consumed.push(SkuQuantity::new(line.sku.clone(), moved as u32));
            }
        }
        Ok(consumed)
    }

    /// Applies a signed change to available stock and writes an audit row.
    /// A change that would take available below zero is rejected.
    #[instrument(skip(self, reason))]
    pub async fn adjust(
        &self,
        sku: &str,
        delta: i64,
        reason: &str,
        kind: AdjustmentKind,
    ) -> Result<InventoryAdjustment, InventoryError> {
        let id = InventoryRecord::id_for_sku(sku);
        let now = self.clock.now();

        let available_after = if self.records.get(id).await?.is_none() {
            if delta < 0 {
                return Err(ServiceError::InsufficientStock(format!(
                    "Cannot remove {} units of unknown SKU {}",
                    -delta, sku
                )));
            }
            self.records
                .insert(&InventoryRecord {
                    id,
                    sku: sku.to_string(),
                    description: sku.to_string(),
                    available_quantity: delta,
                    reserved_quantity: 0,
                    primary_bin: None,
                    updated_at: now,
                })
                .await?;
            delta
        } else {
            let (record, _) = self
                .records
                .update_with(id, |record| {
                    let next = record.available_quantity + delta;
                    if next < 0 {
                        return Err(ServiceError::InsufficientStock(format!(
                            "Adjustment of {} would leave SKU {} at {}",
                            delta, record.sku, next
                        )));
                    }
                    record.available_quantity = next;
                    record.updated_at = now;
                    Ok(())
                })
                .await?;
            record.available_quantity
        };

        let adjustment = InventoryAdjustment {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            kind,
            delta,
            reason: reason.to_string(),
            available_after,
            created_at: now,
        };
        self.adjustments.insert(&adjustment).await?;
        info!(sku, delta, available_after, kind = %kind, "inventory adjusted");
        Ok(adjustment)
    }

    pub async fn adjustments_for(
        &self,
        sku: &str,
    ) -> Result<Vec<InventoryAdjustment>, InventoryError> {
        self.adjustments
            .query(crate::store::Filter::new().eq("sku", sku))
            .await
    }
}
