use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::instrument;

use crate::clock::Clock;
use crate::entities::{
    AddressVerification, Checkpoint, Order, OrderStatus, VerificationStatus,
};
use crate::errors::ServiceError;
use crate::store::{EntityStore, Repository};

/// Stages measured between two checkpoints.
const STAGES: &[(&str, Checkpoint, Checkpoint)] = &[
    ("verification", Checkpoint::OrderFetched, Checkpoint::VerifyCompleted),
    ("validation", Checkpoint::OrderFetched, Checkpoint::OrderValidated),
    ("release", Checkpoint::OrderValidated, Checkpoint::OrderReleasedToWms),
    ("picking", Checkpoint::OrderReleasedToWms, Checkpoint::Picked),
    ("packing", Checkpoint::Picked, Checkpoint::Packed),
    ("dispatch", Checkpoint::Packed, Checkpoint::Dispatched),
    ("delivery", Checkpoint::Dispatched, Checkpoint::Delivered),
];

/// Orders currently in each status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total_orders: usize,
    pub orders_by_status: BTreeMap<String, usize>,
}

/// Open and historical exceptions per category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionReport {
    pub open_by_category: BTreeMap<String, usize>,
    pub resolved_by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub checkpoint: String,
    pub orders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDuration {
    pub stage: String,
    pub samples: usize,
    pub average_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleVerification {
    pub order_id: uuid::Uuid,
    pub customer_phone: String,
    pub waiting_minutes: i64,
}

/// Everything an operator dashboard shows, in one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentReport {
    pub generated_at: DateTime<Utc>,
    pub status: StatusSummary,
    pub exceptions: ExceptionReport,
    pub funnel: Vec<FunnelStep>,
    pub stage_durations: Vec<StageDuration>,
    pub stale_verifications: Vec<StaleVerification>,
    pub events_by_source: BTreeMap<String, usize>,
}

/// Read-only reporting over orders, verifications and the event log.
pub struct ReportService {
    store: Arc<dyn EntityStore>,
    orders: Repository<Order>,
    verifications: Repository<AddressVerification>,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl ReportService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        stale_after_minutes: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders: Repository::new(store.clone()),
            verifications: Repository::new(store.clone()),
            store,
            stale_after: Duration::minutes(stale_after_minutes),
            clock,
        }
    }

    pub async fn status_summary(&self) -> Result<StatusSummary, ServiceError> {
        let orders = self.orders.all().await?;
        Ok(summarize_statuses(&orders))
    }

    pub async fn exception_report(&self) -> Result<ExceptionReport, ServiceError> {
        let orders = self.orders.all().await?;
        Ok(summarize_exceptions(&orders))
    }

    /// Number of orders that reached each checkpoint.
    pub async fn checkpoint_funnel(&self) -> Result<Vec<FunnelStep>, ServiceError> {
        let orders = self.orders.all().await?;
        Ok(funnel(&orders))
    }

    pub async fn stage_durations(&self) -> Result<Vec<StageDuration>, ServiceError> {
        let orders = self.orders.all().await?;
        Ok(stage_durations(&orders))
    }

    /// Verifications still waiting on the customer after the stale threshold.
    pub async fn stale_verifications(&self) -> Result<Vec<StaleVerification>, ServiceError> {
        let now = self.clock.now();
        let mut stale: Vec<StaleVerification> = self
            .verifications
            .all()
            .await?
            .into_iter()
            .filter(|v| v.status == VerificationStatus::AwaitingCustomer)
            .filter(|v| now - v.requested_at > self.stale_after)
            .map(|v| StaleVerification {
                order_id: v.order_id,
                customer_phone: v.customer_phone,
                waiting_minutes: (now - v.requested_at).num_minutes(),
            })
            .collect();
        stale.sort_by(|a, b| b.waiting_minutes.cmp(&a.waiting_minutes));
        Ok(stale)
    }

    pub async fn events_by_source(&self) -> Result<BTreeMap<String, usize>, ServiceError> {
        let mut counts = BTreeMap::new();
        for record in self.store.query_events(None, None).await? {
            *counts.entry(record.source.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    pub async fn fulfillment_report(&self) -> Result<FulfillmentReport, ServiceError> {
        let orders = self.orders.all().await?;
        Ok(FulfillmentReport {
            generated_at: self.clock.now(),
            status: summarize_statuses(&orders),
            exceptions: summarize_exceptions(&orders),
            funnel: funnel(&orders),
            stage_durations: stage_durations(&orders),
            stale_verifications: self.stale_verifications().await?,
            events_by_source: self.events_by_source().await?,
        })
    }
}

fn summarize_statuses(orders: &[Order]) -> StatusSummary {
    let mut orders_by_status: BTreeMap<String, usize> =
        OrderStatus::iter().map(|s| (s.to_string(), 0)).collect();
    for order in orders {
        *orders_by_status.entry(order.status.to_string()).or_insert(0) += 1;
    }
    StatusSummary {
        total_orders: orders.len(),
        orders_by_status,
    }
}

fn summarize_exceptions(orders: &[Order]) -> ExceptionReport {
    let mut open_by_category = BTreeMap::new();
    let mut resolved_by_category = BTreeMap::new();
    for order in orders {
        if let Some(category) = order.exception_category() {
            *open_by_category.entry(category.to_string()).or_insert(0) += 1;
        }
        for resolved in &order.resolved_exceptions {
            *resolved_by_category
                .entry(resolved.category.to_string())
                .or_insert(0) += 1;
        }
    }
    ExceptionReport {
        open_by_category,
        resolved_by_category,
    }
}

fn funnel(orders: &[Order]) -> Vec<FunnelStep> {
    Checkpoint::iter()
        .map(|checkpoint| FunnelStep {
            checkpoint: checkpoint.to_string(),
            orders: orders
                .iter()
                .filter(|o| o.checkpoints.get(checkpoint).is_some())
                .count(),
        })
        .collect()
}

fn stage_durations(orders: &[Order]) -> Vec<StageDuration> {
    STAGES
        .iter()
        .map(|(stage, from, to)| {
            let samples: Vec<i64> = orders
                .iter()
                .filter_map(|o| {
                    let start = o.checkpoints.get(*from)?;
                    let end = o.checkpoints.get(*to)?;
                    Some((end - start).num_seconds())
                })
                .collect();
            let average_minutes = if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<i64>() as f64 / samples.len() as f64 / 60.0
            };
            StageDuration {
                stage: (*stage).to_string(),
                samples: samples.len(),
                average_minutes,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Address, AllocationState, Checkpoints, Customer};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn order(status: OrderStatus, checkpoints: Checkpoints) -> Order {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap();
        Order {
            id: Uuid::new_v4(),
            saylogix_number: "SLX-R".into(),
            channel: "salla".into(),
            channel_ref: Uuid::new_v4().to_string(),
            customer: Customer {
                name: "Reem".into(),
                phone: "+966500000002".into(),
                email: None,
            },
            shipping_address: Address {
                line1: "Olaya St".into(),
                line2: None,
                district: None,
                city: "Riyadh".into(),
                postal_code: None,
                country: "SA".into(),
                short_code: None,
                coordinates: None,
            },
            billing_address: None,
            order_value: Decimal::TEN,
            currency: "SAR".into(),
            status,
            priority: None,
            nas_verified: false,
            courier: None,
            allocation: AllocationState::Pending,
            exception: None,
            pending_exceptions: Vec::new(),
            resolved_exceptions: Vec::new(),
            cancellation_reason: None,
            checkpoints,
            staging_area: None,
            manifest_id: None,
            route_id: None,
            delivery_attempts: 0,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn funnel_and_durations_follow_checkpoints() {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap();
        let mut fast = Checkpoints::default();
        fast.mark(Checkpoint::OrderFetched, start);
        fast.mark(Checkpoint::OrderValidated, start + Duration::minutes(10));
        let mut slow = Checkpoints::default();
        slow.mark(Checkpoint::OrderFetched, start);
        slow.mark(Checkpoint::OrderValidated, start + Duration::minutes(30));
        let orders = vec![
            order(OrderStatus::Validated, fast),
            order(OrderStatus::Validated, slow),
            order(OrderStatus::Fetched, Checkpoints::default()),
        ];

        let steps = funnel(&orders);
        assert_eq!(steps[0].checkpoint, "order_fetched");
        assert_eq!(steps[0].orders, 2);

        let validation = stage_durations(&orders)
            .into_iter()
            .find(|s| s.stage == "validation")
            .unwrap();
        assert_eq!(validation.samples, 2);
        assert!((validation.average_minutes - 20.0).abs() < 1e-9);

        let summary = summarize_statuses(&orders);
        assert_eq!(summary.total_orders, 3);
        assert_eq!(summary.orders_by_status["validated"], 2);
        assert_eq!(summary.orders_by_status["cancelled"], 0);
    }
}
