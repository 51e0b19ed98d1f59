//! Order orchestration (OMS).
//!
//! Owns the order from ingestion until it is released to the warehouse:
//! validation, priority, courier assignment, stock allocation and the
//! readiness check that joins them with address verification. Every step is
//! driven by an event and announces its result with another, so a step can
//! be re-run by replaying the event that started it.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::config::OrderPolicyConfig;
use crate::entities::{
    Address, AllocationState, Checkpoint, Checkpoints, CourierAssignment, Customer,
    ExceptionCategory, Order, OrderItem, OrderStatus, SkuQuantity, VerificationMethod,
};
use crate::errors::{OrderError, ServiceError};
use crate::events::payloads::{
    CourierAssigned, ExceptionOverride, ExceptionResolved, InventoryMovement, OrderCancelled,
    OrderCorrected, OrderFailure, OrderFetched, OrderReady, OrderRef, OrderValidated,
    PriorityAssigned, ReadinessChecked, StockShortage, ValidationFailed, VerificationRequested,
};
use crate::events::{EntityRef, EventBus, EventCode, EventPayload, EventRecord, ModuleName};
use crate::integrations::{CourierOffer, CourierRates};
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::services::inventory::{AllocationOutcome, InventoryLedger};
use crate::services::order_status::{apply_transition, raise_order_exception, resume_order};
use crate::store::{EntityStore, Filter, Repository};

/// An order as it arrives from a sales channel.
///
/// Only the channel reference is checked here. Business validation happens
/// after ingestion so that a bad order is still recorded and visible.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrder {
    #[validate(length(min = 1, message = "Channel is required"))]
    pub channel: String,
    #[validate(length(min = 1, message = "Channel reference is required"))]
    pub channel_ref: String,
    pub customer: Customer,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub weight_kg: Option<f64>,
}

fn default_currency() -> String {
    "SAR".to_string()
}

/// Operator fixes applied to an order that failed validation or verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderCorrection {
    pub customer: Option<Customer>,
    pub shipping_address: Option<Address>,
}

/// Result of [`OrderService::check_readiness`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// This call moved the order to `ready_for_wms`.
    Released,
    /// The order was already at or past `ready_for_wms`.
    AlreadyReleased,
    /// Still waiting on the listed prerequisites.
    Waiting(Vec<String>),
    /// Parked in exception or cancelled.
    Blocked(OrderStatus),
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Released | ReadinessOutcome::AlreadyReleased)
    }
}

/// Priority from order value and destination. Lower is more urgent, 1 is the floor.
pub fn compute_priority(
    order_value: Decimal,
    city: &str,
    policy: &OrderPolicyConfig,
) -> PriorityAssessment {
    let high_value = order_value > policy.high_value_threshold;
    let city = city.trim().to_lowercase();
    let metro = policy
        .metro_cities
        .iter()
        .any(|m| m.trim().to_lowercase() == city);

    let mut priority = policy.base_priority;
    if high_value {
        priority = priority.saturating_sub(2).max(1);
    }
    if metro {
        priority = priority.saturating_sub(1).max(1);
    }
    PriorityAssessment {
        priority,
        high_value,
        metro,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityAssessment {
    pub priority: u8,
    pub high_value: bool,
    pub metro: bool,
}

/// Fastest offer for high-priority orders, cheapest otherwise. The first
/// offer reaching the best value wins ties.
pub fn select_offer(
    offers: &[CourierOffer],
    priority: u8,
    high_priority_max: u8,
) -> Option<&CourierOffer> {
    let mut best: Option<&CourierOffer> = None;
    for offer in offers {
        let better = match best {
            None => true,
            Some(current) if priority <= high_priority_max => offer.transit_days < current.transit_days,
            Some(current) => offer.rate < current.rate,
        };
        if better {
            best = Some(offer);
        }
    }
    best
}

/// Every problem with the order, in a stable order. Empty means valid.
fn validation_errors(order: &Order, items: &[OrderItem]) -> Vec<String> {
    let mut errors = Vec::new();
    if order.customer.name.trim().is_empty() {
        errors.push("Customer name is required".to_string());
    }
    if order.customer.phone.trim().is_empty() {
        errors.push("Customer phone is required".to_string());
    }
    if order.shipping_address.line1.trim().is_empty() {
        errors.push("Shipping address street line is required".to_string());
    }
    if order.shipping_address.city.trim().is_empty() {
        errors.push("Shipping address city is required".to_string());
    }
    if items.is_empty() {
        errors.push("Order must contain at least one item".to_string());
    }
    errors
}

pub struct OrderService {
    bus: Arc<EventBus>,
    orders: Repository<Order>,
    items: Repository<OrderItem>,
    ledger: Arc<InventoryLedger>,
    courier: Arc<dyn CourierRates>,
    policy: OrderPolicyConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(
        bus: Arc<EventBus>,
        ledger: Arc<InventoryLedger>,
        courier: Arc<dyn CourierRates>,
        policy: OrderPolicyConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store: Arc<dyn EntityStore> = bus.store();
        Self {
            orders: Repository::new(store.clone()),
            items: Repository::new(store),
            bus,
            ledger,
            courier,
            policy,
            retry,
            clock,
        }
    }

    pub fn register(self: &Arc<Self>) {
        let bus = &self.bus;
        bus.subscribe_with(
            EventCode::OrderFetched,
            "oms.start_flows",
            self.clone(),
            |svc, event| async move { svc.on_order_fetched(event).await },
        );
        bus.subscribe_with(
            EventCode::OrderValidationStarted,
            "oms.validate",
            self.clone(),
            |svc, event| async move {
                let EventPayload::OrderValidationStarted(r) = event.payload else {
                    return Ok(());
                };
                svc.validate_order(r.order_id).await.map(|_| ())
            },
        );
        bus.subscribe_with(
            EventCode::CourierAssignmentRequested,
            "oms.assign_courier",
            self.clone(),
            |svc, event| async move {
                let EventPayload::CourierAssignmentRequested(r) = event.payload else {
                    return Ok(());
                };
                svc.assign_courier(r.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::InventoryAllocationRequested,
            "oms.allocate",
            self.clone(),
            |svc, event| async move {
                let EventPayload::InventoryAllocationRequested(r) = event.payload else {
                    return Ok(());
                };
                svc.allocate_inventory(r.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::InventoryAllocated,
            "oms.readiness_after_allocation",
            self.clone(),
            |svc, event| async move {
                let EventPayload::InventoryAllocated(m) = event.payload else {
                    return Ok(());
                };
                svc.check_readiness(m.order_id).await.map(|_| ())
            },
        );
        bus.subscribe_with(
            EventCode::AddressVerified,
            "oms.address_verified",
            self.clone(),
            |svc, event| async move { svc.on_address_verified(event).await },
        );
        bus.subscribe_with(
            EventCode::AddressVerificationFailed,
            "oms.address_failed",
            self.clone(),
            |svc, event| async move {
                let EventPayload::AddressVerificationFailed(f) = event.payload else {
                    return Ok(());
                };
                svc.raise(f.order_id, ExceptionCategory::Address, &f.reason).await
            },
        );
        bus.subscribe_with(
            EventCode::OrderExceptionOverride,
            "oms.exception_override",
            self.clone(),
            |svc, event| async move { svc.on_exception_override(event).await },
        );
    }

    async fn emit(&self, order_id: Uuid, payload: EventPayload) -> Result<(), OrderError> {
        self.bus
            .emit(ModuleName::Oms, EntityRef::order(order_id), payload)
            .await?;
        Ok(())
    }

    async fn raise(
        &self,
        order_id: Uuid,
        category: ExceptionCategory,
        message: &str,
    ) -> Result<(), OrderError> {
        raise_order_exception(
            &self.bus,
            &self.orders,
            self.clock.as_ref(),
            order_id,
            category,
            message,
            ModuleName::Oms,
        )
        .await?;
        Ok(())
    }

    fn order_ref(order: &Order) -> OrderRef {
        OrderRef {
            order_id: order.id,
            saylogix_number: order.saylogix_number.clone(),
        }
    }

    /// Records a new order and starts its flows.
    ///
    /// Ingestion is idempotent on `(channel, channel_ref)`: a second delivery
    /// of the same channel order returns the existing record untouched.
    #[instrument(skip(self, new_order), fields(channel = %new_order.channel, channel_ref = %new_order.channel_ref))]
    pub async fn ingest_order(&self, new_order: NewOrder) -> Result<Order, OrderError> {
        new_order.validate()?;

        let existing = self
            .orders
            .query(
                Filter::new()
                    .eq("channel", &new_order.channel)
                    .eq("channel_ref", &new_order.channel_ref),
            )
            .await?;
        if let Some(order) = existing.into_iter().next() {
            info!(order = %order.saylogix_number, "order already ingested");
            return Ok(order);
        }

        let now = self.clock.now();
        let id = Uuid::new_v4();
        let saylogix_number = format!(
            "SLX-{}-{}",
            now.format("%Y%m%d"),
            id.simple().to_string()[..8].to_uppercase()
        );
        let order_value: Decimal = new_order
            .items
            .iter()
            .map(|i| i.unit_price * Decimal::from(i.quantity))
            .sum();

        let mut checkpoints = Checkpoints::default();
        checkpoints.mark(Checkpoint::OrderFetched, now);
        let order = Order {
            id,
            saylogix_number,
            channel: new_order.channel,
            channel_ref: new_order.channel_ref,
            customer: new_order.customer,
            shipping_address: new_order.shipping_address,
            billing_address: new_order.billing_address,
            order_value,
            currency: new_order.currency,
            status: OrderStatus::Fetched,
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
            created_at: now,
            updated_at: now,
        };
        self.orders.insert(&order).await?;

        for (index, item) in new_order.items.iter().enumerate() {
            self.items
                .insert(&OrderItem {
                    id: Uuid::new_v4(),
                    order_id: id,
                    line_number: index as u32 + 1,
                    sku: item.sku.trim().to_string(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    weight_kg: item.weight_kg,
                    picked: false,
                    packed: false,
                })
                .await?;
        }
        info!(order = %order.saylogix_number, items = new_order.items.len(), value = %order_value, "order ingested");

        self.emit(
            id,
            EventPayload::OrderFetched(OrderFetched {
                order_id: id,
                saylogix_number: order.saylogix_number.clone(),
                channel: order.channel.clone(),
                channel_ref: order.channel_ref.clone(),
                item_count: new_order.items.len(),
                order_value,
            }),
        )
        .await?;

        self.orders.find(id).await
    }

    /// Fans out to address verification and validation. Verification is
    /// requested first but validation never waits for it.
    async fn on_order_fetched(&self, event: EventRecord) -> Result<(), OrderError> {
        let EventPayload::OrderFetched(fetched) = event.payload else {
            return Ok(());
        };
        let order = self.orders.find(fetched.order_id).await?;
        if order.status != OrderStatus::Fetched {
            debug!(order = %order.saylogix_number, status = %order.status, "fetch already handled");
            return Ok(());
        }

        self.emit(
            order.id,
            EventPayload::AddressVerificationRequested(VerificationRequested {
                order_id: order.id,
                short_code: order.shipping_address.short_code.clone(),
            }),
        )
        .await?;
        self.emit(order.id, EventPayload::OrderValidationStarted(Self::order_ref(&order)))
            .await
    }

    /// Validates the order. Returns the failures, empty when the order passed.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn validate_order(&self, order_id: Uuid) -> Result<Vec<String>, OrderError> {
        let order = self.orders.find(order_id).await?;
        if order.status != OrderStatus::Fetched {
            debug!(order = %order.saylogix_number, status = %order.status, "validation skipped");
            return Ok(Vec::new());
        }

        let items = self.items_for(order_id).await?;
        let mut errors = validation_errors(&order, &items);
        for item in &items {
            if item.sku.is_empty() {
                errors.push(format!("Item on line {} has no SKU", item.line_number));
                continue;
            }
            match self.ledger.get(&item.sku).await? {
                None => errors.push(format!("SKU {} does not exist in inventory", item.sku)),
                Some(record) if record.available_quantity < i64::from(item.quantity) => {
                    errors.push(format!(
                        "Insufficient stock for SKU {}: requested {}, available {}",
                        item.sku, item.quantity, record.available_quantity
                    ))
                }
                Some(_) => {}
            }
        }

        if !errors.is_empty() {
            warn!(order = %order.saylogix_number, errors = ?errors, "order failed validation");
            self.emit(
                order_id,
                EventPayload::OrderValidationFailed(ValidationFailed {
                    order_id,
                    errors: errors.clone(),
                }),
            )
            .await?;
            self.raise(order_id, ExceptionCategory::Validation, &errors.join("; "))
                .await?;
            return Ok(errors);
        }

        let assessment = compute_priority(order.order_value, &order.shipping_address.city, &self.policy);
        let now = self.clock.now();
        let (order, moved) = self
            .orders
            .update_with(order_id, |o| {
                let moved = apply_transition(o, OrderStatus::Validated, ModuleName::Oms, now)?;
                if moved {
                    o.priority = Some(assessment.priority);
                }
                Ok(moved)
            })
            .await?;
        if !moved {
            return Ok(Vec::new());
        }
        info!(order = %order.saylogix_number, priority = assessment.priority, "order validated");

        self.emit(
            order_id,
            EventPayload::OrderPriorityAssigned(PriorityAssigned {
                order_id,
                priority: assessment.priority,
                high_value: assessment.high_value,
                metro: assessment.metro,
            }),
        )
        .await?;
        self.emit(
            order_id,
            EventPayload::OrderValidated(OrderValidated {
                order_id,
                priority: assessment.priority,
            }),
        )
        .await?;
        self.emit(order_id, EventPayload::CourierAssignmentRequested(Self::order_ref(&order)))
            .await?;
        Ok(Vec::new())
    }

    fn shipment_weight(&self, items: &[OrderItem]) -> f64 {
        items
            .iter()
            .map(|i| i.weight_kg.unwrap_or(self.policy.default_item_weight_kg) * f64::from(i.quantity))
            .sum()
    }

    /// Rate-shops and books a courier for a validated order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn assign_courier(&self, order_id: Uuid) -> Result<(), OrderError> {
        let order = self.orders.find(order_id).await?;
        if order.courier.is_some() || order.status != OrderStatus::Validated {
            debug!(order = %order.saylogix_number, status = %order.status, "courier assignment skipped");
            return Ok(());
        }

        let weight = self.shipment_weight(&self.items_for(order_id).await?);
        let offers = match retry_with_backoff(&self.retry, "courier.quote", || {
            self.courier.quote(&order, weight)
        })
        .await
        {
            Ok(offers) => offers,
            Err(failure) => {
                return self
                    .courier_failed(order_id, &format!("Courier quote failed: {}", failure.error))
                    .await
            }
        };

        let priority = order.priority.unwrap_or(self.policy.base_priority);
        let Some(offer) = select_offer(&offers, priority, self.policy.high_priority_max).cloned() else {
            return self.courier_failed(order_id, "No courier offers available").await;
        };

        let tracking_number = match retry_with_backoff(&self.retry, "courier.create_shipment", || {
            self.courier.create_shipment(&order, &offer)
        })
        .await
        {
            Ok(tracking) => tracking,
            Err(failure) => {
                return self
                    .courier_failed(
                        order_id,
                        &format!("Shipment booking with {} failed: {}", offer.courier, failure.error),
                    )
                    .await
            }
        };

        let now = self.clock.now();
        let assignment = CourierAssignment {
            courier: offer.courier.clone(),
            service_level: offer.service_level.clone(),
            rate: offer.rate,
            transit_days: offer.transit_days,
            tracking_number: tracking_number.clone(),
            assigned_at: now,
        };
        let (order, assigned) = self
            .orders
            .update_with(order_id, |o| {
                if o.courier.is_some() || o.status != OrderStatus::Validated {
                    return Ok(false);
                }
                o.courier = Some(assignment.clone());
                o.updated_at = now;
                Ok(true)
            })
            .await?;
        if !assigned {
            return Ok(());
        }
        info!(order = %order.saylogix_number, courier = %offer.courier, tracking = %tracking_number, "courier assigned");

        self.emit(
            order_id,
            EventPayload::CourierAssigned(CourierAssigned {
                order_id,
                courier: offer.courier,
                service_level: offer.service_level,
                rate: offer.rate,
                transit_days: offer.transit_days,
                tracking_number,
            }),
        )
        .await?;
        self.emit(order_id, EventPayload::InventoryAllocationRequested(Self::order_ref(&order)))
            .await
    }

    async fn courier_failed(&self, order_id: Uuid, reason: &str) -> Result<(), OrderError> {
        warn!(order_id = %order_id, reason, "courier assignment failed");
        self.emit(
            order_id,
            EventPayload::CourierAssignmentFailed(OrderFailure {
                order_id,
                reason: reason.to_string(),
            }),
        )
        .await?;
        self.raise(order_id, ExceptionCategory::Courier, reason).await
    }

    /// Reserves stock for every line, or none of them.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn allocate_inventory(&self, order_id: Uuid) -> Result<(), OrderError> {
        let order = self.orders.find(order_id).await?;
        if order.status != OrderStatus::Validated || order.allocation == AllocationState::Allocated {
            debug!(order = %order.saylogix_number, allocation = %order.allocation, "allocation skipped");
            return Ok(());
        }

        let lines: Vec<SkuQuantity> = self
            .items_for(order_id)
            .await?
            .into_iter()
            .map(|i| SkuQuantity::new(i.sku, i.quantity))
            .collect();

        match self.ledger.allocate(&lines).await? {
            AllocationOutcome::Allocated(reserved) => {
                let now = self.clock.now();
                let (_, kept) = self
                    .orders
                    .update_with(order_id, |o| {
                        if o.status != OrderStatus::Validated || o.allocation == AllocationState::Allocated {
                            return Ok(false);
                        }
                        o.allocation = AllocationState::Allocated;
                        o.updated_at = now;
                        Ok(true)
                    })
                    .await?;
                if !kept {
                    // The order moved on while stock was being reserved.
                    self.ledger.release(&reserved).await?;
                    return Ok(());
                }
                self.emit(
                    order_id,
                    EventPayload::InventoryAllocated(InventoryMovement {
                        order_id,
                        lines: reserved,
                    }),
                )
                .await
            }
            AllocationOutcome::StockShortage(shortages) => {
                let now = self.clock.now();
                self.orders
                    .update_with(order_id, |o| {
                        o.allocation = AllocationState::Shortage;
                        o.updated_at = now;
                        Ok(())
                    })
                    .await?;
                let message = shortages
                    .iter()
                    .map(|s| {
                        format!(
                            "Insufficient stock for SKU {}: requested {}, available {}",
                            s.sku, s.requested, s.available
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                self.emit(
                    order_id,
                    EventPayload::InventoryStockShortage(StockShortage { order_id, shortages }),
                )
                .await?;
                self.raise(order_id, ExceptionCategory::Stock, &message).await
            }
        }
    }

    async fn on_address_verified(&self, event: EventRecord) -> Result<(), OrderError> {
        let EventPayload::AddressVerified(verified) = event.payload else {
            return Ok(());
        };
        let now = self.clock.now();
        let manual = verified.method == VerificationMethod::Manual;
        let (order, applied) = self
            .orders
            .update_with(verified.order_id, |o| {
                if o.status.is_terminal() {
                    return Ok(None);
                }
                let first = !o.nas_verified;
                if !first {
                    // Only an operator may replace an address that is already confirmed,
                    // and only while the parcel is still in the building.
                    let editable = o.status.is_pre_dispatch() || o.status == OrderStatus::Exception;
                    if !manual || !editable {
                        return Ok(None);
                    }
                }

                let mut address = verified.address.clone();
                if address.short_code.is_none() {
                    address.short_code = o.shipping_address.short_code.clone();
                }
                o.shipping_address = address;
                if first {
                    o.nas_verified = true;
                    o.checkpoints.mark(Checkpoint::VerifyCompleted, now);
                }

                let (settled, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut o.pending_exceptions)
                    .into_iter()
                    .partition(|p| p.category == ExceptionCategory::Address);
                o.pending_exceptions = waiting;
                o.resolved_exceptions.extend(settled.into_iter().map(|mut p| {
                    p.resolved_at = Some(now);
                    p
                }));
                o.updated_at = now;
                Ok(Some(first))
            })
            .await?;
        let Some(first) = applied else {
            return Ok(());
        };

        if !first {
            info!(order = %order.saylogix_number, "confirmed address replaced by operator");
            return self
                .emit(
                    order.id,
                    EventPayload::OrderCorrected(OrderCorrected {
                        order_id: order.id,
                        fields: vec!["shipping_address".to_string()],
                    }),
                )
                .await;
        }
        info!(order = %order.saylogix_number, method = %verified.method, "address confirmed");

        self.emit(order.id, EventPayload::OrderAddressConfirmed(Self::order_ref(&order)))
            .await?;
        if order.exception_category() == Some(ExceptionCategory::Address) {
            return self.resume(order.id, "address_verification").await;
        }
        self.check_readiness(order.id).await.map(|_| ())
    }

    /// Releases the order to the warehouse once every prerequisite holds.
    ///
    /// Safe to call any number of times: the transition happens once and the
    /// ready event is emitted once.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn check_readiness(&self, order_id: Uuid) -> Result<ReadinessOutcome, OrderError> {
        let now = self.clock.now();
        let (order, outcome) = self
            .orders
            .update_with(order_id, |o| {
                if matches!(o.status, OrderStatus::Exception | OrderStatus::Cancelled) {
                    return Ok(ReadinessOutcome::Blocked(o.status));
                }
                if o.status != OrderStatus::Fetched && o.status != OrderStatus::Validated {
                    return Ok(ReadinessOutcome::AlreadyReleased);
                }

                let mut missing = Vec::new();
                if o.status != OrderStatus::Validated {
                    missing.push("validation".to_string());
                }
                if !o.nas_verified {
                    missing.push("address_verification".to_string());
                }
                if o.courier.is_none() {
                    missing.push("courier_assignment".to_string());
                }
                if o.allocation != AllocationState::Allocated {
                    missing.push("inventory_allocation".to_string());
                }
                if !missing.is_empty() {
                    return Ok(ReadinessOutcome::Waiting(missing));
                }

                apply_transition(o, OrderStatus::ReadyForWms, ModuleName::Oms, now)?;
                Ok(ReadinessOutcome::Released)
            })
            .await?;

        match &outcome {
            ReadinessOutcome::Waiting(missing) => {
                debug!(order = %order.saylogix_number, missing = ?missing, "order not ready");
                self.emit(
                    order_id,
                    EventPayload::OrderReadinessChecked(ReadinessChecked {
                        order_id,
                        ready: false,
                        missing: missing.clone(),
                    }),
                )
                .await?;
            }
            ReadinessOutcome::Released => {
                metrics::ORDERS_READY.inc();
                info!(order = %order.saylogix_number, "order released to warehouse");
                self.emit(
                    order_id,
                    EventPayload::OrderReadinessChecked(ReadinessChecked {
                        order_id,
                        ready: true,
                        missing: Vec::new(),
                    }),
                )
                .await?;
                self.emit(
                    order_id,
                    EventPayload::OrderReadyForWms(OrderReady {
                        order_id,
                        saylogix_number: order.saylogix_number.clone(),
                        courier: order.courier_name().unwrap_or_default().to_string(),
                        priority: order.priority.unwrap_or(self.policy.base_priority),
                    }),
                )
                .await?;
            }
            ReadinessOutcome::AlreadyReleased | ReadinessOutcome::Blocked(_) => {}
        }
        Ok(outcome)
    }

    /// Cancels a pre-dispatch order and returns its reserved stock.
    /// Cancelling an already-cancelled order is a no-op.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid, reason: &str) -> Result<Order, OrderError> {
        let now = self.clock.now();
        let (order, cancelled) = self
            .orders
            .update_with(order_id, |o| {
                if o.status == OrderStatus::Cancelled {
                    return Ok(None);
                }
                let prior = o.status;
                let held_stock = o.allocation == AllocationState::Allocated;
                apply_transition(o, OrderStatus::Cancelled, ModuleName::Oms, now)?;
                o.cancellation_reason = Some(reason.to_string());
                if held_stock {
                    o.allocation = AllocationState::Released;
                }
                Ok(Some((prior, held_stock)))
            })
            .await?;

        let Some((prior_status, held_stock)) = cancelled else {
            debug!(order = %order.saylogix_number, "order already cancelled");
            return Ok(order);
        };

        if held_stock {
            let lines: Vec<SkuQuantity> = self
                .items_for(order_id)
                .await?
                .into_iter()
                .map(|i| SkuQuantity::new(i.sku, i.quantity))
                .collect();
            let released = self.ledger.release(&lines).await?;
            self.emit(
                order_id,
                EventPayload::InventoryReleased(InventoryMovement {
                    order_id,
                    lines: released,
                }),
            )
            .await?;
        }

        info!(order = %order.saylogix_number, prior = %prior_status, reason, "order cancelled");
        self.emit(
            order_id,
            EventPayload::OrderCancelled(OrderCancelled {
                order_id,
                reason: reason.to_string(),
                prior_status,
            }),
        )
        .await?;
        self.orders.find(order_id).await
    }

    /// Operator override: returns a parked order to its prior status and
    /// re-runs the step that parked it.
    #[instrument(skip(self, note), fields(order_id = %order_id))]
    pub async fn resolve_exception(
        &self,
        order_id: Uuid,
        operator: &str,
        note: &str,
    ) -> Result<Order, OrderError> {
        let order = self.orders.find(order_id).await?;
        if order.status != OrderStatus::Exception {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is not in exception",
                order.saylogix_number
            )));
        }
        self.emit(
            order_id,
            EventPayload::OrderExceptionOverride(ExceptionOverride {
                order_id,
                operator: operator.to_string(),
                note: note.to_string(),
            }),
        )
        .await?;
        self.orders.find(order_id).await
    }

    async fn on_exception_override(&self, event: EventRecord) -> Result<(), OrderError> {
        let EventPayload::OrderExceptionOverride(over) = event.payload else {
            return Ok(());
        };
        self.resume(over.order_id, &over.operator).await
    }

    async fn resume(&self, order_id: Uuid, resolved_by: &str) -> Result<(), OrderError> {
        let now = self.clock.now();
        let (order, resumed) = self
            .orders
            .update_with(order_id, |o| {
                if o.status != OrderStatus::Exception {
                    return Ok(None);
                }
                let exception = resume_order(o, now)?;
                if exception.category == ExceptionCategory::Stock {
                    o.allocation = AllocationState::Pending;
                }
                Ok(Some(exception))
            })
            .await?;
        let Some(exception) = resumed else {
            return Ok(());
        };
        info!(
            order = %order.saylogix_number,
            category = %exception.category,
            resumed = %order.status,
            "order exception resolved"
        );

        self.emit(
            order_id,
            EventPayload::OrderExceptionResolved(ExceptionResolved {
                order_id,
                category: exception.category,
                resumed_status: order.status,
                resolved_by: resolved_by.to_string(),
            }),
        )
        .await?;

        if order.status == OrderStatus::Exception {
            info!(
                order = %order.saylogix_number,
                next = ?order.exception_category(),
                "next exception now open"
            );
            return Ok(());
        }
        self.rerun_blocked_step(&order).await
    }

    /// Restarts the earliest step a resumed order is still missing.
    async fn rerun_blocked_step(&self, order: &Order) -> Result<(), OrderError> {
        let order_ref = Self::order_ref(order);
        match order.status {
            OrderStatus::Fetched => {
                self.emit(order.id, EventPayload::OrderValidationStarted(order_ref)).await
            }
            OrderStatus::Validated if order.courier.is_none() => {
                self.emit(order.id, EventPayload::CourierAssignmentRequested(order_ref)).await
            }
            OrderStatus::Validated if order.allocation != AllocationState::Allocated => {
                self.emit(order.id, EventPayload::InventoryAllocationRequested(order_ref)).await
            }
            OrderStatus::Validated => self.check_readiness(order.id).await.map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Applies operator corrections to an order that has not been validated
    /// yet, or is parked on a validation or address problem.
    #[instrument(skip(self, correction), fields(order_id = %order_id))]
    pub async fn correct_order(
        &self,
        order_id: Uuid,
        correction: OrderCorrection,
    ) -> Result<Order, OrderError> {
        let now = self.clock.now();
        let (order, fields) = self
            .orders
            .update_with(order_id, |o| {
                let editable = o.status == OrderStatus::Fetched
                    || matches!(
                        o.exception_category(),
                        Some(ExceptionCategory::Validation | ExceptionCategory::Address)
                    );
                if !editable {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Order {} in '{}' cannot be corrected",
                        o.saylogix_number, o.status
                    )));
                }
                let mut fields = Vec::new();
                if let Some(customer) = &correction.customer {
                    o.customer = customer.clone();
                    fields.push("customer".to_string());
                }
                if let Some(address) = &correction.shipping_address {
                    o.shipping_address = address.clone();
                    fields.push("shipping_address".to_string());
                }
                o.updated_at = now;
                Ok(fields)
            })
            .await?;

        if !fields.is_empty() {
            self.emit(
                order_id,
                EventPayload::OrderCorrected(OrderCorrected { order_id, fields }),
            )
            .await?;
        }
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.orders.find(order_id).await
    }

    pub async fn find_by_number(&self, saylogix_number: &str) -> Result<Option<Order>, OrderError> {
        Ok(self
            .orders
            .query(Filter::new().eq("saylogix_number", saylogix_number))
            .await?
            .into_iter()
            .next())
    }

    pub async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>, OrderError> {
        self.orders.query(Filter::new().eq("status", status)).await
    }

    /// Order lines sorted by line number.
    pub async fn items_for(&self, order_id: Uuid) -> Result<Vec<OrderItem>, OrderError> {
        let mut items = self.items.query(Filter::new().eq("order_id", order_id)).await?;
        items.sort_by_key(|i| i.line_number);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn offer(courier: &str, rate: Decimal, transit_days: u32) -> CourierOffer {
        CourierOffer {
            courier: courier.into(),
            service_level: "standard".into(),
            rate,
            transit_days,
        }
    }

    #[rstest]
    #[case(dec!(1500), "Riyadh", 2)]
    #[case(dec!(1500), "Abha", 3)]
    #[case(dec!(1000), "jeddah", 4)]
    #[case(dec!(200), "Tabuk", 5)]
    fn priority_from_value_and_city(
        #[case] value: Decimal,
        #[case] city: &str,
        #[case] expected: u8,
    ) {
        let policy = OrderPolicyConfig::default();
        assert_eq!(compute_priority(value, city, &policy).priority, expected);
    }

    #[test]
    fn priority_is_floored_at_one() {
        let policy = OrderPolicyConfig {
            base_priority: 2,
            ..OrderPolicyConfig::default()
        };
        let assessment = compute_priority(dec!(5000), "Dammam", &policy);
        assert_eq!(assessment.priority, 1);
        assert!(assessment.high_value && assessment.metro);
    }

    #[rstest]
    #[case(2, "fast")]
    #[case(5, "cheap")]
    fn offer_selection_by_priority(#[case] priority: u8, #[case] expected: &str) {
        let offers = vec![
            offer("mid", dec!(20), 2),
            offer("cheap", dec!(15), 4),
            offer("fast", dec!(40), 1),
        ];
        assert_eq!(select_offer(&offers, priority, 2).unwrap().courier, expected);
    }

    #[test]
    fn offer_ties_go_to_the_first() {
        let offers = vec![offer("aramex", dec!(18), 3), offer("smsa", dec!(18), 3)];
        assert_eq!(select_offer(&offers, 5, 2).unwrap().courier, "aramex");
        assert_eq!(select_offer(&offers, 1, 2).unwrap().courier, "aramex");
        assert!(select_offer(&[], 5, 2).is_none());
    }
}
