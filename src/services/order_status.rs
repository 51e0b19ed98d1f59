//! Order lifecycle rules shared by every module that moves an order.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{Checkpoint, ExceptionCategory, Order, OrderException, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{payloads::ExceptionRaised, EntityRef, EventBus, EventPayload, ModuleName};
use crate::metrics;
use crate::store::Repository;

/// Whether `from -> to` is an edge of the order state machine.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    match (from, to) {
        // Happy path
        (Fetched, Validated) => true,
        (Validated, ReadyForWms) => true,
        (ReadyForWms, Picking) => true,
        (Picking, Picked) => true,
        (Picked, Packing) => true,
        (Packing, Packed) => true,
        (Packed, StagedForDispatch) => true,
        (StagedForDispatch, Dispatched) => true,
        (Dispatched, OutForDelivery) => true,
        (OutForDelivery, Delivered) => true,

        // Anything before dispatch can be parked or cancelled
        (from, Exception) if from.is_pre_dispatch() => true,
        (from, Cancelled) if from.is_pre_dispatch() => true,
        (Exception, Cancelled) => true,

        _ => false,
    }
}

/// Moves `order` to `to` on behalf of `actor`.
///
/// Returns `Ok(false)` without touching the order when it is already at or
/// past `to` on the happy path, so replayed handlers are harmless.
pub fn apply_transition(
    order: &mut Order,
    to: OrderStatus,
    actor: ModuleName,
    at: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let from = order.status;
    if from == to {
        return Ok(false);
    }
    if let (Some(current), Some(target)) = (from.rank(), to.rank()) {
        if current > target {
            return Ok(false);
        }
    }

    if let Some(owner) = to.owner() {
        if owner != actor {
            return Err(ServiceError::InvalidOperation(format!(
                "{} may not move order {} to {}",
                actor, order.saylogix_number, to
            )));
        }
    }
    if !is_valid_transition(from, to) {
        return Err(ServiceError::InvalidStatus(format!(
            "Cannot transition order {} from '{}' to '{}'",
            order.saylogix_number, from, to
        )));
    }

    order.status = to;
    order.updated_at = at;
    if let Some(checkpoint) = Checkpoint::for_status(to) {
        order.checkpoints.mark(checkpoint, at);
    }
    Ok(true)
}

/// What parking an order did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parking {
    /// The order moved into exception.
    Parked,
    /// The order was already parked; the exception waits behind the open one.
    Queued,
    /// An exception of the same category is already open or waiting.
    Duplicate,
}

impl Parking {
    pub fn recorded(self) -> bool {
        !matches!(self, Parking::Duplicate)
    }
}

/// Parks the order in `exception`, remembering where it came from.
///
/// A parked order keeps further exceptions in `pending_exceptions` so that
/// resolving one problem never hides another.
pub fn park_order(
    order: &mut Order,
    category: ExceptionCategory,
    message: &str,
    actor: ModuleName,
    at: DateTime<Utc>,
) -> Result<Parking, ServiceError> {
    if let Some(open) = &order.exception {
        if order.status == OrderStatus::Exception {
            let known = open.category == category
                || order.pending_exceptions.iter().any(|p| p.category == category);
            if known {
                return Ok(Parking::Duplicate);
            }
            let prior_status = open.prior_status;
            order.pending_exceptions.push(OrderException {
                category,
                message: message.to_string(),
                prior_status,
                raised_by: actor,
                raised_at: at,
                resolved_at: None,
            });
            order.updated_at = at;
            return Ok(Parking::Queued);
        }
    }
    if !is_valid_transition(order.status, OrderStatus::Exception) {
        return Err(ServiceError::InvalidStatus(format!(
            "Order {} in '{}' cannot enter exception",
            order.saylogix_number, order.status
        )));
    }

    order.exception = Some(OrderException {
        category,
        message: message.to_string(),
        prior_status: order.status,
        raised_by: actor,
        raised_at: at,
        resolved_at: None,
    });
    order.status = OrderStatus::Exception;
    order.updated_at = at;
    Ok(Parking::Parked)
}

/// Resolves the open exception. The order returns to the status it had
/// before it was parked, unless another exception is waiting, in which case
/// that one becomes the open exception and the order stays parked.
pub fn resume_order(order: &mut Order, at: DateTime<Utc>) -> Result<OrderException, ServiceError> {
    if order.status != OrderStatus::Exception {
        return Err(ServiceError::InvalidStatus(format!(
            "Order {} is not in exception",
            order.saylogix_number
        )));
    }
    let mut exception = order.exception.take().ok_or_else(|| {
        ServiceError::InternalError(format!(
            "Order {} is in exception without details",
            order.saylogix_number
        ))
    })?;

    exception.resolved_at = Some(at);
    if order.pending_exceptions.is_empty() {
        order.status = exception.prior_status;
    } else {
        let mut next = order.pending_exceptions.remove(0);
        next.prior_status = exception.prior_status;
        order.exception = Some(next);
    }
    order.updated_at = at;
    order.resolved_exceptions.push(exception.clone());
    Ok(exception)
}

/// Parks an order and announces it on the bus. Returns whether the
/// exception was recorded, either as the open exception or queued behind it.
#[instrument(skip(bus, orders, clock, message), fields(order_id = %order_id, category = %category))]
pub async fn raise_order_exception(
    bus: &EventBus,
    orders: &Repository<Order>,
    clock: &dyn Clock,
    order_id: Uuid,
    category: ExceptionCategory,
    message: &str,
    actor: ModuleName,
) -> Result<bool, ServiceError> {
    let now = clock.now();
    let (order, parking) = orders
        .update_with(order_id, |order| park_order(order, category, message, actor, now))
        .await?;

    match parking {
        Parking::Duplicate => {
            debug!(order = %order.saylogix_number, "exception already recorded");
            return Ok(false);
        }
        Parking::Queued => {
            warn!(
                order = %order.saylogix_number,
                open = ?order.exception_category(),
                %message,
                "order already in exception, new exception queued"
            );
        }
        Parking::Parked => {
            info!(order = %order.saylogix_number, %message, "order moved to exception");
        }
    }

    metrics::ORDER_EXCEPTIONS
        .with_label_values(&[category.to_string().as_str()])
        .inc();
    let prior_status = order
        .exception
        .as_ref()
        .map(|e| e.prior_status)
        .unwrap_or(OrderStatus::Exception);

    bus.emit(
        actor,
        EntityRef::order(order_id),
        EventPayload::OrderExceptionRaised(ExceptionRaised {
            order_id,
            category,
            message: message.to_string(),
            prior_status,
            raised_by: actor,
        }),
    )
    .await?;
    Ok(parking.recorded())
}
