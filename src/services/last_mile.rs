//! Last-mile delivery (LMS): route planning, driver pool and delivery
//! outcomes.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LastMileConfig;
use crate::entities::{
    DeliveryOutcome, Driver, GeoPoint, Manifest, NotificationPurpose, Order, OrderStatus, Route,
    RouteStatus, RouteStop,
};
use crate::errors::ServiceError;
use crate::events::payloads::{
    CustomerNotified, DeliveryCompleted, DeliveryFailed, DeliveryRescheduled, DriverAssigned,
    OrderCheckpointReached, OutForDelivery, RouteCompleted, RouteCreated, RouteRef,
};
use crate::events::{EntityRef, EventBus, EventCode, EventPayload, ModuleName};
use crate::metrics;
use crate::services::geocoding::{GeocodingService, StopOrdering};
use crate::services::notifications::Notifier;
use crate::services::order_status::apply_transition;
use crate::store::{EntityType, Filter, Repository};

/// Groups orders by destination city in first-seen order and splits each
/// group into chunks of at most `max_stops`.
pub fn group_into_routes(orders: Vec<Order>, max_stops: usize) -> Vec<(String, Vec<Order>)> {
    let max_stops = max_stops.max(1);
    let mut groups: Vec<(String, String, Vec<Order>)> = Vec::new();
    for order in orders {
        let key = order.shipping_address.city_key();
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, members)) => members.push(order),
            None => {
                let city = order.shipping_address.city.trim().to_string();
                groups.push((key, city, vec![order]));
            }
        }
    }

    let mut routes = Vec::new();
    for (_, city, members) in groups {
        let mut members = members.into_iter().peekable();
        while members.peek().is_some() {
            let chunk: Vec<Order> = members.by_ref().take(max_stops).collect();
            routes.push((city.clone(), chunk));
        }
    }
    routes
}

/// Linear estimate: fixed distance and handling time per stop plus driving time.
pub fn estimate_route(stops: usize, config: &LastMileConfig) -> (f64, u32) {
    let distance_km = stops as f64 * config.km_per_stop;
    let driving_minutes = distance_km / config.average_speed_kmh * 60.0;
    let minutes = stops as u32 * config.minutes_per_stop + driving_minutes.round() as u32;
    (distance_km, minutes)
}

pub struct LastMileService {
    bus: Arc<EventBus>,
    orders: Repository<Order>,
    manifests: Repository<Manifest>,
    routes: Repository<Route>,
    drivers: Repository<Driver>,
    notifier: Arc<Notifier>,
    geocoding: Arc<GeocodingService>,
    config: LastMileConfig,
    clock: Arc<dyn Clock>,
}

impl LastMileService {
    pub fn new(
        bus: Arc<EventBus>,
        notifier: Arc<Notifier>,
        geocoding: Arc<GeocodingService>,
        config: LastMileConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = bus.store();
        Self {
            orders: Repository::new(store.clone()),
            manifests: Repository::new(store.clone()),
            routes: Repository::new(store.clone()),
            drivers: Repository::new(store),
            bus,
            notifier,
            geocoding,
            config,
            clock,
        }
    }

    pub fn register(self: &Arc<Self>) {
        self.bus.subscribe_with(
            EventCode::ManifestDispatched,
            "lms.plan_routes",
            self.clone(),
            |svc, event| async move {
                let EventPayload::ManifestDispatched(manifest) = event.payload else {
                    return Ok(());
                };
                svc.plan_routes(manifest.manifest_id).await.map(|_| ())
            },
        );
    }

    async fn emit(&self, entity: EntityRef, payload: EventPayload) -> Result<(), ServiceError> {
        self.bus.emit(ModuleName::Lms, entity, payload).await?;
        Ok(())
    }

    fn route_ref(route_id: Uuid) -> EntityRef {
        EntityRef::new(EntityType::Route, route_id)
    }

    pub async fn register_driver(&self, name: &str, phone: &str) -> Result<Driver, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::ValidationError("Driver name is required".to_string()));
        }
        let driver = Driver {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            phone: phone.trim().to_string(),
            available: true,
            current_route_id: None,
        };
        self.drivers.insert(&driver).await?;
        info!(driver = %driver.name, "driver registered");
        Ok(driver)
    }

    pub async fn drivers(&self) -> Result<Vec<Driver>, ServiceError> {
        self.drivers.all().await
    }

    /// Builds the routes for a dispatched manifest. Planning the same
    /// manifest twice returns the routes already planned.
    #[instrument(skip(self), fields(manifest_id = %manifest_id))]
    pub async fn plan_routes(&self, manifest_id: Uuid) -> Result<Vec<Route>, ServiceError> {
        let existing = self.routes_for_manifest(manifest_id).await?;
        if !existing.is_empty() {
            debug!(routes = existing.len(), "manifest already routed");
            return Ok(existing);
        }

        let manifest = self.manifests.find(manifest_id).await?;
        let mut orders = Vec::with_capacity(manifest.members.len());
        for order_id in manifest.order_ids() {
            let order = self.orders.find(order_id).await?;
            if order.status == OrderStatus::Dispatched {
                orders.push(order);
            }
        }

        let now = self.clock.now();
        let mut planned = Vec::new();
        for (index, (city, chunk)) in group_into_routes(orders, self.config.max_stops_per_route)
            .into_iter()
            .enumerate()
        {
            let (distance_km, minutes) = estimate_route(chunk.len(), &self.config);
            let stops: Vec<RouteStop> = chunk
                .iter()
                .enumerate()
                .map(|(i, order)| RouteStop {
                    sequence: i as u32 + 1,
                    order_id: order.id,
                    saylogix_number: order.saylogix_number.clone(),
                    address: order.shipping_address.clone(),
                    customer_phone: order.customer.phone.clone(),
                    outcome: None,
                    resolved_at: None,
                })
                .collect();
            let route = Route {
                id: Uuid::new_v4(),
                route_number: format!("RTE-{}-{:02}", manifest.manifest_number, index + 1),
                manifest_id,
                city,
                driver_id: None,
                status: RouteStatus::Planned,
                stops,
                estimated_distance_km: distance_km,
                estimated_duration_minutes: minutes,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            self.routes.insert(&route).await?;
            for stop in &route.stops {
                self.orders
                    .update_with(stop.order_id, |o| {
                        o.route_id = Some(route.id);
                        Ok(())
                    })
                    .await?;
            }

            info!(route = %route.route_number, city = %route.city, stops = route.stops.len(), "route planned");
            self.emit(
                Self::route_ref(route.id),
                EventPayload::RouteCreated(RouteCreated {
                    route_id: route.id,
                    route_number: route.route_number.clone(),
                    manifest_id,
                    city: route.city.clone(),
                    order_ids: route.stops.iter().map(|s| s.order_id).collect(),
                    estimated_distance_km: distance_km,
                    estimated_duration_minutes: minutes,
                }),
            )
            .await?;

            let route = self.auto_assign_driver(route).await?;
            planned.push(route);
        }
        Ok(planned)
    }

    /// Pops the first available driver off the pool.
    async fn auto_assign_driver(&self, route: Route) -> Result<Route, ServiceError> {
        for candidate in self.drivers.all().await? {
            if !candidate.available {
                continue;
            }
            let (driver, claimed) = self
                .drivers
                .update_with(candidate.id, |d| {
                    if !d.available {
                        return Ok(false);
                    }
                    d.available = false;
                    d.current_route_id = Some(route.id);
                    Ok(true)
                })
                .await?;
            if claimed {
                return self.bind_driver(route.id, &driver).await;
            }
        }

        warn!(route = %route.route_number, "no driver available");
        self.emit(
            Self::route_ref(route.id),
            EventPayload::RouteNoDriverAvailable(RouteRef {
                route_id: route.id,
                driver_id: None,
            }),
        )
        .await?;
        Ok(route)
    }

    async fn bind_driver(&self, route_id: Uuid, driver: &Driver) -> Result<Route, ServiceError> {
        let (route, _) = self
            .routes
            .update_with(route_id, |r| {
                r.driver_id = Some(driver.id);
                if r.status == RouteStatus::Planned {
                    r.status = RouteStatus::Assigned;
                }
                Ok(())
            })
            .await?;
        self.emit(
            Self::route_ref(route_id),
            EventPayload::RouteDriverAssigned(DriverAssigned {
                route_id,
                driver_id: driver.id,
                driver_name: driver.name.clone(),
            }),
        )
        .await?;
        Ok(route)
    }

    /// Assigns a specific driver to a route that has none yet.
    pub async fn assign_driver(
        &self,
        route_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Route, ServiceError> {
        let route = self.routes.find(route_id).await?;
        if route.driver_id.is_some() || route.status != RouteStatus::Planned {
            return Err(ServiceError::InvalidStatus(format!(
                "Route {} already has a driver",
                route.route_number
            )));
        }
        let (driver, _) = self
            .drivers
            .update_with(driver_id, |d| {
                if !d.available {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Driver {} is not available",
                        d.name
                    )));
                }
                d.available = false;
                d.current_route_id = Some(route_id);
                Ok(())
            })
            .await?;
        self.bind_driver(route_id, &driver).await
    }

    /// The driver leaves the depot: every stop's order goes out for delivery.
    #[instrument(skip(self), fields(route_id = %route_id))]
    pub async fn start_route(&self, route_id: Uuid) -> Result<Route, ServiceError> {
        let now = self.clock.now();
        let (route, started) = self
            .routes
            .update_with(route_id, |r| match r.status {
                RouteStatus::Assigned => {
                    r.status = RouteStatus::InProgress;
                    r.started_at = Some(now);
                    Ok(true)
                }
                RouteStatus::InProgress => Ok(false),
                other => Err(ServiceError::InvalidStatus(format!(
                    "Route {} cannot start while {}",
                    r.route_number, other
                ))),
            })
            .await?;
        if !started {
            return Ok(route);
        }
        let driver_id = route.driver_id.unwrap_or_default();

        self.emit(
            Self::route_ref(route_id),
            EventPayload::RouteStarted(RouteRef {
                route_id,
                driver_id: route.driver_id,
            }),
        )
        .await?;
        for stop in &route.stops {
            let (_, moved) = self
                .orders
                .update_with(stop.order_id, |o| apply_transition(o, OrderStatus::OutForDelivery, ModuleName::Lms, now))
                .await?;
            if moved {
                self.emit(
                    EntityRef::order(stop.order_id),
                    EventPayload::OrderOutForDelivery(OutForDelivery {
                        order_id: stop.order_id,
                        route_id,
                        driver_id,
                    }),
                )
                .await?;
            }
        }
        Ok(route)
    }

    /// Records the terminal result of one stop. Each stop resolves once; the
    /// last resolution completes the route and frees its driver.
    #[instrument(skip(self, outcome), fields(route_id = %route_id, order_id = %order_id, outcome = outcome.label()))]
    pub async fn record_delivery(
        &self,
        route_id: Uuid,
        order_id: Uuid,
        outcome: DeliveryOutcome,
    ) -> Result<Route, ServiceError> {
        if let DeliveryOutcome::Delivered { recipient_name, .. } = &outcome {
            if recipient_name.trim().is_empty() {
                return Err(ServiceError::ValidationError("Recipient name is required".to_string()));
            }
        }
        let now = self.clock.now();
        let (route, _) = self
            .routes
            .update_with(route_id, |r| {
                if r.status != RouteStatus::InProgress {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Route {} is {}",
                        r.route_number, r.status
                    )));
                }
                let number = r.route_number.clone();
                let stop = r
                    .stops
                    .iter_mut()
                    .find(|s| s.order_id == order_id)
                    .ok_or_else(|| ServiceError::NotFound(format!("Order {} is not on route {}", order_id, number)))?;
                if stop.outcome.is_some() {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Stop for {} is already resolved",
                        stop.saylogix_number
                    )));
                }
                stop.outcome = Some(outcome.clone());
                stop.resolved_at = Some(now);
                Ok(())
            })
            .await?;
        metrics::DELIVERY_OUTCOMES.with_label_values(&[outcome.label()]).inc();

        match outcome {
            DeliveryOutcome::Delivered {
                recipient_name,
                location,
                photo_url,
            } => {
                self.complete_delivery(route_id, order_id, recipient_name, location, photo_url)
                    .await?
            }
            DeliveryOutcome::Failed { reason } => {
                let (order, _) = self
                    .orders
                    .update_with(order_id, |o| {
                        o.delivery_attempts += 1;
                        Ok(())
                    })
                    .await?;
                warn!(order = %order.saylogix_number, reason = %reason, "delivery failed");
                self.emit(
                    EntityRef::order(order_id),
                    EventPayload::DeliveryFailed(DeliveryFailed {
                        order_id,
                        route_id,
                        reason,
                        attempt: order.delivery_attempts,
                    }),
                )
                .await?;
            }
            DeliveryOutcome::Rescheduled { reason, next_attempt } => {
                self.orders
                    .update_with(order_id, |o| {
                        o.delivery_attempts += 1;
                        Ok(())
                    })
                    .await?;
                self.emit(
                    EntityRef::order(order_id),
                    EventPayload::DeliveryRescheduled(DeliveryRescheduled {
                        order_id,
                        route_id,
                        reason,
                        next_attempt,
                    }),
                )
                .await?;
            }
        }

        if route.all_stops_resolved() {
            return self.complete_route(route_id).await;
        }
        Ok(route)
    }

    async fn complete_delivery(
        &self,
        route_id: Uuid,
        order_id: Uuid,
        recipient_name: String,
        location: GeoPoint,
        photo_url: Option<String>,
    ) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let (order, _) = self
            .orders
            .update_with(order_id, |o| {
                o.delivery_attempts += 1;
                apply_transition(o, OrderStatus::Delivered, ModuleName::Lms, now)
            })
            .await?;
        info!(order = %order.saylogix_number, "order delivered");

        self.emit(
            EntityRef::order(order_id),
            EventPayload::DeliveryCompleted(DeliveryCompleted {
                order_id,
                route_id,
                recipient_name: recipient_name.clone(),
                location,
                photo_url,
            }),
        )
        .await?;
        self.emit(
            EntityRef::order(order_id),
            EventPayload::OrderDelivered(OrderCheckpointReached {
                order_id,
                saylogix_number: order.saylogix_number.clone(),
                at: order.checkpoints.delivered.unwrap_or(now),
            }),
        )
        .await?;

        let body = format!(
            "Your order {} was delivered to {}. Thank you for shopping with us.",
            order.saylogix_number, recipient_name
        );
        let message_id = self
            .notifier
            .send(Some(order_id), NotificationPurpose::DeliveryConfirmation, &order.customer.phone, &body)
            .await?;
        self.emit(
            EntityRef::order(order_id),
            EventPayload::DeliveryConfirmationSent(CustomerNotified {
                order_id,
                message_id,
                link: None,
            }),
        )
        .await
    }

    async fn complete_route(&self, route_id: Uuid) -> Result<Route, ServiceError> {
        let now = self.clock.now();
        let (route, completed) = self
            .routes
            .update_with(route_id, |r| {
                if r.status == RouteStatus::Completed {
                    return Ok(false);
                }
                r.status = RouteStatus::Completed;
                r.completed_at = Some(now);
                Ok(true)
            })
            .await?;
        if !completed {
            return Ok(route);
        }

        info!(route = %route.route_number, "route completed");
        self.emit(
            Self::route_ref(route_id),
            EventPayload::RouteCompleted(RouteCompleted {
                route_id,
                delivered: route.count_outcomes("delivered"),
                failed: route.count_outcomes("failed"),
                rescheduled: route.count_outcomes("rescheduled"),
            }),
        )
        .await?;

        if let Some(driver_id) = route.driver_id {
            self.drivers
                .update_with(driver_id, |d| {
                    d.available = true;
                    d.current_route_id = None;
                    Ok(())
                })
                .await?;
            self.emit(
                Self::route_ref(route_id),
                EventPayload::RouteDriverReleased(RouteRef {
                    route_id,
                    driver_id: Some(driver_id),
                }),
            )
            .await?;
        }
        Ok(route)
    }

    /// Advisory nearest-neighbour ordering of a route's stops. The route itself is unchanged.
    pub async fn optimize_route(
        &self,
        route_id: Uuid,
        origin: GeoPoint,
    ) -> Result<StopOrdering, ServiceError> {
        let route = self.routes.find(route_id).await?;
        let addresses: Vec<_> = route.stops.iter().map(|s| s.address.clone()).collect();
        self.geocoding.order_stops(origin, &addresses).await
    }

    /// Advisory ordering for an arbitrary list of orders.
    pub async fn optimize_orders(
        &self,
        origin: GeoPoint,
        order_ids: &[Uuid],
    ) -> Result<StopOrdering, ServiceError> {
        let mut addresses = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            addresses.push(self.orders.find(*order_id).await?.shipping_address);
        }
        self.geocoding.order_stops(origin, &addresses).await
    }

    pub async fn get_route(&self, route_id: Uuid) -> Result<Route, ServiceError> {
        self.routes.find(route_id).await
    }

    pub async fn routes_for_manifest(&self, manifest_id: Uuid) -> Result<Vec<Route>, ServiceError> {
        self.routes
            .query(Filter::new().eq("manifest_id", manifest_id))
            .await
    }
}
