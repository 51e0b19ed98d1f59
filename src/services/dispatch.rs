//! Dispatch (DMS): staging, courier manifests, dock scans and supervisor
//! exceptions.
//!
//! Packed orders are staged per courier. A manifest is generated for a
//! courier once enough orders are staged or the daily cutoff has passed,
//! whichever comes first. The manifest confirms only when every member's
//! package has been scanned at pickup; confirmation dispatches every member.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::entities::{
    ExceptionCategory, Manifest, ManifestMember, ManifestStatus, ManifestTrigger, MemberState,
    NotificationPurpose, Order, OrderStatus,
};
use crate::errors::{DispatchError, ServiceError};
use crate::events::payloads::{
    CustomerNotified, DispatchExceptionRaised, DispatchExceptionType, ExceptionResolved,
    ManifestGenerated, ManifestMembersAdded, ManifestReadinessChecked, ManifestSummary,
    OrderDispatched, OrderStaged,
    PackageScanned, ScanMismatch, SupervisorNotified, SupervisorOverride,
};
use crate::events::{EntityRef, EventBus, EventCode, EventPayload, EventRecord, ModuleName};
use crate::metrics;
use crate::services::notifications::Notifier;
use crate::services::order_status::{apply_transition, raise_order_exception, resume_order};
use crate::store::{EntityType, Filter, Repository};

/// Result of scanning one package code against a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Scanned { order_id: Uuid, remaining: usize },
    AlreadyScanned { order_id: Uuid },
    /// The code belongs to no member of the manifest.
    Mismatch,
    /// This scan was the last one; the manifest confirmed and dispatched.
    Dispatched { order_ids: Vec<Uuid> },
}

/// Whether `now` is at or past the daily cutoff in warehouse-local time.
pub fn is_past_cutoff(now: DateTime<Utc>, config: &DispatchConfig) -> bool {
    let local = now + Duration::hours(i64::from(config.utc_offset_hours));
    let cutoff = NaiveTime::from_hms_opt(config.cutoff_hour, config.cutoff_minute, 0)
        .unwrap_or_default();
    local.time() >= cutoff
}

fn manifest_prefix(courier: &str, now: DateTime<Utc>, utc_offset_hours: i32) -> String {
    let local = now + Duration::hours(i64::from(utc_offset_hours));
    format!("MNF-{}-{}-", courier.trim().to_uppercase(), local.format("%Y%m%d"))
}

/// `MNF-ARAMEX-20260310-001`, dated in warehouse-local time.
pub fn manifest_number(
    courier: &str,
    now: DateTime<Utc>,
    utc_offset_hours: i32,
    sequence: usize,
) -> String {
    format!("{}{:03}", manifest_prefix(courier, now, utc_offset_hours), sequence)
}

fn same_courier(order: &Order, courier: &str) -> bool {
    order
        .courier_name()
        .map_or(false, |c| c.eq_ignore_ascii_case(courier))
}

pub struct DispatchService {
    bus: Arc<EventBus>,
    orders: Repository<Order>,
    manifests: Repository<Manifest>,
    notifier: Arc<Notifier>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
}

impl DispatchService {
    pub fn new(
        bus: Arc<EventBus>,
        notifier: Arc<Notifier>,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = bus.store();
        Self {
            orders: Repository::new(store.clone()),
            manifests: Repository::new(store),
            bus,
            notifier,
            config,
            clock,
        }
    }

    pub fn register(self: &Arc<Self>) {
        let bus = &self.bus;
        bus.subscribe_with(
            EventCode::PackTaskCompleted,
            "dms.stage_order",
            self.clone(),
            |svc, event| async move {
                let EventPayload::PackTaskCompleted(packed) = event.payload else {
                    return Ok(());
                };
                svc.stage_order(packed.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::OrderExceptionResolved,
            "dms.release_hold",
            self.clone(),
            |svc, event| async move { svc.on_exception_resolved(event).await },
        );
        bus.subscribe_with(
            EventCode::OrderCancelled,
            "dms.drop_cancelled",
            self.clone(),
            |svc, event| async move {
                let EventPayload::OrderCancelled(cancelled) = event.payload else {
                    return Ok(());
                };
                svc.drop_from_manifest(cancelled.order_id).await
            },
        );
    }

    async fn emit(&self, entity: EntityRef, payload: EventPayload) -> Result<(), DispatchError> {
        self.bus.emit(ModuleName::Dms, entity, payload).await?;
        Ok(())
    }

    fn staging_area_for(&self, courier: &str) -> String {
        self.config
            .staging_areas
            .get(&courier.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.config.default_staging_area.clone())
    }

    /// Moves a packed order into its courier's staging lane, then checks
    /// whether that courier's manifest is due.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn stage_order(&self, order_id: Uuid) -> Result<(), DispatchError> {
        let order = self.orders.find(order_id).await?;
        let Some(courier) = order.courier_name().map(str::to_string) else {
            return self
                .raise_dispatch_exception(
                    None,
                    Some(order_id),
                    DispatchExceptionType::MissingCourier,
                    &format!("Order {} reached dispatch without a courier", order.saylogix_number),
                )
                .await;
        };
        let area = self.staging_area_for(&courier);
        let now = self.clock.now();

        let (order, staged) = self
            .orders
            .update_with(order_id, |o| {
                let moved = apply_transition(o, OrderStatus::StagedForDispatch, ModuleName::Dms, now)?;
                if moved {
                    o.staging_area = Some(area.clone());
                }
                Ok(moved)
            })
            .await?;
        if !staged {
            debug!(order = %order.saylogix_number, status = %order.status, "order not staged");
            return Ok(());
        }

        info!(order = %order.saylogix_number, courier = %courier, area = %area, "order staged");
        self.emit(
            EntityRef::order(order_id),
            EventPayload::OrderStaged(OrderStaged {
                order_id,
                courier: courier.clone(),
                staging_area: area,
            }),
        )
        .await?;
        self.check_manifest_readiness(&courier).await.map(|_| ())
    }

    /// Staged orders for `courier` that no manifest has claimed yet, oldest first.
    pub async fn unmanifested_orders(&self, courier: &str) -> Result<Vec<Order>, DispatchError> {
        let mut orders: Vec<Order> = self
            .orders
            .query(Filter::new().eq("status", OrderStatus::StagedForDispatch))
            .await?
            .into_iter()
            .filter(|o| o.manifest_id.is_none() && same_courier(o, courier))
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        Ok(orders)
    }

    /// Generates a manifest when the batch is full or the cutoff has passed.
    pub async fn check_manifest_readiness(
        &self,
        courier: &str,
    ) -> Result<Option<Manifest>, DispatchError> {
        let staged_count = self.unmanifested_orders(courier).await?.len();
        let past_cutoff = is_past_cutoff(self.clock.now(), &self.config);
        let batch_size = self.config.manifest_batch_size;
        let generate = staged_count > 0 && (staged_count >= batch_size || past_cutoff);

        self.emit(
            EntityRef::new(EntityType::Manifest, Uuid::nil()),
            EventPayload::ManifestReadinessChecked(ManifestReadinessChecked {
                courier: courier.to_string(),
                staged_count,
                batch_size,
                past_cutoff,
                generate,
            }),
        )
        .await?;

        if !generate {
            return Ok(None);
        }
        let trigger = if staged_count >= batch_size {
            ManifestTrigger::BatchSize
        } else {
            ManifestTrigger::Cutoff
        };
        self.generate_manifest(courier, trigger).await
    }

    /// The courier's manifest for the current local day that still accepts
    /// members, if any.
    async fn open_manifest_for_today(
        &self,
        courier: &str,
    ) -> Result<Option<Manifest>, DispatchError> {
        let prefix = manifest_prefix(courier, self.clock.now(), self.config.utc_offset_hours);
        Ok(self
            .manifests
            .all()
            .await?
            .into_iter()
            .filter(|m| m.status == ManifestStatus::Open && m.manifest_number.starts_with(&prefix))
            .min_by_key(|m| m.created_at))
    }

    /// Claims every unmanifested staged order of `courier` into the courier's
    /// open manifest for the local day, creating that manifest when none is
    /// open. Returns `None` when another generation claimed the orders first.
    #[instrument(skip(self))]
    pub async fn generate_manifest(
        &self,
        courier: &str,
        trigger: ManifestTrigger,
    ) -> Result<Option<Manifest>, DispatchError> {
        let open = self.open_manifest_for_today(courier).await?;
        let manifest_id = open.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4);
        let mut members = Vec::new();

        for candidate in self.unmanifested_orders(courier).await? {
            let (order, claimed) = self
                .orders
                .update_with(candidate.id, |o| {
                    if o.manifest_id.is_some() || o.status != OrderStatus::StagedForDispatch {
                        return Ok(false);
                    }
                    o.manifest_id = Some(manifest_id);
                    Ok(true)
                })
                .await?;
            if claimed {
                members.push(ManifestMember {
                    order_id: order.id,
                    saylogix_number: order.saylogix_number.clone(),
                    tracking_number: order.tracking_number().unwrap_or_default().to_string(),
                    city: order.shipping_address.city.clone(),
                    state: MemberState::Staged,
                    scanned_at: None,
                });
            }
        }
        if members.is_empty() {
            debug!(courier, "nothing left to manifest");
            return Ok(None);
        }

        match open {
            Some(open) => self.add_members(open, members).await.map(Some),
            None => self.create_manifest(manifest_id, courier, trigger, members).await.map(Some),
        }
    }

    async fn create_manifest(
        &self,
        manifest_id: Uuid,
        courier: &str,
        trigger: ManifestTrigger,
        members: Vec<ManifestMember>,
    ) -> Result<Manifest, DispatchError> {
        let now = self.clock.now();
        let prefix = manifest_prefix(courier, now, self.config.utc_offset_hours);
        let sequence = self
            .manifests
            .all()
            .await?
            .iter()
            .filter(|m| m.manifest_number.starts_with(&prefix))
            .count()
            + 1;

        let manifest = Manifest {
            id: manifest_id,
            manifest_number: manifest_number(courier, now, self.config.utc_offset_hours, sequence),
            courier: courier.to_string(),
            status: ManifestStatus::Open,
            trigger,
            members,
            created_at: now,
            confirmed_at: None,
            dispatched_at: None,
        };
        self.manifests.insert(&manifest).await?;

        metrics::MANIFESTS_GENERATED
            .with_label_values(&[trigger.to_string().as_str()])
            .inc();
        info!(
            manifest = %manifest.manifest_number,
            orders = manifest.members.len(),
            trigger = %trigger,
            "manifest generated"
        );
        self.emit(
            EntityRef::new(EntityType::Manifest, manifest.id),
            EventPayload::ManifestGenerated(ManifestGenerated {
                manifest_id: manifest.id,
                manifest_number: manifest.manifest_number.clone(),
                courier: manifest.courier.clone(),
                order_ids: manifest.order_ids(),
                trigger,
            }),
        )
        .await?;
        Ok(manifest)
    }

    /// Appends freshly claimed members to an open manifest. If the manifest
    /// stopped accepting members in the meantime the claims are undone so the
    /// orders stay eligible for the next generation.
    async fn add_members(
        &self,
        open: Manifest,
        members: Vec<ManifestMember>,
    ) -> Result<Manifest, DispatchError> {
        let order_ids: Vec<Uuid> = members.iter().map(|m| m.order_id).collect();
        let appended = self
            .manifests
            .update_with(open.id, |m| {
                if m.status != ManifestStatus::Open {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Manifest {} is {} and takes no new members",
                        m.manifest_number, m.status
                    )));
                }
                m.members.extend(members.iter().cloned());
                Ok(())
            })
            .await;

        let manifest = match appended {
            Ok((manifest, ())) => manifest,
            Err(err) => {
                warn!(manifest = %open.manifest_number, error = %err, "releasing claimed orders");
                for order_id in &order_ids {
                    self.orders
                        .update_with(*order_id, |o| {
                            if o.manifest_id == Some(open.id) {
                                o.manifest_id = None;
                            }
                            Ok(())
                        })
                        .await?;
                }
                return Err(err);
            }
        };

        info!(
            manifest = %manifest.manifest_number,
            added = order_ids.len(),
            orders = manifest.members.len(),
            "orders joined open manifest"
        );
        self.emit(
            EntityRef::new(EntityType::Manifest, manifest.id),
            EventPayload::ManifestMembersAdded(ManifestMembersAdded {
                manifest_id: manifest.id,
                manifest_number: manifest.manifest_number.clone(),
                courier: manifest.courier.clone(),
                order_ids,
                member_count: manifest.members.len(),
            }),
        )
        .await?;
        Ok(manifest)
    }

    /// After the cutoff, manifests every courier that still has staged orders.
    pub async fn run_cutoff_sweep(&self) -> Result<Vec<Manifest>, DispatchError> {
        if !is_past_cutoff(self.clock.now(), &self.config) {
            return Ok(Vec::new());
        }
        let mut couriers: Vec<String> = Vec::new();
        for order in self
            .orders
            .query(Filter::new().eq("status", OrderStatus::StagedForDispatch))
            .await?
        {
            if order.manifest_id.is_some() {
                continue;
            }
            if let Some(courier) = order.courier_name() {
                if !couriers.iter().any(|c| c.eq_ignore_ascii_case(courier)) {
                    couriers.push(courier.to_string());
                }
            }
        }

        let mut generated = Vec::new();
        for courier in couriers {
            if let Some(manifest) = self.generate_manifest(&courier, ManifestTrigger::Cutoff).await? {
                generated.push(manifest);
            }
        }
        Ok(generated)
    }

    /// Records a courier scan at pickup. A code that matches no member is a
    /// dispatch exception; the last outstanding scan dispatches the manifest.
    #[instrument(skip(self), fields(manifest_id = %manifest_id))]
    pub async fn scan_package(
        &self,
        manifest_id: Uuid,
        code: &str,
    ) -> Result<ScanOutcome, DispatchError> {
        let now = self.clock.now();
        let (manifest, scanned) = self
            .manifests
            .update_with(manifest_id, |m| {
                if m.status != ManifestStatus::Open {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Manifest {} is {}",
                        m.manifest_number, m.status
                    )));
                }
                let Some(member) = m.members.iter_mut().find(|member| member.matches_code(code)) else {
                    return Ok(None);
                };
                match member.state {
                    MemberState::Staged => {
                        member.state = MemberState::Scanned;
                        member.scanned_at = Some(now);
                        Ok(Some((member.order_id, true)))
                    }
                    MemberState::Scanned | MemberState::Dispatched => Ok(Some((member.order_id, false))),
                    MemberState::Held => Err(ServiceError::InvalidOperation(format!(
                        "Package {} is held pending supervisor review",
                        member.saylogix_number
                    ))),
                }
            })
            .await?;

        let Some((order_id, newly_scanned)) = scanned else {
            warn!(manifest = %manifest.manifest_number, code, "scanned code is not on the manifest");
            self.emit(
                EntityRef::new(EntityType::Manifest, manifest_id),
                EventPayload::ManifestScanMismatch(ScanMismatch {
                    manifest_id,
                    code: code.to_string(),
                }),
            )
            .await?;
            self.raise_dispatch_exception(
                Some(manifest_id),
                None,
                DispatchExceptionType::ScanMismatch,
                &format!("Code {} is not on manifest {}", code, manifest.manifest_number),
            )
            .await?;
            return Ok(ScanOutcome::Mismatch);
        };
        if !newly_scanned {
            return Ok(ScanOutcome::AlreadyScanned { order_id });
        }

        let remaining = manifest.remaining_scans();
        self.emit(
            EntityRef::new(EntityType::Manifest, manifest_id),
            EventPayload::ManifestPackageScanned(PackageScanned {
                manifest_id,
                order_id,
                code: code.to_string(),
                remaining,
            }),
        )
        .await?;

        if manifest.all_scanned() {
            let order_ids = self.confirm_and_dispatch(manifest_id).await?;
            return Ok(ScanOutcome::Dispatched { order_ids });
        }
        Ok(ScanOutcome::Scanned { order_id, remaining })
    }

    /// Confirms a fully scanned manifest and dispatches each member. A manifest
    /// confirms once; later calls return an empty list.
    async fn confirm_and_dispatch(&self, manifest_id: Uuid) -> Result<Vec<Uuid>, DispatchError> {
        let now = self.clock.now();
        let (manifest, confirmed) = self
            .manifests
            .update_with(manifest_id, |m| {
                if m.status != ManifestStatus::Open || !m.all_scanned() {
                    return Ok(false);
                }
                m.status = ManifestStatus::Confirmed;
                m.confirmed_at = Some(now);
                Ok(true)
            })
            .await?;
        if !confirmed {
            return Ok(Vec::new());
        }

        let summary = |m: &Manifest| ManifestSummary {
            manifest_id,
            manifest_number: m.manifest_number.clone(),
            courier: m.courier.clone(),
            order_ids: m.order_ids(),
        };
        info!(manifest = %manifest.manifest_number, "manifest confirmed");
        self.emit(
            EntityRef::new(EntityType::Manifest, manifest_id),
            EventPayload::ManifestConfirmed(summary(&manifest)),
        )
        .await?;

        let mut dispatched = Vec::new();
        for member in &manifest.members {
            self.dispatch_order(&manifest, member.order_id).await?;
            dispatched.push(member.order_id);
        }

        let (manifest, _) = self
            .manifests
            .update_with(manifest_id, |m| {
                m.status = ManifestStatus::Dispatched;
                m.dispatched_at = Some(now);
                for member in m.members.iter_mut() {
                    member.state = MemberState::Dispatched;
                }
                Ok(())
            })
            .await?;
        self.emit(
            EntityRef::new(EntityType::Manifest, manifest_id),
            EventPayload::ManifestDispatched(summary(&manifest)),
        )
        .await?;
        Ok(dispatched)
    }

    async fn dispatch_order(
        &self,
        manifest: &Manifest,
        order_id: Uuid,
    ) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let (order, moved) = self
            .orders
            .update_with(order_id, |o| apply_transition(o, OrderStatus::Dispatched, ModuleName::Dms, now))
            .await?;
        if !moved {
            return Ok(());
        }
        let tracking_number = order.tracking_number().unwrap_or_default().to_string();
        self.emit(
            EntityRef::order(order_id),
            EventPayload::OrderDispatched(OrderDispatched {
                order_id,
                manifest_id: manifest.id,
                courier: manifest.courier.clone(),
                tracking_number: tracking_number.clone(),
            }),
        )
        .await?;

        let link = format!("{}/{}", self.config.tracking_url_base.trim_end_matches('/'), tracking_number);
        let body = format!(
            "Your order {} is on its way with {}. Track it here: {}",
            order.saylogix_number, manifest.courier, link
        );
        let message_id = self
            .notifier
            .send(Some(order_id), NotificationPurpose::TrackingLink, &order.customer.phone, &body)
            .await?;
        self.emit(
            EntityRef::order(order_id),
            EventPayload::TrackingLinkSent(CustomerNotified {
                order_id,
                message_id,
                link: Some(link),
            }),
        )
        .await
    }

    /// Logs a typed dispatch failure and alerts the supervisor. When an order
    /// is named it is parked and, if on an open manifest, held off the scan.
    #[instrument(skip(self, note))]
    pub async fn raise_dispatch_exception(
        &self,
        manifest_id: Option<Uuid>,
        order_id: Option<Uuid>,
        exception_type: DispatchExceptionType,
        note: &str,
    ) -> Result<(), DispatchError> {
        if let Some(order_id) = order_id {
            let order = self.orders.find(order_id).await?;
            if let Some(manifest_id) = manifest_id.or(order.manifest_id) {
                self.hold_member(manifest_id, order_id).await?;
            }
            raise_order_exception(
                &self.bus,
                &self.orders,
                self.clock.as_ref(),
                order_id,
                ExceptionCategory::Dispatch,
                note,
                ModuleName::Dms,
            )
            .await?;
        }

        let entity = match (order_id, manifest_id) {
            (Some(order_id), _) => EntityRef::order(order_id),
            (None, Some(manifest_id)) => EntityRef::new(EntityType::Manifest, manifest_id),
            (None, None) => EntityRef::new(EntityType::Manifest, Uuid::nil()),
        };
        warn!(%exception_type, note, "dispatch exception raised");
        self.emit(
            entity,
            EventPayload::DispatchExceptionRaised(DispatchExceptionRaised {
                order_id,
                manifest_id,
                exception_type,
                note: note.to_string(),
            }),
        )
        .await?;

        let body = format!("Dispatch exception ({}): {}", exception_type, note);
        let message_id = self
            .notifier
            .send(order_id, NotificationPurpose::SupervisorAlert, &self.config.supervisor_phone, &body)
            .await?;
        self.emit(
            entity,
            EventPayload::SupervisorNotified(SupervisorNotified {
                order_id,
                manifest_id,
                exception_type,
                message_id,
            }),
        )
        .await
    }

    /// Takes a staged member off the scan. Scanned members keep moving forward.
    async fn hold_member(&self, manifest_id: Uuid, order_id: Uuid) -> Result<(), DispatchError> {
        self.manifests
            .update_with(manifest_id, |m| {
                if m.status != ManifestStatus::Open {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Manifest {} is already {}",
                        m.manifest_number, m.status
                    )));
                }
                let number = m.manifest_number.clone();
                let member = m.member_mut(order_id).ok_or_else(|| {
                    ServiceError::NotFound(format!("Order {} is not on manifest {}", order_id, number))
                })?;
                match member.state {
                    MemberState::Staged | MemberState::Held => {
                        member.state = MemberState::Held;
                        Ok(())
                    }
                    state => Err(ServiceError::InvalidStatus(format!(
                        "Package {} is already {}",
                        member.saylogix_number, state
                    ))),
                }
            })
            .await?;
        Ok(())
    }

    /// Supervisor releases one parked order back into staging. Sibling orders
    /// on the same manifest are untouched.
    #[instrument(skip(self, note), fields(order_id = %order_id))]
    pub async fn supervisor_override(
        &self,
        order_id: Uuid,
        supervisor: &str,
        note: &str,
    ) -> Result<Order, DispatchError> {
        let order = self.orders.find(order_id).await?;
        if order.exception_category() != Some(ExceptionCategory::Dispatch) {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} has no open dispatch exception",
                order.saylogix_number
            )));
        }
        self.emit(
            EntityRef::order(order_id),
            EventPayload::SupervisorOverride(SupervisorOverride {
                order_id,
                supervisor: supervisor.to_string(),
                note: note.to_string(),
            }),
        )
        .await?;

        let now = self.clock.now();
        let (order, exception) = self
            .orders
            .update_with(order_id, |o| resume_order(o, now))
            .await?;
        info!(order = %order.saylogix_number, supervisor, "dispatch exception overridden");
        self.emit(
            EntityRef::order(order_id),
            EventPayload::OrderExceptionResolved(ExceptionResolved {
                order_id,
                category: exception.category,
                resumed_status: order.status,
                resolved_by: supervisor.to_string(),
            }),
        )
        .await?;
        self.orders.find(order_id).await
    }

    async fn on_exception_resolved(&self, event: EventRecord) -> Result<(), DispatchError> {
        let EventPayload::OrderExceptionResolved(resolved) = event.payload else {
            return Ok(());
        };
        let order = self.orders.find(resolved.order_id).await?;
        if order.status == OrderStatus::Exception {
            // Another exception is still open; the hold stays.
            return Ok(());
        }
        match order.manifest_id {
            Some(manifest_id) => {
                self.manifests
                    .update_with(manifest_id, |m| {
                        if let Some(member) = m.member_mut(resolved.order_id) {
                            if member.state == MemberState::Held {
                                member.state = MemberState::Staged;
                            }
                        }
                        Ok(())
                    })
                    .await?;
                Ok(())
            }
            None if resolved.category != ExceptionCategory::Dispatch => Ok(()),
            None => match order.courier_name() {
                Some(courier) if order.status == OrderStatus::StagedForDispatch => {
                    self.check_manifest_readiness(courier).await.map(|_| ())
                }
                Some(_) => Ok(()),
                // Parked before a courier existed: stage it now.
                None => self.stage_order(order.id).await,
            },
        }
    }

    /// A cancelled order leaves its open manifest. If everyone left is
    /// scanned, the manifest goes out.
    async fn drop_from_manifest(&self, order_id: Uuid) -> Result<(), DispatchError> {
        let order = self.orders.find(order_id).await?;
        let Some(manifest_id) = order.manifest_id else {
            return Ok(());
        };
        let (manifest, removed) = self
            .manifests
            .update_with(manifest_id, |m| {
                if m.status != ManifestStatus::Open {
                    return Ok(false);
                }
                let before = m.members.len();
                m.members.retain(|member| member.order_id != order_id);
                Ok(m.members.len() != before)
            })
            .await?;
        if removed {
            info!(manifest = %manifest.manifest_number, order = %order.saylogix_number, "cancelled order removed from manifest");
            if manifest.all_scanned() {
                self.confirm_and_dispatch(manifest_id).await?;
            }
        }
        Ok(())
    }

    pub async fn get_manifest(&self, manifest_id: Uuid) -> Result<Manifest, DispatchError> {
        self.manifests.find(manifest_id).await
    }

    pub async fn manifests_for(&self, courier: &str) -> Result<Vec<Manifest>, DispatchError> {
        Ok(self
            .manifests
            .all()
            .await?
            .into_iter()
            .filter(|m| m.courier.eq_ignore_ascii_case(courier))
            .collect())
    }
}
