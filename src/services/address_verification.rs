//! National address verification (NAS).
//!
//! Resolution is two-tiered. A short address code is looked up in the local
//! cache and then in the national registry; when that misses or the match is
//! not confident enough, the customer is asked to confirm the address by
//! message and the verification waits for their reply. There is no timeout:
//! a verification stays pending until the customer answers or an operator
//! verifies it by hand.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AddressConfig;
use crate::entities::{
    Address, AddressCacheEntry, AddressVerification, GeoPoint, NotificationPurpose, Order,
    VerificationMethod, VerificationStatus,
};
use crate::errors::ServiceError;
use crate::events::payloads::{
    AccuracyChecked, AddressCodeResolved, AddressCodeUnresolved, AddressVerified,
    ConfirmationRequested, CustomerReply, LookupSource, ManualOverride, OrderFailure,
};
use crate::events::{EntityRef, EventBus, EventCode, EventPayload, EventRecord, ModuleName};
use crate::integrations::AddressRegistry;
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::services::geocoding::haversine_meters;
use crate::services::notifications::Notifier;
use crate::store::{EntityType, Filter, Repository, StoreError};

lazy_static! {
    static ref SHORT_CODE: Regex = Regex::new(r"^[A-Za-z]{4}\d{4}$").expect("short code pattern compiles");
}

const CONFIRM_WORDS: &[&str] = &["yes", "y", "ok", "okay", "confirm", "confirmed", "1", "نعم"];

/// An inbound message from a customer, as delivered by the messaging webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundReply {
    pub from_phone: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// What a customer's reply means for their pending verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyIntent {
    Confirm,
    ShortCode(String),
    CorrectedAddress(String),
    Empty,
}

pub fn interpret_reply(body: &str) -> ReplyIntent {
    let text = body.trim();
    if text.is_empty() {
        return ReplyIntent::Empty;
    }
    let lowered = text.to_lowercase();
    let word = lowered.trim_end_matches(['.', '!']);
    if CONFIRM_WORDS.contains(&word) {
        return ReplyIntent::Confirm;
    }
    if SHORT_CODE.is_match(text) {
        return ReplyIntent::ShortCode(AddressCacheEntry::normalize_code(text));
    }
    ReplyIntent::CorrectedAddress(text.to_string())
}

/// Digits only, so `+966 50-111` and `96650111` compare equal.
fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// A successful short-code resolution.
#[derive(Debug, Clone)]
struct Resolution {
    address: Address,
    coordinates: GeoPoint,
}

pub struct AddressVerificationService {
    bus: Arc<EventBus>,
    verifications: Repository<AddressVerification>,
    cache: Repository<AddressCacheEntry>,
    orders: Repository<Order>,
    registry: Arc<dyn AddressRegistry>,
    notifier: Arc<Notifier>,
    config: AddressConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl AddressVerificationService {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<dyn AddressRegistry>,
        notifier: Arc<Notifier>,
        config: AddressConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = bus.store();
        Self {
            verifications: Repository::new(store.clone()),
            cache: Repository::new(store.clone()),
            orders: Repository::new(store),
            bus,
            registry,
            notifier,
            config,
            retry,
            clock,
        }
    }

    pub fn register(self: &Arc<Self>) {
        let bus = &self.bus;
        bus.subscribe_with(
            EventCode::AddressVerificationRequested,
            "nas.verify",
            self.clone(),
            |svc, event| async move {
                let EventPayload::AddressVerificationRequested(request) = event.payload else {
                    return Ok(());
                };
                svc.verify(request.order_id).await
            },
        );
        bus.subscribe_with(
            EventCode::AddressReplyReceived,
            "nas.interpret_reply",
            self.clone(),
            |svc, event| async move { svc.on_reply(event).await },
        );
        bus.subscribe_with(
            EventCode::DeliveryCompleted,
            "nas.accuracy_check",
            self.clone(),
            |svc, event| async move {
                let EventPayload::DeliveryCompleted(delivery) = event.payload else {
                    return Ok(());
                };
                svc.check_accuracy(delivery.order_id, delivery.location).await
            },
        );
    }

    async fn emit(&self, order_id: Uuid, payload: EventPayload) -> Result<(), ServiceError> {
        self.bus
            .emit(ModuleName::Nas, EntityRef::order(order_id), payload)
            .await?;
        Ok(())
    }

    /// The most recent verification for an order.
    pub async fn verification_for(
        &self,
        order_id: Uuid,
    ) -> Result<Option<AddressVerification>, ServiceError> {
        Ok(self
            .verifications
            .query(Filter::new().eq("order_id", order_id))
            .await?
            .into_iter()
            .last())
    }

    async fn open_verification(&self, order: &Order) -> Result<AddressVerification, ServiceError> {
        if let Some(existing) = self.verification_for(order.id).await? {
            return Ok(existing);
        }
        let verification = AddressVerification {
            id: Uuid::new_v4(),
            order_id: order.id,
            short_code: order
                .shipping_address
                .short_code
                .as_deref()
                .map(AddressCacheEntry::normalize_code),
            customer_phone: order.customer.phone.clone(),
            original_address: order.shipping_address.clone(),
            verified_address: None,
            method: None,
            status: VerificationStatus::Pending,
            confirmation_message_id: None,
            failure_reason: None,
            requested_at: self.clock.now(),
            resolved_at: None,
        };
        self.verifications.insert(&verification).await?;
        Ok(verification)
    }

    /// Runs both tiers for an order. A verification that is already verified
    /// or waiting on the customer is left alone.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn verify(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order = self.orders.find(order_id).await?;
        let verification = self.open_verification(&order).await?;
        if verification.status != VerificationStatus::Pending {
            debug!(status = %verification.status, "verification already in progress");
            return Ok(());
        }

        match verification.short_code.clone() {
            Some(code) => {
                if let Some(resolution) = self.resolve_code(order_id, &code).await? {
                    let mut address = resolution.address;
                    address.short_code = Some(code);
                    address.coordinates = Some(resolution.coordinates);
                    return self
                        .complete(order_id, address, VerificationMethod::AutoCodeLookup)
                        .await;
                }
            }
            None => {
                self.emit(
                    order_id,
                    EventPayload::AddressCodeUnresolved(AddressCodeUnresolved {
                        order_id,
                        short_code: None,
                        reason: "No short address code supplied".to_string(),
                    }),
                )
                .await?;
            }
        }

        self.request_confirmation(&order, &verification).await
    }

    /// Cache first, then the registry. Only confident matches count.
    async fn resolve_code(
        &self,
        order_id: Uuid,
        code: &str,
    ) -> Result<Option<Resolution>, ServiceError> {
        let cache_id = AddressCacheEntry::id_for_code(code);
        if let Some(entry) = self.cache.get(cache_id).await? {
            if entry.confidence >= self.config.min_confidence {
                self.cache
                    .update_with(cache_id, |e| {
                        e.hits += 1;
                        Ok(())
                    })
                    .await?;
                debug!(short_code = code, hits = entry.hits + 1, "address cache hit");
                self.emit(
                    order_id,
                    EventPayload::AddressCacheHit(AddressCodeResolved {
                        order_id,
                        short_code: code.to_string(),
                        source: LookupSource::Cache,
                        confidence: entry.confidence,
                    }),
                )
                .await?;
                return Ok(Some(Resolution {
                    address: entry.address,
                    coordinates: entry.coordinates,
                }));
            }
        }

        let lookup = match retry_with_backoff(&self.retry, "address_registry", || {
            self.registry.lookup(code)
        })
        .await
        {
            Ok(lookup) => lookup,
            Err(failure) => {
                return self
                    .unresolved(order_id, code, &format!("Registry lookup failed: {}", failure.error))
                    .await
            }
        };

        let (Some(address), Some(coordinates)) = (lookup.address.clone(), lookup.coordinates) else {
            return self.unresolved(order_id, code, "Short code not found in registry").await;
        };
        if !lookup.found {
            return self.unresolved(order_id, code, "Short code not found in registry").await;
        }
        if lookup.confidence < self.config.min_confidence {
            return self
                .unresolved(
                    order_id,
                    code,
                    &format!(
                        "Registry match confidence {:.2} below {:.2}",
                        lookup.confidence, self.config.min_confidence
                    ),
                )
                .await;
        }

        self.remember(code, &address, coordinates, lookup.confidence).await?;
        info!(short_code = code, confidence = lookup.confidence, "short code resolved by registry");
        self.emit(
            order_id,
            EventPayload::AddressRegistryResolved(AddressCodeResolved {
                order_id,
                short_code: code.to_string(),
                source: LookupSource::Registry,
                confidence: lookup.confidence,
            }),
        )
        .await?;
        Ok(Some(Resolution {
            address,
            coordinates,
        }))
    }

    async fn unresolved(
        &self,
        order_id: Uuid,
        code: &str,
        reason: &str,
    ) -> Result<Option<Resolution>, ServiceError> {
        info!(short_code = code, reason, "short code unresolved, falling back to customer");
        self.emit(
            order_id,
            EventPayload::AddressCodeUnresolved(AddressCodeUnresolved {
                order_id,
                short_code: Some(code.to_string()),
                reason: reason.to_string(),
            }),
        )
        .await?;
        Ok(None)
    }

    async fn remember(
        &self,
        code: &str,
        address: &Address,
        coordinates: GeoPoint,
        confidence: f64,
    ) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let entry = AddressCacheEntry {
            id: AddressCacheEntry::id_for_code(code),
            short_code: AddressCacheEntry::normalize_code(code),
            address: address.clone(),
            coordinates,
            confidence,
            hits: 0,
            flagged_for_review: false,
            last_divergence_meters: None,
            looked_up_at: now,
        };
        match self.cache.insert(&entry).await {
            Ok(_) => Ok(()),
            Err(ServiceError::StoreError(StoreError::AlreadyExists { .. })) => {
                self.cache
                    .update_with(entry.id, |e| {
                        e.address = address.clone();
                        e.coordinates = coordinates;
                        e.confidence = confidence;
                        e.looked_up_at = now;
                        Ok(())
                    })
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn request_confirmation(
        &self,
        order: &Order,
        verification: &AddressVerification,
    ) -> Result<(), ServiceError> {
        let body = self
            .config
            .confirmation_template
            .replace("{name}", &order.customer.name)
            .replace("{order}", &order.saylogix_number)
            .replace("{address}", &order.shipping_address.one_line());
        let message_id = self
            .notifier
            .send(
                Some(order.id),
                NotificationPurpose::AddressConfirmation,
                &verification.customer_phone,
                &body,
            )
            .await?;

        let sent_id = message_id.clone();
        let (_, now_waiting) = self
            .verifications
            .update_with(verification.id, |v| {
                if v.status != VerificationStatus::Pending {
                    return Ok(false);
                }
                v.status = VerificationStatus::AwaitingCustomer;
                v.confirmation_message_id = sent_id.clone();
                Ok(true)
            })
            .await?;
        if now_waiting {
            metrics::PENDING_VERIFICATIONS.inc();
        }

        self.emit(
            order.id,
            EventPayload::AddressConfirmationRequested(ConfirmationRequested {
                order_id: order.id,
                phone: verification.customer_phone.clone(),
                message_id,
            }),
        )
        .await
    }

    /// Entry point for the messaging webhook. Returns the order the reply was
    /// matched to, or `None` when nobody with that number is awaiting a reply.
    #[instrument(skip(self, reply), fields(phone = %reply.from_phone))]
    pub async fn handle_customer_reply(
        &self,
        reply: InboundReply,
    ) -> Result<Option<Uuid>, ServiceError> {
        let phone = normalize_phone(&reply.from_phone);
        let waiting = self
            .verifications
            .query(Filter::new().eq("status", VerificationStatus::AwaitingCustomer))
            .await?
            .into_iter()
            .filter(|v| normalize_phone(&v.customer_phone) == phone)
            .last();
        let Some(verification) = waiting else {
            warn!("reply from a number with no pending verification");
            return Ok(None);
        };

        self.emit(
            verification.order_id,
            EventPayload::AddressReplyReceived(CustomerReply {
                order_id: verification.order_id,
                phone: reply.from_phone,
                body: reply.body,
                received_at: reply.received_at,
            }),
        )
        .await?;
        Ok(Some(verification.order_id))
    }

    async fn on_reply(&self, event: EventRecord) -> Result<(), ServiceError> {
        let EventPayload::AddressReplyReceived(reply) = event.payload else {
            return Ok(());
        };
        let Some(verification) = self.verification_for(reply.order_id).await? else {
            return Ok(());
        };
        if verification.status != VerificationStatus::AwaitingCustomer {
            debug!(order_id = %reply.order_id, status = %verification.status, "reply ignored");
            return Ok(());
        }

        match interpret_reply(&reply.body) {
            ReplyIntent::Confirm => {
                self.complete(
                    reply.order_id,
                    verification.original_address,
                    VerificationMethod::CustomerConfirmed,
                )
                .await
            }
            ReplyIntent::ShortCode(code) => match self.resolve_code(reply.order_id, &code).await? {
                Some(resolution) => {
                    let mut address = resolution.address;
                    address.short_code = Some(code);
                    address.coordinates = Some(resolution.coordinates);
                    self.complete(reply.order_id, address, VerificationMethod::CustomerConfirmed)
                        .await
                }
                None => {
                    info!(order_id = %reply.order_id, "replied code did not resolve, still waiting");
                    Ok(())
                }
            },
            ReplyIntent::CorrectedAddress(line) => {
                let mut address = verification.original_address;
                address.line1 = line;
                address.short_code = None;
                address.coordinates = None;
                self.complete(reply.order_id, address, VerificationMethod::CustomerConfirmed)
                    .await
            }
            ReplyIntent::Empty => Ok(()),
        }
    }

    /// Marks the verification verified and announces it. Idempotent.
    async fn complete(
        &self,
        order_id: Uuid,
        address: Address,
        method: VerificationMethod,
    ) -> Result<(), ServiceError> {
        let Some(verification) = self.verification_for(order_id).await? else {
            return Err(ServiceError::NotFound(format!(
                "No address verification for order {}",
                order_id
            )));
        };
        let now = self.clock.now();
        let (_, previous) = self
            .verifications
            .update_with(verification.id, |v| {
                if v.status == VerificationStatus::Verified {
                    return Ok(None);
                }
                let previous = v.status;
                v.status = VerificationStatus::Verified;
                v.verified_address = Some(address.clone());
                v.method = Some(method);
                v.failure_reason = None;
                v.resolved_at = Some(now);
                Ok(Some(previous))
            })
            .await?;
        let Some(previous) = previous else {
            return Ok(());
        };
        if previous == VerificationStatus::AwaitingCustomer {
            metrics::PENDING_VERIFICATIONS.dec();
        }

        info!(order_id = %order_id, method = %method, "address verified");
        self.emit(
            order_id,
            EventPayload::AddressVerified(AddressVerified {
                order_id,
                method,
                address,
            }),
        )
        .await
    }

    /// Operator-supplied address. Always succeeds and bypasses both tiers.
    #[instrument(skip(self, address), fields(order_id = %order_id))]
    pub async fn manual_verify(
        &self,
        order_id: Uuid,
        operator: &str,
        address: Address,
    ) -> Result<(), ServiceError> {
        let order = self.orders.find(order_id).await?;
        let verification = self.open_verification(&order).await?;
        if verification.status == VerificationStatus::Verified {
            // Re-open so the override is recorded as the final answer.
            self.verifications
                .update_with(verification.id, |v| {
                    v.status = VerificationStatus::Pending;
                    Ok(())
                })
                .await?;
        }

        self.emit(
            order_id,
            EventPayload::AddressManualOverride(ManualOverride {
                order_id,
                operator: operator.to_string(),
            }),
        )
        .await?;
        self.complete(order_id, address, VerificationMethod::Manual).await
    }

    /// Gives up on automatic and customer verification. The order is parked
    /// in an address exception until an operator steps in.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn mark_failed(&self, order_id: Uuid, reason: &str) -> Result<(), ServiceError> {
        let Some(verification) = self.verification_for(order_id).await? else {
            return Err(ServiceError::NotFound(format!(
                "No address verification for order {}",
                order_id
            )));
        };
        let now = self.clock.now();
        let (_, previous) = self
            .verifications
            .update_with(verification.id, |v| {
                if matches!(v.status, VerificationStatus::Verified | VerificationStatus::Failed) {
                    return Ok(None);
                }
                let previous = v.status;
                v.status = VerificationStatus::Failed;
                v.failure_reason = Some(reason.to_string());
                v.resolved_at = Some(now);
                Ok(Some(previous))
            })
            .await?;
        let Some(previous) = previous else {
            return Err(ServiceError::InvalidStatus(format!(
                "Verification for order {} is already {}",
                order_id, verification.status
            )));
        };
        if previous == VerificationStatus::AwaitingCustomer {
            metrics::PENDING_VERIFICATIONS.dec();
        }

        warn!(order_id = %order_id, reason, "address verification failed");
        self.emit(
            order_id,
            EventPayload::AddressVerificationFailed(OrderFailure {
                order_id,
                reason: reason.to_string(),
            }),
        )
        .await
    }

    /// Compares the delivery GPS fix with the cached coordinates for the
    /// order's short code and flags the cache entry when they diverge.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn check_accuracy(
        &self,
        order_id: Uuid,
        delivered_at: GeoPoint,
    ) -> Result<(), ServiceError> {
        let order = self.orders.find(order_id).await?;
        let Some(code) = order.shipping_address.short_code.as_deref() else {
            return Ok(());
        };
        let cache_id = AddressCacheEntry::id_for_code(code);
        let Some(entry) = self.cache.get(cache_id).await? else {
            debug!(short_code = code, "no cached coordinates to compare");
            return Ok(());
        };

        let divergence = haversine_meters(entry.coordinates, delivered_at);
        let threshold = self.config.accuracy_threshold_meters;
        let diverged = divergence > threshold;
        self.cache
            .update_with(cache_id, |e| {
                e.last_divergence_meters = Some(divergence);
                if diverged {
                    e.flagged_for_review = true;
                }
                Ok(())
            })
            .await?;

        let check = AccuracyChecked {
            order_id,
            short_code: entry.short_code.clone(),
            divergence_meters: divergence,
            threshold_meters: threshold,
        };
        let payload = if diverged {
            warn!(short_code = %entry.short_code, divergence, "cached address diverges from delivery location");
            EventPayload::AddressAccuracyFlagged(check)
        } else {
            EventPayload::AddressAccuracyConfirmed(check)
        };
        self.bus
            .emit(ModuleName::Nas, EntityRef::new(EntityType::AddressCache, cache_id), payload)
            .await?;
        Ok(())
    }

    pub async fn pending_verifications(&self) -> Result<Vec<AddressVerification>, ServiceError> {
        self.verifications
            .query(Filter::new().eq("status", VerificationStatus::AwaitingCustomer))
            .await
    }

    /// Verifications that have waited on the customer longer than the configured limit.
    pub async fn stale_verifications(&self) -> Result<Vec<AddressVerification>, ServiceError> {
        let cutoff = self.clock.now() - Duration::minutes(self.config.stale_after_minutes);
        Ok(self
            .pending_verifications()
            .await?
            .into_iter()
            .filter(|v| v.requested_at < cutoff)
            .collect())
    }

    pub async fn cache_entry(&self, code: &str) -> Result<Option<AddressCacheEntry>, ServiceError> {
        self.cache.get(AddressCacheEntry::id_for_code(code)).await
    }
}
