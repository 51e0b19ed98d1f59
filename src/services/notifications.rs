use std::sync::Arc;

use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{DeliveryStatus, NotificationPurpose, OutboundDelivery};
use crate::errors::ServiceError;
use crate::events::payloads::{NotificationFailed, NotificationResent};
use crate::events::{EntityRef, EventBus, EventPayload, ModuleName};
use crate::integrations::MessagingClient;
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{EntityType, Filter, Repository};

/// Outbound messaging with retries and a record of every delivery.
///
/// A message that still fails after the retry budget is a handled failure:
/// it is stored as a failed [`OutboundDelivery`], announced on the bus, and
/// can be resent later by an operator. Callers never see the error.
pub struct Notifier {
    bus: Arc<EventBus>,
    messaging: Arc<dyn MessagingClient>,
    deliveries: Repository<OutboundDelivery>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    pub fn new(
        bus: Arc<EventBus>,
        messaging: Arc<dyn MessagingClient>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            deliveries: Repository::new(bus.store()),
            bus,
            messaging,
            policy,
            clock,
        }
    }

    /// Sends `body` to `recipient`. Returns the provider message id, or `None`
    /// when delivery permanently failed.
    #[instrument(skip(self, body), fields(purpose = %purpose))]
    pub async fn send(
        &self,
        order_id: Option<Uuid>,
        purpose: NotificationPurpose,
        recipient: &str,
        body: &str,
    ) -> Result<Option<String>, ServiceError> {
        let now = self.clock.now();
        let result = retry_with_backoff(&self.policy, "messaging", || {
            self.messaging.send_text(recipient, body)
        })
        .await;

        let mut delivery = OutboundDelivery {
            id: Uuid::new_v4(),
            order_id,
            purpose,
            recipient: recipient.to_string(),
            body: body.to_string(),
            status: DeliveryStatus::Sent,
            attempts: 1,
            message_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        match result {
            Ok(message_id) => {
                delivery.message_id = Some(message_id.clone());
                self.deliveries.insert(&delivery).await?;
                info!(recipient, message_id = %message_id, "message sent");
                Ok(Some(message_id))
            }
            Err(failure) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.attempts = failure.attempts;
                delivery.last_error = Some(failure.error.to_string());
                self.deliveries.insert(&delivery).await?;
                self.announce_failure(&delivery).await?;
                Ok(None)
            }
        }
    }

    async fn announce_failure(&self, delivery: &OutboundDelivery) -> Result<(), ServiceError> {
        metrics::NOTIFICATION_FAILURES
            .with_label_values(&[delivery.purpose.to_string().as_str()])
            .inc();
        error!(
            delivery_id = %delivery.id,
            recipient = %delivery.recipient,
            attempts = delivery.attempts,
            error = delivery.last_error.as_deref().unwrap_or_default(),
            "message permanently failed"
        );
        self.bus
            .emit(
                ModuleName::Integrations,
                EntityRef::new(EntityType::OutboundDelivery, delivery.id),
                EventPayload::NotificationFailed(NotificationFailed {
                    delivery_id: delivery.id,
                    order_id: delivery.order_id,
                    purpose: delivery.purpose,
                    recipient: delivery.recipient.clone(),
                    attempts: delivery.attempts,
                    error: delivery.last_error.clone().unwrap_or_default(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Retries a failed delivery with a fresh retry budget.
    #[instrument(skip(self))]
    pub async fn resend(&self, delivery_id: Uuid) -> Result<String, ServiceError> {
        let delivery = self.deliveries.find(delivery_id).await?;
        if delivery.status != DeliveryStatus::Failed {
            return Err(ServiceError::InvalidOperation(format!(
                "Delivery {} was already sent",
                delivery_id
            )));
        }

        let result = retry_with_backoff(&self.policy, "messaging", || {
            self.messaging.send_text(&delivery.recipient, &delivery.body)
        })
        .await;
        let now = self.clock.now();

        match result {
            Ok(message_id) => {
                let sent_id = message_id.clone();
                self.deliveries
                    .update_with(delivery_id, |d| {
                        d.status = DeliveryStatus::Sent;
                        d.attempts += 1;
                        d.message_id = Some(sent_id.clone());
                        d.last_error = None;
                        d.updated_at = now;
                        Ok(())
                    })
                    .await?;
                self.bus
                    .emit(
                        ModuleName::Integrations,
                        EntityRef::new(EntityType::OutboundDelivery, delivery_id),
                        EventPayload::NotificationResent(NotificationResent {
                            delivery_id,
                            message_id: message_id.clone(),
                        }),
                    )
                    .await?;
                Ok(message_id)
            }
            Err(failure) => {
                let attempts = failure.attempts;
                let last_error = failure.error.to_string();
                self.deliveries
                    .update_with(delivery_id, |d| {
                        d.attempts += attempts;
                        d.last_error = Some(last_error.clone());
                        d.updated_at = now;
                        Ok(())
                    })
                    .await?;
                Err(failure.error)
            }
        }
    }

    pub async fn failed_deliveries(&self) -> Result<Vec<OutboundDelivery>, ServiceError> {
        self.deliveries
            .query(Filter::new().eq("status", DeliveryStatus::Failed))
            .await
    }

    pub async fn deliveries_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<OutboundDelivery>, ServiceError> {
        self.deliveries
            .query(Filter::new().eq("order_id", order_id))
            .await
    }
}
