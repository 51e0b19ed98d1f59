//! Typed in-process event bus.
//!
//! Modules never call each other directly: they emit [`EventPayload`]s and
//! subscribe to [`EventCode`]s. Every emitted event is appended to the store's
//! event log before any handler runs; handlers then run one after another in
//! registration order, each supervised in its own task so that a failing or
//! panicking handler is dead-lettered instead of taking its siblings down.

pub mod dead_letter;
pub mod payloads;
pub mod taxonomy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::ServiceError;
use crate::metrics;
use crate::store::{EntityStore, EntityType};

pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use taxonomy::{EventCode, EventPayload};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModuleName {
    Oms,
    Nas,
    Wms,
    Dms,
    Lms,
    Tracking,
    Integrations,
}

/// The entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: Uuid) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    pub fn order(order_id: Uuid) -> Self {
        Self::new(EntityType::Order, order_id)
    }
}

/// One entry of the append-only event log. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub record_id: Uuid,
    pub sequence: u64,
    pub event_id: String,
    pub event_type: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub source: ModuleName,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn code(&self) -> EventCode {
        self.payload.code()
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_event(&self, event: EventRecord) -> Result<(), ServiceError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ServiceError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_event(&self, event: EventRecord) -> Result<(), ServiceError> {
        (self.f)(event).await
    }
}

/// Outcome of delivering one record to its subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct EventBus {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<EventCode, Vec<Arc<dyn EventHandler>>>>,
    observers: RwLock<Vec<Arc<dyn EventHandler>>>,
    dead_letters: DeadLetterSink,
}

impl EventBus {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            handlers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            dead_letters: DeadLetterSink::new(),
        }
    }

    pub fn subscribe(&self, code: EventCode, handler: Arc<dyn EventHandler>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.entry(code).or_default().push(handler),
            Err(_) => error!(event_id = code.event_id(), "handler registry lock poisoned"),
        }
    }

    pub fn subscribe_fn<F, Fut>(&self, code: EventCode, name: &str, f: F)
    where
        F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        self.subscribe(code, Arc::new(FnHandler::new(name, f)));
    }

    /// Subscribes a method of a shared service. The service handle is cloned
    /// into every invocation.
    pub fn subscribe_with<S, F, Fut>(&self, code: EventCode, name: &str, service: Arc<S>, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        self.subscribe_fn(code, name, move |event| f(service.clone(), event));
    }

    /// Registers an observer that sees every event, before the code-specific handlers.
    pub fn subscribe_any(&self, handler: Arc<dyn EventHandler>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(handler),
            Err(_) => error!("observer registry lock poisoned"),
        }
    }

    pub fn subscriber_count(&self, code: EventCode) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(&code).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.dead_letters
    }

    pub fn store(&self) -> Arc<dyn EntityStore> {
        self.store.clone()
    }

    /// Appends the event to the log, then delivers it to every subscriber.
    ///
    /// Handler failures never surface here: they are logged and dead-lettered.
    /// The only error is a failure to persist the record itself.
    pub async fn emit(
        &self,
        source: ModuleName,
        entity: EntityRef,
        payload: EventPayload,
    ) -> Result<EventRecord, ServiceError> {
        let code = payload.code();
        if code.owner() != source {
            debug!(
                event_id = code.event_id(),
                owner = %code.owner(),
                source = %source,
                "event emitted by a module other than its owner"
            );
        }

        let record = EventRecord {
            record_id: Uuid::new_v4(),
            sequence: 0,
            event_id: code.event_id().to_string(),
            event_type: code.event_type().to_string(),
            entity_type: entity.entity_type,
            entity_id: entity.entity_id,
            source,
            payload,
            timestamp: self.clock.now(),
        };
        let record = self.store.append_event(record).await.map_err(|e| {
            error!(event_id = code.event_id(), error = %e, "failed to append event");
            ServiceError::EventError(format!("failed to append {}: {}", code.event_id(), e))
        })?;

        metrics::EVENTS_EMITTED
            .with_label_values(&[code.event_type(), source.as_label()])
            .inc();
        debug!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            sequence = record.sequence,
            entity_id = %record.entity_id,
            source = %source,
            "event emitted"
        );

        self.dispatch(&record).await;
        Ok(record)
    }

    /// Re-delivers a logged event to its current subscribers without appending it again.
    pub async fn replay(&self, record_id: Uuid) -> Result<DispatchReport, ServiceError> {
        let record = self
            .store
            .query_events(None, None)
            .await?
            .into_iter()
            .find(|r| r.record_id == record_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Event record {} not found", record_id)))?;

        self.dead_letters.mark_replayed(record_id);
        Ok(self.dispatch(&record).await)
    }

    fn subscribers_for(&self, code: EventCode) -> Vec<Arc<dyn EventHandler>> {
        let mut subscribers = self
            .observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default();
        if let Ok(handlers) = self.handlers.read() {
            if let Some(for_code) = handlers.get(&code) {
                subscribers.extend(for_code.iter().cloned());
            }
        }
        subscribers
    }

    async fn dispatch(&self, record: &EventRecord) -> DispatchReport {
        let mut report = DispatchReport::default();

        for handler in self.subscribers_for(record.code()) {
            let name = handler.name().to_string();
            let event = record.clone();
            let outcome = tokio::spawn(async move { handler.handle_event(event).await }).await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((e.kind(), e.to_string())),
                Err(join_error) if join_error.is_panic() => {
                    Some(("panic", "handler panicked".to_string()))
                }
                Err(join_error) => Some(("task", format!("handler task failed: {}", join_error))),
            };

            match failure {
                None => report.delivered += 1,
                Some((kind, message)) => {
                    report.failed += 1;
                    metrics::HANDLER_FAILURES
                        .with_label_values(&[name.as_str(), kind])
                        .inc();
                    error!(
                        handler = %name,
                        event_id = %record.event_id,
                        entity_id = %record.entity_id,
                        kind,
                        error = %message,
                        "event handler failed"
                    );
                    self.dead_letters.push(DeadLetter {
                        id: Uuid::new_v4(),
                        record: record.clone(),
                        handler: name,
                        kind,
                        error: message,
                        failed_at: self.clock.now(),
                        replayed: false,
                    });
                }
            }
        }
        report
    }
}

impl ModuleName {
    pub fn as_label(self) -> &'static str {
        match self {
            ModuleName::Oms => "oms",
            ModuleName::Nas => "nas",
            ModuleName::Wms => "wms",
            ModuleName::Dms => "dms",
            ModuleName::Lms => "lms",
            ModuleName::Tracking => "tracking",
            ModuleName::Integrations => "integrations",
        }
    }
}
