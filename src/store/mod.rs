//! Entity persistence abstraction.
//!
//! Modules never talk to a database directly: every read and write goes
//! through [`EntityStore`], which stores entities as JSON field maps keyed by
//! [`EntityType`] and id, plus the append-only event log. [`Repository`] layers
//! typed access and optimistic-concurrency retries on top.

pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::events::EventRecord;

pub use memory::InMemoryStore;

/// Compare-and-update attempts before a write is reported as a conflict.
pub const MAX_CAS_ATTEMPTS: usize = 8;

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
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Order,
    OrderItem,
    Inventory,
    InventoryAdjustment,
    Bin,
    GoodsReceipt,
    PutawayTask,
    PickingTask,
    PackingTask,
    AddressVerification,
    AddressCache,
    Manifest,
    Route,
    Driver,
    OutboundDelivery,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
pub enum StoreError {
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("{entity_type} {id} already exists")]
    AlreadyExists { entity_type: EntityType, id: Uuid },

    #[error("version conflict on {entity_type} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_type: EntityType,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("invalid fields: {0}")]
    InvalidFields(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A stored entity: its field map plus the version used for compare-and-update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub id: Uuid,
    pub version: u64,
    pub fields: Value,
}

/// Equality filter over top-level entity fields. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.conditions.push((field.into(), value));
        self
    }

    pub fn matches(&self, fields: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| fields.get(field) == Some(expected))
    }
}

/// Generic persistence contract shared by every module.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, entity_type: EntityType, id: Uuid) -> Result<Option<StoredRow>, StoreError>;

    /// Creates an entity. The id is taken from the `id` field when present,
    /// otherwise one is generated and written back into the fields.
    async fn create(&self, entity_type: EntityType, fields: Value) -> Result<Uuid, StoreError>;

    /// Merges `partial` into the stored fields and bumps the version.
    async fn update(
        &self,
        entity_type: EntityType,
        id: Uuid,
        partial: Value,
    ) -> Result<u64, StoreError>;

    /// Like [`EntityStore::update`] but only applies when the stored version
    /// still equals `expected_version`.
    async fn compare_and_update(
        &self,
        entity_type: EntityType,
        id: Uuid,
        expected_version: u64,
        partial: Value,
    ) -> Result<u64, StoreError>;

    /// Rows matching `filter`, in creation order.
    async fn query(&self, entity_type: EntityType, filter: &Filter)
        -> Result<Vec<StoredRow>, StoreError>;

    /// Appends to the event log, assigning the next sequence number.
    async fn append_event(&self, record: EventRecord) -> Result<EventRecord, StoreError>;

    /// Event log entries in append order, optionally narrowed to one entity.
    async fn query_events(
        &self,
        entity_type: Option<EntityType>,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<EventRecord>, StoreError>;
}

/// Implemented by every persisted domain type.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> Uuid;
}

#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Typed view over an [`EntityStore`] for one entity type.
pub struct Repository<T> {
    store: Arc<dyn EntityStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Repository<T> {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    fn decode(row: StoredRow) -> Result<Versioned<T>, ServiceError> {
        let value = serde_json::from_value(row.fields)?;
        Ok(Versioned {
            version: row.version,
            value,
        })
    }

    pub async fn get_versioned(&self, id: Uuid) -> Result<Option<Versioned<T>>, ServiceError> {
        match self.store.get(T::ENTITY_TYPE, id).await? {
            Some(row) => Ok(Some(Self::decode(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<T>, ServiceError> {
        Ok(self.get_versioned(id).await?.map(|v| v.value))
    }

    /// Like [`Repository::get`] but a missing entity is an error.
    pub async fn find(&self, id: Uuid) -> Result<T, ServiceError> {
        self.get(id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("{} {} not found", T::ENTITY_TYPE, id))
        })
    }

    pub async fn insert(&self, entity: &T) -> Result<Uuid, ServiceError> {
        let fields = serde_json::to_value(entity)?;
        Ok(self.store.create(T::ENTITY_TYPE, fields).await?)
    }

    pub async fn patch(&self, id: Uuid, partial: Value) -> Result<(), ServiceError> {
        self.store.update(T::ENTITY_TYPE, id, partial).await?;
        Ok(())
    }

    pub async fn query(&self, filter: Filter) -> Result<Vec<T>, ServiceError> {
        self.store
            .query(T::ENTITY_TYPE, &filter)
            .await?
            .into_iter()
            .map(|row| Self::decode(row).map(|v| v.value))
            .collect()
    }

    pub async fn all(&self) -> Result<Vec<T>, ServiceError> {
        self.query(Filter::new()).await
    }

    /// Read-modify-write under optimistic concurrency.
    ///
    /// `mutate` may run several times when another writer wins the race, so
    /// it must be free of side effects beyond the entity it is handed. A
    /// mutation that leaves the entity unchanged is not written back.
    pub async fn update_with<R, F>(&self, id: Uuid, mut mutate: F) -> Result<(T, R), ServiceError>
    where
        F: FnMut(&mut T) -> Result<R, ServiceError> + Send,
        R: Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.get_versioned(id).await?.ok_or_else(|| {
                ServiceError::NotFound(format!("{} {} not found", T::ENTITY_TYPE, id))
            })?;
            let before = serde_json::to_value(&current.value)?;
            let mut value = current.value;
            let result = mutate(&mut value)?;
            let after = serde_json::to_value(&value)?;
            if after == before {
                return Ok((value, result));
            }

            match self
                .store
                .compare_and_update(T::ENTITY_TYPE, id, current.version, after)
                .await
            {
                Ok(_) => return Ok((value, result)),
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(
                        entity_type = %T::ENTITY_TYPE,
                        entity_id = %id,
                        attempt,
                        "version conflict, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::ConcurrentModification(id))
    }
}

/// Shallow-merges `partial` into `target`. Both must be JSON objects and the
/// `id` field is never overwritten.
pub(crate) fn merge_fields(target: &mut Value, partial: Value) -> Result<(), StoreError> {
    let Value::Object(updates) = partial else {
        return Err(StoreError::InvalidFields(
            "partial update must be an object".to_string(),
        ));
    };
    let target: &mut Map<String, Value> = target
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidFields("stored fields are not an object".to_string()))?;
    for (key, value) in updates {
        if key == "id" {
            continue;
        }
        target.insert(key, value);
    }
    Ok(())
}
