use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{merge_fields, EntityStore, EntityType, Filter, StoreError, StoredRow};
use crate::events::EventRecord;

#[derive(Debug, Clone)]
struct Row {
    version: u64,
    created_seq: u64,
    fields: Value,
}

/// Process-local store backed by `DashMap`. Used by the CLI and the tests.
#[derive(Default)]
pub struct InMemoryStore {
    rows: DashMap<(EntityType, Uuid), Row>,
    created: AtomicU64,
    events: RwLock<Vec<EventRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(
        &self,
        entity_type: EntityType,
        id: Uuid,
        expected_version: Option<u64>,
        partial: Value,
    ) -> Result<u64, StoreError> {
        let mut row = self
            .rows
            .get_mut(&(entity_type, id))
            .ok_or(StoreError::NotFound { entity_type, id })?;
        if let Some(expected) = expected_version {
            if row.version != expected {
                return Err(StoreError::VersionConflict {
                    entity_type,
                    id,
                    expected,
                    actual: row.version,
                });
            }
        }
        merge_fields(&mut row.fields, partial)?;
        row.version += 1;
        Ok(row.version)
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("event log lock poisoned".to_string())
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn get(
        &self,
        entity_type: EntityType,
        id: Uuid,
    ) -> Result<Option<StoredRow>, StoreError> {
        Ok(self.rows.get(&(entity_type, id)).map(|row| StoredRow {
            id,
            version: row.version,
            fields: row.fields.clone(),
        }))
    }

    async fn create(&self, entity_type: EntityType, mut fields: Value) -> Result<Uuid, StoreError> {
        let object = fields
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidFields("entity must be an object".to_string()))?;
        let id = match object.get("id").and_then(Value::as_str) {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|e| StoreError::InvalidFields(format!("invalid id: {}", e)))?,
            None => {
                let id = Uuid::new_v4();
                object.insert("id".to_string(), Value::String(id.to_string()));
                id
            }
        };

        match self.rows.entry((entity_type, id)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists { entity_type, id })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Row {
                    version: 1,
                    created_seq: self.created.fetch_add(1, Ordering::SeqCst),
                    fields,
                });
                Ok(id)
            }
        }
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: Uuid,
        partial: Value,
    ) -> Result<u64, StoreError> {
        self.write(entity_type, id, None, partial)
    }

    async fn compare_and_update(
        &self,
        entity_type: EntityType,
        id: Uuid,
        expected_version: u64,
        partial: Value,
    ) -> Result<u64, StoreError> {
        self.write(entity_type, id, Some(expected_version), partial)
    }

    async fn query(
        &self,
        entity_type: EntityType,
        filter: &Filter,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let mut matched: Vec<(u64, StoredRow)> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == entity_type && filter.matches(&entry.value().fields))
            .map(|entry| {
                let row = entry.value();
                (
                    row.created_seq,
                    StoredRow {
                        id: entry.key().1,
                        version: row.version,
                        fields: row.fields.clone(),
                    },
                )
            })
            .collect();
        matched.sort_by_key(|(seq, _)| *seq);
        Ok(matched.into_iter().map(|(_, row)| row).collect())
    }

    async fn append_event(&self, mut record: EventRecord) -> Result<EventRecord, StoreError> {
        let mut log = self.events.write().map_err(|_| Self::poisoned())?;
        record.sequence = log.len() as u64 + 1;
        log.push(record.clone());
        Ok(record)
    }

    async fn query_events(
        &self,
        entity_type: Option<EntityType>,
        entity_id: Option<Uuid>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let log = self.events.read().map_err(|_| Self::poisoned())?;
        Ok(log
            .iter()
            .filter(|r| entity_type.map_or(true, |t| r.entity_type == t))
            .filter(|r| entity_id.map_or(true, |id| r.entity_id == id))
            .cloned()
            .collect())
    }
}
