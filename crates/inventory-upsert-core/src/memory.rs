//! In-memory [`InventoryStorage`] with referential checks, failure injection
//! and an operation log for assertions.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::identity::{identifiers, MATCH_KEY_FIELD};
use crate::model::{text_field, EntityKind, RecordId, ID_FIELD, NATURAL_KEY_FIELD};
use crate::relations::StoredRelation;
use crate::storage::{InventoryStorage, Location, StorageError};

/// Record of a storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Create { kind: EntityKind, id: RecordId },
    Update { kind: EntityKind, id: RecordId },
    Delete { kind: EntityKind, id: RecordId },
    Batch { kind: EntityKind, size: usize },
}

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<EntityKind, BTreeMap<String, Value>>,
    locations: Vec<Location>,
    order_lines: Vec<Value>,
    operations: Vec<StorageOp>,
    fail_keys: HashSet<String>,
    batch_supported: bool,
}

#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State { batch_supported: true, ..State::default() })) }
    }

    /// A store that rejects every bulk call.
    #[must_use]
    pub fn without_batch_support() -> Self {
        Self { state: Arc::new(Mutex::new(State::default())) }
    }

    /// Make every write touching a record with this natural key (or id) fail.
    pub fn inject_failure(&self, key: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_keys.insert(key.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_keys.clear();
        }
    }

    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.state.lock().map(|state| state.operations.clone()).unwrap_or_default()
    }

    pub fn clear_operations(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.operations.clear();
        }
    }

    pub fn add_location(&self, id: &str, institution_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.locations.push(Location { id: id.to_string(), institution_id: institution_id.to_string() });
        }
    }

    /// Register a purchase order line; it must carry `instanceId`.
    pub fn add_order_line(&self, order_line: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.order_lines.push(order_line);
        }
    }

    /// Every stored document of one kind, ordered by id.
    #[must_use]
    pub fn documents(&self, kind: EntityKind) -> Vec<Value> {
        self.state
            .lock()
            .map(|state| state.documents.get(&kind).map(|docs| docs.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        self.documents(kind).len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Transport("in-memory store lock poisoned".to_string()))
    }
}

impl State {
    fn table(&self, kind: EntityKind) -> impl Iterator<Item = &Value> {
        self.documents.get(&kind).into_iter().flat_map(BTreeMap::values)
    }

    fn get(&self, kind: EntityKind, id: &str) -> Option<&Value> {
        self.documents.get(&kind).and_then(|docs| docs.get(id))
    }

    fn check_injected(&self, kind: EntityKind, document: &Value) -> Result<(), StorageError> {
        let keys = [text_field(document, NATURAL_KEY_FIELD), text_field(document, ID_FIELD)];
        if keys.iter().flatten().any(|key| self.fail_keys.contains(key)) {
            return Err(StorageError::Validation {
                status: 422,
                message: format!("injected failure for {kind}"),
            });
        }
        Ok(())
    }

    /// Enforce parent references and natural-key uniqueness for a write.
    fn check_write(&self, kind: EntityKind, id: &str, document: &Value) -> Result<(), StorageError> {
        self.check_injected(kind, document)?;
        let missing_reference = |field: &str, parent_kind: EntityKind| {
            let target = text_field(document, field).unwrap_or_default();
            if self.get(parent_kind, &target).is_none() {
                return Err(StorageError::Validation {
                    status: 422,
                    message: format!("{kind} {id} references missing {parent_kind} via {field}: {target}"),
                });
            }
            Ok(())
        };
        match kind {
            EntityKind::Instance => {}
            EntityKind::HoldingsRecord => missing_reference("instanceId", EntityKind::Instance)?,
            EntityKind::Item => missing_reference("holdingsRecordId", EntityKind::HoldingsRecord)?,
            EntityKind::InstanceRelationship => {
                missing_reference("superInstanceId", EntityKind::Instance)?;
                missing_reference("subInstanceId", EntityKind::Instance)?;
            }
            EntityKind::TitleSuccession => {
                missing_reference("precedingInstanceId", EntityKind::Instance)?;
                missing_reference("succeedingInstanceId", EntityKind::Instance)?;
            }
        }
        if let Some(hrid) = text_field(document, NATURAL_KEY_FIELD) {
            let taken = self.table(kind).any(|other| {
                text_field(other, NATURAL_KEY_FIELD).as_deref() == Some(hrid.as_str())
                    && text_field(other, ID_FIELD).as_deref() != Some(id)
            });
            if taken {
                return Err(StorageError::Validation {
                    status: 422,
                    message: format!("{kind} hrid {hrid} already exists"),
                });
            }
        }
        Ok(())
    }

    fn check_delete(&self, kind: EntityKind, id: &str) -> Result<(), StorageError> {
        let Some(document) = self.get(kind, id) else {
            return Err(StorageError::NotFound(format!("{kind} {id}")));
        };
        self.check_injected(kind, document)?;
        let referenced_by = |child: EntityKind, fields: &[&str]| {
            self.table(child)
                .any(|doc| fields.iter().any(|field| text_field(doc, field).as_deref() == Some(id)))
        };
        let blocked = match kind {
            EntityKind::Instance => {
                referenced_by(EntityKind::HoldingsRecord, &["instanceId"])
                    || referenced_by(EntityKind::InstanceRelationship, &["superInstanceId", "subInstanceId"])
                    || referenced_by(EntityKind::TitleSuccession, &["precedingInstanceId", "succeedingInstanceId"])
            }
            EntityKind::HoldingsRecord => referenced_by(EntityKind::Item, &["holdingsRecordId"]),
            EntityKind::Item | EntityKind::InstanceRelationship | EntityKind::TitleSuccession => false,
        };
        if blocked {
            return Err(StorageError::Validation {
                status: 422,
                message: format!("{kind} {id} is still referenced"),
            });
        }
        Ok(())
    }

    fn put(&mut self, kind: EntityKind, id: String, document: Value) {
        self.documents.entry(kind).or_default().insert(id, document);
    }
}

fn document_id(kind: EntityKind, document: &Value) -> Result<String, StorageError> {
    text_field(document, ID_FIELD).ok_or_else(|| StorageError::Validation {
        status: 422,
        message: format!("{kind} document has no {ID_FIELD}"),
    })
}

#[async_trait]
impl InventoryStorage for InMemoryStorage {
    async fn create(&self, kind: EntityKind, document: &Value) -> Result<RecordId, StorageError> {
        let mut state = self.lock()?;
        let id = document_id(kind, document)?;
        if state.get(kind, &id).is_some() {
            return Err(StorageError::Validation { status: 422, message: format!("{kind} {id} already exists") });
        }
        state.check_write(kind, &id, document)?;
        state.put(kind, id.clone(), document.clone());
        state.operations.push(StorageOp::Create { kind, id: RecordId(id.clone()) });
        Ok(RecordId(id))
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, document: &Value) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.get(kind, id.as_str()).is_none() {
            return Err(StorageError::NotFound(format!("{kind} {id}")));
        }
        state.check_write(kind, id.as_str(), document)?;
        state.put(kind, id.0.clone(), document.clone());
        state.operations.push(StorageOp::Update { kind, id: id.clone() });
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.check_delete(kind, id.as_str())?;
        if let Some(documents) = state.documents.get_mut(&kind) {
            documents.remove(id.as_str());
        }
        state.operations.push(StorageOp::Delete { kind, id: id.clone() });
        Ok(())
    }

    async fn find_by_natural_key(&self, kind: EntityKind, natural_key: &str) -> Result<Option<Value>, StorageError> {
        let state = self.lock()?;
        let found = state
            .table(kind)
            .find(|doc| text_field(doc, NATURAL_KEY_FIELD).as_deref() == Some(natural_key))
            .cloned();
        Ok(found)
    }

    async fn find_by_id(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Value>, StorageError> {
        Ok(self.lock()?.get(kind, id.as_str()).cloned())
    }

    async fn find_by_parent_id(&self, kind: EntityKind, parent: &RecordId) -> Result<Vec<Value>, StorageError> {
        let Some(field) = kind.parent_field() else {
            return Ok(Vec::new());
        };
        let state = self.lock()?;
        Ok(state
            .table(kind)
            .filter(|doc| text_field(doc, field).as_deref() == Some(parent.as_str()))
            .cloned()
            .collect())
    }

    async fn find_relations_by_instance_id(&self, id: &RecordId) -> Result<Vec<StoredRelation>, StorageError> {
        let state = self.lock()?;
        let mut relations = Vec::new();
        for (kind, fields) in [
            (EntityKind::InstanceRelationship, ["superInstanceId", "subInstanceId"]),
            (EntityKind::TitleSuccession, ["precedingInstanceId", "succeedingInstanceId"]),
        ] {
            relations.extend(
                state
                    .table(kind)
                    .filter(|doc| fields.iter().any(|field| text_field(doc, field).as_deref() == Some(id.as_str())))
                    .map(|doc| StoredRelation { kind, document: doc.clone() }),
            );
        }
        Ok(relations)
    }

    async fn find_locations(&self) -> Result<Vec<Location>, StorageError> {
        Ok(self.lock()?.locations.clone())
    }

    async fn find_order_lines_by_instance_id(&self, id: &RecordId) -> Result<Vec<Value>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .order_lines
            .iter()
            .filter(|line| text_field(line, "instanceId").as_deref() == Some(id.as_str()))
            .cloned()
            .collect())
    }

    async fn find_instance_by_match_key(&self, match_key: &str) -> Result<Option<Value>, StorageError> {
        let state = self.lock()?;
        let found = state
            .table(EntityKind::Instance)
            .find(|doc| text_field(doc, MATCH_KEY_FIELD).as_deref() == Some(match_key))
            .cloned();
        Ok(found)
    }

    async fn find_instances_by_identifier(
        &self,
        identifier_type_id: &str,
        value: &str,
    ) -> Result<Vec<Value>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .table(EntityKind::Instance)
            .filter(|doc| {
                identifiers(doc).iter().any(|identifier| {
                    text_field(identifier, "identifierTypeId").as_deref() == Some(identifier_type_id)
                        && text_field(identifier, "value").as_deref() == Some(value)
                })
            })
            .cloned()
            .collect())
    }

    async fn upsert_batch(&self, kind: EntityKind, documents: &[Value]) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if !state.batch_supported {
            return Err(StorageError::BatchRejected {
                status: 501,
                message: format!("batch upsert of {kind} is not supported"),
            });
        }
        let snapshot = state.documents.clone();
        for document in documents {
            let outcome = document_id(kind, document)
                .and_then(|id| state.check_write(kind, &id, document).map(|()| id));
            match outcome {
                Ok(id) => state.put(kind, id, document.clone()),
                Err(err) => {
                    state.documents = snapshot;
                    return Err(StorageError::BatchRejected { status: 422, message: err.to_string() });
                }
            }
        }
        state.operations.push(StorageOp::Batch { kind, size: documents.len() });
        Ok(())
    }
}
