use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{EntityKind, ErrorCategory, RecordError, RecordId};
use crate::relations::StoredRelation;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StorageError {
    #[error("storage transport error: {0}")]
    Transport(String),
    #[error("storage rejected the record ({status}): {message}")]
    Validation { status: u16, message: String },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("batch rejected ({status}): {message}")]
    BatchRejected { status: u16, message: String },
}

impl StorageError {
    /// The record-level error this failure is reported as.
    #[must_use]
    pub fn to_record_error(&self, kind: EntityKind) -> RecordError {
        let (category, status, short) = match self {
            Self::Transport(_) => (ErrorCategory::Storage, 503, "Storage unavailable"),
            Self::Validation { status, .. } => (ErrorCategory::Storage, *status, "Storage rejected record"),
            Self::NotFound(_) => (ErrorCategory::Storage, 404, "Record not found"),
            Self::BatchRejected { status, .. } => {
                (ErrorCategory::BatchStorage, *status, "Batch rejected")
            }
        };
        RecordError::new(category, status, format!("{short} ({kind})"), self.to_string())
    }
}

/// Physical location and the institution that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: String,
    pub institution_id: String,
}

/// Remote inventory store the planner reconciles against.
///
/// Documents are JSON objects in their stored shape. Writes carry the identity
/// chosen by the planner in the document's `id` field.
#[async_trait]
pub trait InventoryStorage: Send + Sync {
    async fn create(&self, kind: EntityKind, document: &Value) -> Result<RecordId, StorageError>;

    async fn update(&self, kind: EntityKind, id: &RecordId, document: &Value) -> Result<(), StorageError>;

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<(), StorageError>;

    async fn find_by_natural_key(&self, kind: EntityKind, natural_key: &str) -> Result<Option<Value>, StorageError>;

    async fn find_by_id(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Value>, StorageError>;

    /// Holdings of an instance, or items of a holdings record.
    async fn find_by_parent_id(&self, kind: EntityKind, parent: &RecordId) -> Result<Vec<Value>, StorageError>;

    /// Relationships and title successions on either side of the instance.
    async fn find_relations_by_instance_id(&self, id: &RecordId) -> Result<Vec<StoredRelation>, StorageError>;

    async fn find_locations(&self) -> Result<Vec<Location>, StorageError>;

    async fn find_order_lines_by_instance_id(&self, id: &RecordId) -> Result<Vec<Value>, StorageError>;

    async fn find_instance_by_match_key(&self, match_key: &str) -> Result<Option<Value>, StorageError>;

    async fn find_instances_by_identifier(
        &self,
        identifier_type_id: &str,
        value: &str,
    ) -> Result<Vec<Value>, StorageError>;

    /// Create or replace every document of one kind in a single call.
    ///
    /// Either all documents are stored or none are. Stores without bulk
    /// support reject every call.
    async fn upsert_batch(&self, kind: EntityKind, _documents: &[Value]) -> Result<(), StorageError> {
        Err(StorageError::BatchRejected {
            status: 501,
            message: format!("batch upsert of {kind} is not supported"),
        })
    }
}
