//! Planning core for reconciling inventory record sets against storage.
//!
//! Everything here is synchronous and free of side effects except
//! [`InventoryStorage`], the seam through which the api crate drives
//! lookups and writes.

pub mod deletion;
pub mod identity;
pub mod instructions;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod metrics;
pub mod model;
pub mod planner;
pub mod record_set;
pub mod relations;
pub mod report;
pub mod storage;

pub use deletion::{apply_statistical_coding, plan_deletion, plan_shared_deletion, DeletionContext};
pub use identity::{compute_match_key, merge_identifiers, strip_identifier, LocalIdentifier, MATCH_KEY_FIELD};
pub use instructions::{EntityInstructions, FieldPattern, ProcessingInstructions, StatusPolicy};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{InMemoryStorage, StorageOp};
pub use metrics::{Bucket, Counts, Metrics};
pub use model::{
    ConstraintKind, EntityKind, ErrorCategory, Outcome, Record, RecordError, RecordId, Transition,
};
pub use planner::{ForeignLookup, UpsertPlan, DEFAULT_ACTIVE_ITEM_STATUSES};
pub use record_set::{HoldingsEntry, RecordPath, RecordSet};
pub use relations::{InstanceIdentifier, RelationRecord, RelationRequests, RelationRole, StoredRelation};
pub use report::{ErrorReport, ReportStatus, UpsertReport};
pub use storage::{InventoryStorage, Location, StorageError};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PlanError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}
