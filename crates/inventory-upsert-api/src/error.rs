use inventory_upsert_core::{ErrorReport, PlanError, StorageError, UpsertReport};
use serde_json::Value;

/// Why a request produced no executable record set.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RequestError {
    #[must_use]
    pub fn to_report(&self, request: &Value) -> UpsertReport {
        match self {
            Self::Plan(error) => UpsertReport::from_plan_error(error, request),
            Self::NotFound(message) => UpsertReport::not_found(message.clone(), request),
            Self::Storage(error) => UpsertReport::from_storage_error(error, request),
        }
    }

    #[must_use]
    pub fn to_error_report(&self, request: &Value) -> ErrorReport {
        match self {
            Self::Plan(error) => ErrorReport::from_plan_error(error, request.clone()),
            Self::NotFound(message) => ErrorReport::not_found(message.clone(), request.clone()),
            Self::Storage(error) => ErrorReport::from_storage_error(error, request.clone()),
        }
    }
}
