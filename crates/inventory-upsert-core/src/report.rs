use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::Metrics;
use crate::model::{EntityKind, ErrorCategory, Outcome, RecordError};
use crate::record_set::RecordSet;
use crate::storage::StorageError;
use crate::PlanError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Ok,
    PartialSuccess,
    NotFound,
    BadRequest,
    InternalError,
}

impl ReportStatus {
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::PartialSuccess => 207,
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::InternalError => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityKind>,
    pub request_json: Value,
    pub short_message: String,
    pub message: String,
}

impl ErrorReport {
    #[must_use]
    pub fn from_record(kind: EntityKind, error: &RecordError, request_json: Value) -> Self {
        Self {
            category: error.category,
            status_code: error.status_code,
            entity_type: Some(kind),
            request_json,
            short_message: error.short_message.clone(),
            message: error.message.clone(),
        }
    }

    #[must_use]
    pub fn from_plan_error(error: &PlanError, request_json: Value) -> Self {
        let (category, status_code, short_message) = match error {
            PlanError::Validation(_) => (ErrorCategory::Validation, 400, "Invalid request"),
            PlanError::Internal(_) => (ErrorCategory::Internal, 500, "Internal error"),
        };
        Self {
            category,
            status_code,
            entity_type: None,
            request_json,
            short_message: short_message.to_string(),
            message: error.to_string(),
        }
    }

    /// A storage failure hit before any record could be planned.
    #[must_use]
    pub fn from_storage_error(error: &StorageError, request_json: Value) -> Self {
        let record_error = error.to_record_error(EntityKind::Instance);
        Self {
            category: record_error.category,
            status_code: record_error.status_code,
            entity_type: None,
            request_json,
            short_message: record_error.short_message,
            message: record_error.message,
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>, request_json: Value) -> Self {
        Self {
            category: ErrorCategory::Validation,
            status_code: 404,
            entity_type: Some(EntityKind::Instance),
            request_json,
            short_message: "Not found".to_string(),
            message: message.into(),
        }
    }
}

/// Caller-facing result of an upsert, delete or batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpsertReport {
    pub status: ReportStatus,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_set: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub record_sets: Vec<Value>,
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorReport>,
}

impl UpsertReport {
    fn with_status(status: ReportStatus) -> Self {
        Self {
            status,
            status_code: status.status_code(),
            record_set: None,
            record_sets: Vec::new(),
            metrics: Metrics::new(),
            errors: Vec::new(),
        }
    }

    /// Report for one executed record set.
    #[must_use]
    pub fn from_record_set(set: &RecordSet) -> Self {
        let errors = record_errors(set);
        let mut report = Self::with_status(if errors.is_empty() {
            ReportStatus::Ok
        } else {
            ReportStatus::PartialSuccess
        });
        report.record_set = Some(set.to_result_document());
        report.metrics = Metrics::from_record_set(set);
        report.errors = errors;
        report
    }

    /// Report for a request rejected before any storage write.
    #[must_use]
    pub fn from_plan_error(error: &PlanError, request: &Value) -> Self {
        let status = match error {
            PlanError::Validation(_) => ReportStatus::BadRequest,
            PlanError::Internal(_) => ReportStatus::InternalError,
        };
        let mut report = Self::with_status(status);
        report.errors.push(ErrorReport::from_plan_error(error, request.clone()));
        report
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>, request: &Value) -> Self {
        let mut report = Self::with_status(ReportStatus::NotFound);
        report.errors.push(ErrorReport::not_found(message, request.clone()));
        report
    }

    /// Report for a request that could not load what it needed from storage.
    #[must_use]
    pub fn from_storage_error(error: &StorageError, request: &Value) -> Self {
        let mut report = Self::with_status(ReportStatus::InternalError);
        report.errors.push(ErrorReport::from_storage_error(error, request.clone()));
        report
    }

    /// Attach errors that arose outside the record set, such as failed
    /// side updates. An OK report becomes a partial success.
    pub fn push_errors(&mut self, errors: Vec<ErrorReport>) {
        if errors.is_empty() {
            return;
        }
        self.errors.extend(errors);
        if self.status == ReportStatus::Ok {
            self.status = ReportStatus::PartialSuccess;
            self.status_code = self.status.status_code();
        }
    }

    /// Combine the per-set results of a batch.
    ///
    /// `rejected` carries errors for sets excluded before planning.
    #[must_use]
    pub fn batch(sets: &[RecordSet], rejected: Vec<ErrorReport>) -> Self {
        let mut report = Self::with_status(ReportStatus::Ok);
        for set in sets {
            report.metrics.merge(&Metrics::from_record_set(set));
            report.record_sets.push(set.to_result_document());
            report.errors.extend(record_errors(set));
        }
        let internal = rejected.iter().any(|error| error.category == ErrorCategory::Internal);
        report.errors.extend(rejected);
        if !report.errors.is_empty() {
            report.status = if sets.is_empty() && internal {
                ReportStatus::InternalError
            } else if sets.is_empty() {
                ReportStatus::BadRequest
            } else {
                ReportStatus::PartialSuccess
            };
            report.status_code = report.status.status_code();
        }
        report
    }
}

fn record_errors(set: &RecordSet) -> Vec<ErrorReport> {
    set.records()
        .chain(set.provisional_records())
        .filter_map(|record| {
            let error = record.error.as_ref()?;
            (record.outcome == Outcome::Failed || record.outcome == Outcome::Skipped)
                .then(|| ErrorReport::from_record(record.kind, error, record.document.clone()))
        })
        .collect()
}
