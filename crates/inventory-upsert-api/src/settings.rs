use inventory_upsert_core::{ProcessingInstructions, DEFAULT_ACTIVE_ITEM_STATUSES};
use serde::Deserialize;

/// Deployment-wide defaults applied to every request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpsertSettings {
    /// Used when a request carries no `processing` element.
    pub processing: ProcessingInstructions,
    /// Item statuses that protect an item from deletion.
    pub active_item_statuses: Vec<String>,
    /// Degrade to the single-record path when a bulk call is rejected.
    pub degrade_rejected_batches: bool,
}

impl Default for UpsertSettings {
    fn default() -> Self {
        Self {
            processing: ProcessingInstructions::default(),
            active_item_statuses: DEFAULT_ACTIVE_ITEM_STATUSES.iter().map(ToString::to_string).collect(),
            degrade_rejected_batches: true,
        }
    }
}

impl UpsertSettings {
    /// The processing instructions a request asks for, or the configured default.
    ///
    /// # Errors
    /// Returns [`inventory_upsert_core::PlanError::Validation`] when the request
    /// carries malformed instructions.
    pub fn instructions_for(
        &self,
        request: &serde_json::Value,
    ) -> Result<ProcessingInstructions, inventory_upsert_core::PlanError> {
        Ok(ProcessingInstructions::from_request(request)?.unwrap_or_else(|| self.processing.clone()))
    }
}
