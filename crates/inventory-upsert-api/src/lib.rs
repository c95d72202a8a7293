use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use inventory_upsert_core::model::text_field;
use inventory_upsert_core::{
    plan_deletion, DeletionContext, EntityKind, InstanceIdentifier, InventoryStorage, PlanError,
    ProcessingInstructions, RecordId, RecordSet, StorageError, Transition, UpsertPlan, UpsertReport,
};
use inventory_upsert_store_sqlite::{SchemaStatus, SqliteStorage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

mod batch;
pub mod error;
pub mod execution;
pub mod fetch;
pub mod locations;
pub mod settings;
mod shared;

pub use error::RequestError;
pub use execution::execute;
pub use fetch::StoredGraph;
pub use locations::LocationCache;
pub use settings::UpsertSettings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// A `SQLite` inventory database addressed by path.
pub struct InventoryDatabase {
    db_path: PathBuf,
}

impl InventoryDatabase {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStorage> {
        SqliteStorage::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Open the database at its latest schema and wrap it in an upsert api.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open_api(&self, settings: UpsertSettings) -> Result<InventoryUpsertApi> {
        let store = self.open_store()?;
        store.migrate()?;
        Ok(InventoryUpsertApi::new(Arc::new(store), settings))
    }

    /// Register a location and the institution that owns it.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_location(&self, id: &str, institution_id: &str) -> Result<()> {
        let store = self.open_store()?;
        store.migrate()?;
        store.add_location(id, institution_id)
    }

    /// Register a purchase order line referencing an instance.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn add_order_line(&self, id: &str, instance_id: &str) -> Result<Value> {
        let store = self.open_store()?;
        store.migrate()?;
        store.add_order_line(id, instance_id)
    }
}

/// Reconciles inventory record sets against a storage collaborator.
#[derive(Clone)]
pub struct InventoryUpsertApi {
    storage: Arc<dyn InventoryStorage>,
    locations: Arc<LocationCache>,
    settings: UpsertSettings,
}

impl InventoryUpsertApi {
    #[must_use]
    pub fn new(storage: Arc<dyn InventoryStorage>, settings: UpsertSettings) -> Self {
        let locations = Arc::new(LocationCache::new(Arc::clone(&storage)));
        Self { storage, locations, settings }
    }

    /// Share a location cache between several api values over the same storage.
    #[must_use]
    pub fn with_location_cache(
        storage: Arc<dyn InventoryStorage>,
        locations: Arc<LocationCache>,
        settings: UpsertSettings,
    ) -> Self {
        Self { storage, locations, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &UpsertSettings {
        &self.settings
    }

    #[must_use]
    pub fn locations(&self) -> &LocationCache {
        &self.locations
    }

    /// Create or update one record set matched on the instance natural key.
    pub async fn upsert(&self, request: &Value) -> UpsertReport {
        match self.plan_upsert(request).await {
            Ok(mut set) => {
                execute(self.storage.as_ref(), &mut set).await;
                UpsertReport::from_record_set(&set)
            }
            Err(error) => {
                warn!(error = %error, "upsert request rejected");
                error.to_report(request)
            }
        }
    }

    /// Delete the record set whose instance carries the requested `hrid`.
    pub async fn delete(&self, request: &Value) -> UpsertReport {
        match self.plan_delete(request).await {
            Ok(mut set) => {
                execute(self.storage.as_ref(), &mut set).await;
                UpsertReport::from_record_set(&set)
            }
            Err(error) => {
                warn!(error = %error, "delete request rejected");
                error.to_report(request)
            }
        }
    }

    /// The stored record set of an instance, as stored.
    ///
    /// # Errors
    /// Returns the storage error when the graph cannot be loaded.
    pub async fn show(&self, hrid: &str) -> Result<Option<Value>, StorageError> {
        Ok(StoredGraph::find(self.storage.as_ref(), hrid).await?.map(|graph| graph.to_document()))
    }

    async fn plan_upsert(&self, request: &Value) -> Result<RecordSet, RequestError> {
        let incoming = RecordSet::from_request(request)?;
        let instructions = self.settings.instructions_for(request)?;
        let storage = self.storage.as_ref();
        let mut found = StoredGraph::find(storage, &incoming.instance.natural_key).await?;
        if found.is_none() {
            if let Some(id) = text_field(&incoming.instance.document, "id") {
                found = StoredGraph::find_by_id(storage, &RecordId(id)).await?;
            }
        }
        let existing = match found {
            Some(graph) => Some(graph.into_record_set()?),
            None => None,
        };
        self.complete_plan(incoming, existing, instructions).await
    }

    /// Resolve everything the planner could not settle locally and finalize.
    async fn complete_plan(
        &self,
        incoming: RecordSet,
        existing: Option<RecordSet>,
        instructions: ProcessingInstructions,
    ) -> Result<RecordSet, RequestError> {
        let storage = self.storage.as_ref();
        let mut plan = UpsertPlan::new(incoming, existing, instructions, &self.settings.active_item_statuses)?;

        let lookups = plan.unresolved();
        let found = try_join_all(
            lookups.iter().map(|lookup| storage.find_by_natural_key(lookup.kind, &lookup.natural_key)),
        )
        .await?;
        for (lookup, document) in lookups.into_iter().zip(found) {
            plan.resolve_foreign(lookup.path, document)?;
        }

        let targets = plan.relation_targets();
        let target_documents = try_join_all(targets.iter().map(|target| async move {
            match target {
                InstanceIdentifier::Hrid(hrid) => storage.find_by_natural_key(EntityKind::Instance, hrid).await,
                InstanceIdentifier::Uuid(uuid) => {
                    storage.find_by_id(EntityKind::Instance, &RecordId::from(uuid.as_str())).await
                }
            }
        }))
        .await?;
        let resolved = targets
            .into_iter()
            .zip(target_documents)
            .filter_map(|(target, document)| {
                let id = document?.get("id")?.as_str().map(RecordId::from)?;
                Some((target, id))
            })
            .collect::<HashMap<_, _>>();
        plan.plan_relations(&resolved);

        let set = plan.finalize()?;
        log_plan("upsert", &set);
        Ok(set)
    }

    async fn plan_delete(&self, request: &Value) -> Result<RecordSet, RequestError> {
        let hrid = request
            .get("hrid")
            .and_then(Value::as_str)
            .filter(|hrid| !hrid.trim().is_empty())
            .ok_or_else(|| PlanError::Validation("delete request MUST carry an hrid".to_string()))?;
        let instructions = self.settings.instructions_for(request)?;
        let Some(graph) = StoredGraph::find(self.storage.as_ref(), hrid).await? else {
            return Err(RequestError::NotFound(format!("instance {hrid} not found")));
        };
        let order_line_count = self.order_line_count(&graph).await?;
        let context = DeletionContext {
            instructions: &instructions,
            active_statuses: &self.settings.active_item_statuses,
            order_line_count,
        };
        let mut set = plan_deletion(graph.into_record_set()?, &context);
        set.request = request.clone();
        log_plan("delete", &set);
        Ok(set)
    }

    async fn order_line_count(&self, graph: &StoredGraph) -> Result<usize, RequestError> {
        let Some(id) = graph.instance_id() else {
            return Err(PlanError::Internal("stored instance has no identity".to_string()).into());
        };
        Ok(self.storage.find_order_lines_by_instance_id(&id).await?.len())
    }
}

fn log_plan(operation: &str, set: &RecordSet) {
    let count = |transition: Transition| set.records().filter(|record| record.transition == transition).count();
    info!(
        operation,
        hrid = %set.instance.natural_key,
        instance = set.instance.transition.as_str(),
        creates = count(Transition::Create),
        updates = count(Transition::Update),
        deletes = count(Transition::Delete),
        "planned record set"
    );
}

/// Open an api over a `SQLite` database file, migrating it when needed.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated.
pub fn open_sqlite_api(db_path: PathBuf, settings: UpsertSettings) -> Result<InventoryUpsertApi> {
    InventoryDatabase::new(db_path.clone())
        .open_api(settings)
        .with_context(|| format!("failed to open inventory database at {}", db_path.display()))
}

#[cfg(test)]
mod tests {
    use inventory_upsert_core::{ConstraintKind, InMemoryStorage, Outcome, ReportStatus};
    use serde_json::json;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("inventory-upsert-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn api(storage: &InMemoryStorage) -> InventoryUpsertApi {
        InventoryUpsertApi::new(Arc::new(storage.clone()), UpsertSettings::default())
    }

    fn holdings(hrid: &str, items: &[&str]) -> Value {
        json!({
            "hrid": hrid,
            "permanentLocationId": "loc-1",
            "items": items.iter().map(|item| json!({"hrid": item, "status": {"name": "Available"}})).collect::<Vec<_>>(),
        })
    }

    fn count(report: &UpsertReport, kind: EntityKind, transition: Transition, outcome: Outcome) -> u64 {
        report.metrics.get(kind, transition, outcome)
    }

    // Test IDs: TIU-001
    #[tokio::test]
    async fn same_document_twice_creates_then_updates() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        let request = json!({
            "instance": {"hrid": "1", "title": "Title"},
            "holdingsRecords": [holdings("H1", &["IT1"])]
        });

        let first = api.upsert(&request).await;
        assert_eq!(first.status, ReportStatus::Ok);
        assert_eq!(count(&first, EntityKind::Item, Transition::Create, Outcome::Completed), 1);
        let ids = storage.documents(EntityKind::Item);

        let second = api.upsert(&request).await;
        assert_eq!(count(&second, EntityKind::Instance, Transition::Update, Outcome::Completed), 1);
        assert_eq!(count(&second, EntityKind::Item, Transition::Update, Outcome::Completed), 1);
        assert_eq!(storage.documents(EntityKind::Item)[0]["id"], ids[0]["id"]);
        assert_eq!(storage.count(EntityKind::Instance), 1);
    }

    // Test IDs: TIU-002
    #[tokio::test]
    async fn moved_item_is_one_update_with_stable_identity() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({
            "instance": {"hrid": "1"},
            "holdingsRecords": [holdings("A", &["IT1"]), holdings("B", &[])]
        }))
        .await;
        let before = storage.documents(EntityKind::Item);

        let report = api
            .upsert(&json!({
                "instance": {"hrid": "1"},
                "holdingsRecords": [holdings("A", &[]), holdings("B", &["IT1"])]
            }))
            .await;
        assert_eq!(count(&report, EntityKind::Item, Transition::Update, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::Item, Transition::Delete, Outcome::Completed), 0);
        assert_eq!(count(&report, EntityKind::Item, Transition::Create, Outcome::Completed), 0);
        let after = storage.documents(EntityKind::Item);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0]["id"], before[0]["id"]);
        assert_ne!(after[0]["holdingsRecordId"], before[0]["holdingsRecordId"]);
    }

    // Test IDs: TIU-002
    #[tokio::test]
    async fn item_moved_to_another_instance_keeps_its_identity() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({"instance": {"hrid": "1"}, "holdingsRecords": [holdings("H1", &["IT1"])]}))
            .await;
        let before = storage.documents(EntityKind::Item);

        let report = api
            .upsert(&json!({"instance": {"hrid": "2"}, "holdingsRecords": [holdings("H2", &["IT1"])]}))
            .await;
        assert_eq!(report.status, ReportStatus::Ok);
        assert_eq!(count(&report, EntityKind::Item, Transition::Update, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::Item, Transition::Create, Outcome::Completed), 0);

        let after = storage.documents(EntityKind::Item);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0]["id"], before[0]["id"]);
        let h2 = storage
            .documents(EntityKind::HoldingsRecord)
            .into_iter()
            .find(|holdings| holdings["hrid"] == "H2")
            .map(|holdings| holdings["id"].clone());
        assert_eq!(Some(after[0]["holdingsRecordId"].clone()), h2);
        assert_eq!(storage.count(EntityKind::HoldingsRecord), 2);
    }

    // Test IDs: TIU-002
    #[tokio::test]
    async fn holdings_moved_to_another_instance_bring_their_items() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({"instance": {"hrid": "1"}, "holdingsRecords": [holdings("H1", &["IT1", "IT2"])]}))
            .await;
        let before = storage.documents(EntityKind::HoldingsRecord);

        let report = api
            .upsert(&json!({"instance": {"hrid": "2"}, "holdingsRecords": [holdings("H1", &["IT1", "IT2"])]}))
            .await;
        assert_eq!(report.status, ReportStatus::Ok);
        assert_eq!(count(&report, EntityKind::HoldingsRecord, Transition::Update, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::Item, Transition::Update, Outcome::Completed), 2);

        let moved = storage.documents(EntityKind::HoldingsRecord);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0]["id"], before[0]["id"]);
        let second = storage
            .documents(EntityKind::Instance)
            .into_iter()
            .find(|instance| instance["hrid"] == "2")
            .map(|instance| instance["id"].clone());
        assert_eq!(Some(moved[0]["instanceId"].clone()), second);
        assert_eq!(storage.count(EntityKind::Item), 2);
    }

    // Test IDs: TIU-001
    #[tokio::test]
    async fn instance_is_matched_on_its_id_when_the_hrid_changed() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        let first = api.upsert(&json!({"instance": {"id": "in-fixed", "hrid": "1", "title": "Old"}})).await;
        assert_eq!(count(&first, EntityKind::Instance, Transition::Create, Outcome::Completed), 1);

        let report = api.upsert(&json!({"instance": {"id": "in-fixed", "hrid": "1b", "title": "New"}})).await;
        assert_eq!(report.status, ReportStatus::Ok);
        assert_eq!(count(&report, EntityKind::Instance, Transition::Update, Outcome::Completed), 1);
        let instances = storage.documents(EntityKind::Instance);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0]["id"], "in-fixed");
        assert_eq!(instances[0]["hrid"], "1b");
    }

    // Test IDs: TIU-003
    #[tokio::test]
    async fn omitted_holdings_are_deleted_but_absent_property_keeps_them() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({
            "instance": {"hrid": "1"},
            "holdingsRecords": [holdings("H1", &["IT1"]), holdings("H2", &["IT2"])]
        }))
        .await;

        let untouched = api.upsert(&json!({"instance": {"hrid": "1", "title": "New"}})).await;
        assert_eq!(count(&untouched, EntityKind::HoldingsRecord, Transition::Delete, Outcome::Completed), 0);
        assert_eq!(storage.count(EntityKind::HoldingsRecord), 2);

        let report = api
            .upsert(&json!({"instance": {"hrid": "1"}, "holdingsRecords": [holdings("H2", &["IT2"])]}))
            .await;
        assert_eq!(report.status, ReportStatus::Ok);
        assert_eq!(count(&report, EntityKind::HoldingsRecord, Transition::Delete, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::Item, Transition::Delete, Outcome::Completed), 1);
        let remaining = storage.documents(EntityKind::HoldingsRecord);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["hrid"], "H2");
        assert_eq!(storage.documents(EntityKind::Item)[0]["hrid"], "IT2");

        let emptied = api.upsert(&json!({"instance": {"hrid": "1"}, "holdingsRecords": []})).await;
        assert_eq!(count(&emptied, EntityKind::HoldingsRecord, Transition::Delete, Outcome::Completed), 1);
        assert_eq!(storage.count(EntityKind::HoldingsRecord), 0);
        assert_eq!(storage.count(EntityKind::Item), 0);
    }

    // Test IDs: TIU-004
    #[tokio::test]
    async fn blocked_item_keeps_its_ancestors() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({
            "instance": {"hrid": "1"},
            "holdingsRecords": [holdings("H1", &["keep-1", "IT2"]), holdings("H2", &["IT3"])]
        }))
        .await;

        let report = api
            .delete(&json!({
                "hrid": "1",
                "processing": {"item": {"blockDeletion": {"ifField": "hrid", "matchesPattern": "^keep"}}}
            }))
            .await;
        assert_eq!(report.status, ReportStatus::Ok);
        assert_eq!(count(&report, EntityKind::Item, Transition::Delete, Outcome::Skipped), 1);
        assert_eq!(count(&report, EntityKind::Item, Transition::Delete, Outcome::Completed), 2);
        assert_eq!(count(&report, EntityKind::HoldingsRecord, Transition::Delete, Outcome::Skipped), 1);
        assert_eq!(count(&report, EntityKind::HoldingsRecord, Transition::Delete, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::Instance, Transition::Delete, Outcome::Skipped), 1);
        let Some(record_set) = report.record_set.as_ref() else {
            panic!("report should carry the record set");
        };
        assert_eq!(
            record_set["instance"]["reconciliation"]["constraints"],
            json!([ConstraintKind::ItemPatternMatch.as_str()])
        );
        assert_eq!(storage.count(EntityKind::Item), 1);
    }

    // Test IDs: TIU-005
    #[tokio::test]
    async fn purchase_order_lines_keep_the_instance() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({"instance": {"hrid": "1"}, "holdingsRecords": [holdings("H1", &[])]})).await;
        let instance_id = storage.documents(EntityKind::Instance)[0]["id"].clone();
        storage.add_order_line(json!({"id": "po-1", "instanceId": instance_id}));

        let report = api.delete(&json!({"hrid": "1"})).await;
        assert_eq!(count(&report, EntityKind::HoldingsRecord, Transition::Delete, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::Instance, Transition::Delete, Outcome::Skipped), 1);
        assert_eq!(storage.count(EntityKind::Instance), 1);
    }

    #[tokio::test]
    async fn missing_delete_target_is_not_found() {
        let api = api(&InMemoryStorage::new());
        let report = api.delete(&json!({"hrid": "nope"})).await;
        assert_eq!(report.status, ReportStatus::NotFound);
        assert_eq!(report.status_code, 404);
        let invalid = api.delete(&json!({})).await;
        assert_eq!(invalid.status, ReportStatus::BadRequest);
    }

    // Test IDs: TIU-006
    #[tokio::test]
    async fn parent_relation_added_then_removed() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        api.upsert(&json!({"instance": {"hrid": "P"}})).await;

        let added = api
            .upsert(&json!({
                "instance": {"hrid": "C"},
                "instanceRelations": {"parentInstances": [
                    {"instanceIdentifier": {"hrid": "P"}, "instanceRelationshipTypeId": "multipart"}
                ]}
            }))
            .await;
        assert_eq!(added.status, ReportStatus::Ok);
        assert_eq!(count(&added, EntityKind::InstanceRelationship, Transition::Create, Outcome::Completed), 1);
        assert_eq!(storage.count(EntityKind::InstanceRelationship), 1);

        let kept = api.upsert(&json!({"instance": {"hrid": "C"}})).await;
        assert_eq!(kept.metrics.total(), 1);
        assert_eq!(storage.count(EntityKind::InstanceRelationship), 1);

        let removed = api
            .upsert(&json!({"instance": {"hrid": "C"}, "instanceRelations": {"parentInstances": []}}))
            .await;
        assert_eq!(count(&removed, EntityKind::InstanceRelationship, Transition::Delete, Outcome::Completed), 1);
        assert_eq!(storage.count(EntityKind::InstanceRelationship), 0);
    }

    #[tokio::test]
    async fn missing_target_is_created_provisionally() {
        let storage = InMemoryStorage::new();
        let api = api(&storage);
        let report = api
            .upsert(&json!({
                "instance": {"hrid": "S"},
                "instanceRelations": {
                    "precedingTitles": [{
                        "instanceIdentifier": {"hrid": "OLD"},
                        "provisionalInstance": {"title": "Earlier title", "instanceTypeId": "text"}
                    }],
                    "succeedingTitles": [{"instanceIdentifier": {"hrid": "NEXT"}}]
                }
            }))
            .await;
        assert_eq!(report.status, ReportStatus::PartialSuccess);
        assert_eq!(report.metrics.counts(inventory_upsert_core::Bucket::ProvisionalInstance, Transition::Create).completed, 1);
        assert_eq!(count(&report, EntityKind::Instance, Transition::Create, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::TitleSuccession, Transition::Create, Outcome::Completed), 1);
        assert_eq!(count(&report, EntityKind::TitleSuccession, Transition::Create, Outcome::Failed), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(storage.count(EntityKind::Instance), 2);
    }

    #[tokio::test]
    async fn failed_child_write_is_a_partial_success() {
        let storage = InMemoryStorage::new();
        storage.inject_failure("IT2");
        let api = api(&storage);
        let report = api
            .upsert(&json!({"instance": {"hrid": "1"}, "holdingsRecords": [holdings("H1", &["IT1", "IT2"])]}))
            .await;
        assert_eq!(report.status, ReportStatus::PartialSuccess);
        assert_eq!(count(&report, EntityKind::Item, Transition::Create, Outcome::Failed), 1);
        assert_eq!(report.errors[0].entity_type, Some(EntityKind::Item));
    }

    #[tokio::test]
    async fn malformed_request_is_bad_request() {
        let api = api(&InMemoryStorage::new());
        let report = api.upsert(&json!({"instance": {"title": "no hrid"}})).await;
        assert_eq!(report.status, ReportStatus::BadRequest);
        assert!(report.record_set.is_none());
    }

    #[tokio::test]
    async fn sqlite_database_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let database = InventoryDatabase::new(db_path.clone());
        let planned = database.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1]);

        let api = database.open_api(UpsertSettings::default())?;
        let report = api
            .upsert(&json!({"instance": {"hrid": "1", "title": "T"}, "holdingsRecords": [holdings("H1", &["IT1"])]}))
            .await;
        assert_eq!(report.status, ReportStatus::Ok);
        let shown = api.show("1").await?;
        assert_eq!(shown.as_ref().map(|graph| graph["holdingsRecords"][0]["items"][0]["hrid"].clone()), Some(json!("IT1")));

        let status = database.schema_status()?;
        assert!(status.pending_versions.is_empty());
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
