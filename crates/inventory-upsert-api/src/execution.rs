//! Phase-ordered execution of a planned record set.
//!
//! Writes inside one phase go out concurrently. A phase starts only after the
//! previous one settled, so parents exist before their children are written
//! and children are gone before their parents are deleted.

use futures::future::join_all;
use inventory_upsert_core::{
    EntityKind, ErrorCategory, InventoryStorage, Outcome, RecordError, RecordId, RecordPath, RecordSet,
    Transition,
};
use serde_json::Value;
use tracing::{debug, warn};

struct Write {
    path: RecordPath,
    kind: EntityKind,
    transition: Transition,
    id: Option<RecordId>,
    document: Value,
}

impl Write {
    fn of(set: &RecordSet, path: RecordPath) -> Option<Self> {
        let record = set.record(path)?;
        Some(Self {
            path,
            kind: record.kind,
            transition: record.transition,
            id: record.id.clone(),
            document: record.document.clone(),
        })
    }

    async fn send(self, storage: &dyn InventoryStorage) -> (RecordPath, Result<(), RecordError>) {
        let result = match (self.transition, self.id.as_ref()) {
            (Transition::Create, _) => storage.create(self.kind, &self.document).await.map(|_| ()),
            (Transition::Update, Some(id)) => storage.update(self.kind, id, &self.document).await,
            (Transition::Delete, Some(id)) => storage.delete(self.kind, id).await,
            (transition, _) => {
                let error = RecordError::new(
                    ErrorCategory::Internal,
                    500,
                    "Unexecutable record",
                    format!("{} cannot be written as {}", self.kind, transition.as_str()),
                );
                return (self.path, Err(error));
            }
        };
        (self.path, result.map_err(|err| err.to_record_error(self.kind)))
    }
}

/// Run every pending write of the set and record each outcome on its record.
pub async fn execute(storage: &dyn InventoryStorage, set: &mut RecordSet) {
    let relation_deletes = awaiting(set, Transition::Delete, is_relation);
    run_phase(storage, set, "relation deletes", relation_deletes).await;

    let instance_create = awaiting(set, Transition::Create, is_instance);
    run_phase(storage, set, "instance create", instance_create).await;
    if set.instance.transition == Transition::Create && set.instance.outcome != Outcome::Completed {
        set.mark_children_skipped();
        return;
    }
    let holdings_creates = awaiting(set, Transition::Create, is_holdings);
    run_phase(storage, set, "holdings creates", holdings_creates).await;
    skip_items_of_failed_holdings(set);

    let updates = awaiting(set, Transition::Update, |path| is_instance(path) || is_holdings(path));
    run_phase(storage, set, "updates", updates).await;

    let item_writes = [
        awaiting(set, Transition::Create, is_item),
        awaiting(set, Transition::Update, is_item),
    ]
    .concat();
    run_phase(storage, set, "item writes", item_writes).await;

    let item_deletes = awaiting(set, Transition::Delete, is_item);
    run_phase(storage, set, "item deletes", item_deletes).await;
    skip_holdings_still_owning_items(set);
    let holdings_deletes = awaiting(set, Transition::Delete, is_holdings);
    run_phase(storage, set, "holdings deletes", holdings_deletes).await;
    skip_instance_still_referenced(set);
    let instance_delete = awaiting(set, Transition::Delete, is_instance);
    run_phase(storage, set, "instance delete", instance_delete).await;

    let provisional_creates = awaiting(set, Transition::Create, is_provisional);
    run_phase(storage, set, "provisional instances", provisional_creates).await;
    skip_relations_without_target(set);
    let relation_creates = awaiting(set, Transition::Create, is_relation);
    run_phase(storage, set, "relation creates", relation_creates).await;

    write_statistical_codes(storage, set).await;
}

async fn run_phase(storage: &dyn InventoryStorage, set: &mut RecordSet, phase: &str, paths: Vec<RecordPath>) {
    if paths.is_empty() {
        return;
    }
    let writes = paths.into_iter().filter_map(|path| Write::of(set, path)).collect::<Vec<_>>();
    debug!(phase, writes = writes.len(), "executing phase");
    let results = join_all(writes.into_iter().map(|write| write.send(storage))).await;
    for (path, result) in results {
        let Some(record) = set.record_mut(path) else {
            continue;
        };
        match result {
            Ok(()) => record.complete(),
            Err(error) => {
                warn!(
                    phase,
                    entity = %record.kind,
                    natural_key = %record.natural_key,
                    error = %error.message,
                    "storage write failed"
                );
                record.fail(error);
            }
        }
    }
}

/// Store the statistical codes attached to records kept back from deletion.
///
/// A failure is reported on the record; its outcome stays SKIPPED.
async fn write_statistical_codes(storage: &dyn InventoryStorage, set: &mut RecordSet) {
    let writes = set
        .paths()
        .into_iter()
        .filter(|path| set.record(*path).is_some_and(|record| record.tag_pending && record.id.is_some()))
        .filter_map(|path| Write::of(set, path))
        .map(|write| Write { transition: Transition::Update, ..write })
        .collect::<Vec<_>>();
    if writes.is_empty() {
        return;
    }
    debug!(writes = writes.len(), "writing statistical codes");
    let results = join_all(writes.into_iter().map(|write| write.send(storage))).await;
    for (path, result) in results {
        let Some(record) = set.record_mut(path) else {
            continue;
        };
        record.tag_pending = false;
        if let Err(error) = result {
            warn!(entity = %record.kind, natural_key = %record.natural_key, error = %error.message, "statistical code update failed");
            record.error = Some(error);
        }
    }
}

fn awaiting(set: &RecordSet, transition: Transition, wanted: impl Fn(RecordPath) -> bool) -> Vec<RecordPath> {
    set.paths()
        .into_iter()
        .filter(|path| wanted(*path))
        .filter(|path| set.record(*path).is_some_and(|record| record.awaits(transition)))
        .collect()
}

fn is_instance(path: RecordPath) -> bool {
    path == RecordPath::Instance
}

fn is_holdings(path: RecordPath) -> bool {
    matches!(path, RecordPath::Holdings(_))
}

fn is_item(path: RecordPath) -> bool {
    matches!(path, RecordPath::Item(..))
}

fn is_relation(path: RecordPath) -> bool {
    matches!(path, RecordPath::Relation(_))
}

fn is_provisional(path: RecordPath) -> bool {
    matches!(path, RecordPath::Provisional(_))
}

fn skip_items_of_failed_holdings(set: &mut RecordSet) {
    for entry in &mut set.holdings {
        if entry.record.transition == Transition::Create && entry.record.outcome == Outcome::Failed {
            entry.items.iter_mut().filter(|item| item.is_pending()).for_each(|item| item.skip());
        }
    }
}

fn skip_holdings_still_owning_items(set: &mut RecordSet) {
    for entry in &mut set.holdings {
        if entry.record.awaits(Transition::Delete) && entry.items.iter().any(|item| item.is_persisted()) {
            entry.record.skip();
        }
    }
}

fn skip_instance_still_referenced(set: &mut RecordSet) {
    if !set.instance.awaits(Transition::Delete) {
        return;
    }
    let holdings_remain = set.holdings.iter().any(|entry| entry.record.is_persisted());
    let relations_remain = set.relations.iter().any(|relation| relation.record.is_persisted());
    if holdings_remain || relations_remain {
        set.instance.skip();
    }
}

fn skip_relations_without_target(set: &mut RecordSet) {
    for relation in &mut set.relations {
        let target_missing = relation
            .provisional
            .as_ref()
            .is_some_and(|provisional| provisional.outcome != Outcome::Completed);
        if target_missing && relation.record.is_pending() {
            relation.record.skip();
        }
    }
}

#[cfg(test)]
mod tests {
    use inventory_upsert_core::{
        plan_deletion, DeletionContext, InMemoryStorage, PlanError, ProcessingInstructions, StorageOp,
        UpsertPlan,
    };
    use serde_json::json;

    use super::*;

    fn planned(request: &Value) -> Result<RecordSet, PlanError> {
        let mut plan = UpsertPlan::new(
            RecordSet::from_request(request)?,
            None,
            ProcessingInstructions::default(),
            &[],
        )?;
        for lookup in plan.unresolved() {
            plan.resolve_foreign(lookup.path, None)?;
        }
        plan.finalize()
    }

    fn request() -> Value {
        json!({
            "instance": {"hrid": "in1", "title": "T"},
            "holdingsRecords": [
                {"hrid": "ho1", "items": [{"hrid": "it1"}, {"hrid": "it2"}]},
                {"hrid": "ho2", "items": [{"hrid": "it3"}]}
            ]
        })
    }

    #[tokio::test]
    async fn new_record_set_is_written_parents_first() -> Result<(), PlanError> {
        let storage = InMemoryStorage::new();
        let mut set = planned(&request())?;
        execute(&storage, &mut set).await;

        assert!(set.records().all(|record| record.outcome == Outcome::Completed));
        assert_eq!(storage.count(EntityKind::Item), 3);
        let operations = storage.operations();
        assert!(matches!(operations.first(), Some(StorageOp::Create { kind: EntityKind::Instance, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn failed_instance_create_skips_everything_below() -> Result<(), PlanError> {
        let storage = InMemoryStorage::new();
        storage.inject_failure("in1");
        let mut set = planned(&request())?;
        execute(&storage, &mut set).await;

        assert_eq!(set.instance.outcome, Outcome::Failed);
        assert!(set.holdings.iter().all(|entry| entry.record.outcome == Outcome::Skipped));
        assert!(storage.operations().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_holdings_create_skips_its_items_only() -> Result<(), PlanError> {
        let storage = InMemoryStorage::new();
        storage.inject_failure("ho1");
        let mut set = planned(&request())?;
        execute(&storage, &mut set).await;

        assert_eq!(set.holdings[0].record.outcome, Outcome::Failed);
        assert!(set.holdings[0].items.iter().all(|item| item.outcome == Outcome::Skipped));
        assert_eq!(set.holdings[1].items[0].outcome, Outcome::Completed);
        assert_eq!(storage.count(EntityKind::Item), 1);
        Ok(())
    }

    #[tokio::test]
    async fn deletion_runs_children_first_and_stops_at_failures() -> Result<(), PlanError> {
        let storage = InMemoryStorage::new();
        let mut created = planned(&request())?;
        execute(&storage, &mut created).await;

        let stored = RecordSet::from_stored(
            json!({"id": created.instance.document["id"], "hrid": "in1"}),
            created
                .holdings
                .iter()
                .map(|entry| {
                    (entry.record.document.clone(), entry.items.iter().map(|item| item.document.clone()).collect())
                })
                .collect(),
            Vec::new(),
        )?;
        storage.inject_failure("it3");
        let instructions = ProcessingInstructions::default();
        let context = DeletionContext { instructions: &instructions, active_statuses: &[], order_line_count: 0 };
        let mut set = plan_deletion(stored, &context);
        execute(&storage, &mut set).await;

        assert_eq!(set.holdings[0].record.outcome, Outcome::Completed);
        assert_eq!(set.holdings[1].items[0].outcome, Outcome::Failed);
        assert_eq!(set.holdings[1].record.outcome, Outcome::Skipped);
        assert_eq!(set.instance.outcome, Outcome::Skipped);
        assert_eq!(storage.count(EntityKind::HoldingsRecord), 1);
        Ok(())
    }

    #[tokio::test]
    async fn statistical_codes_are_stored_without_changing_outcomes() -> Result<(), PlanError> {
        let storage = InMemoryStorage::new();
        let mut created = planned(&json!({
            "instance": {"hrid": "in1", "title": "T"},
            "holdingsRecords": [{"hrid": "ho1", "items": [{"hrid": "it1"}]}]
        }))?;
        execute(&storage, &mut created).await;

        let instructions: ProcessingInstructions = serde_json::from_value(json!({
            "item": {
                "blockDeletion": {"ifField": "hrid", "matchesPattern": "it1"},
                "statisticalCoding": [{"if": "deleteSkipped", "becauseOf": "ITEM_PATTERN_MATCH", "setCode": "c-1"}]
            }
        }))
        .map_err(|err| PlanError::Validation(err.to_string()))?;
        let stored = RecordSet::from_stored(
            created.instance.document.clone(),
            vec![(created.holdings[0].record.document.clone(), vec![created.holdings[0].items[0].document.clone()])],
            Vec::new(),
        )?;
        let context = DeletionContext { instructions: &instructions, active_statuses: &[], order_line_count: 0 };
        let mut set = plan_deletion(stored, &context);
        execute(&storage, &mut set).await;

        let item = &set.holdings[0].items[0];
        assert_eq!(item.outcome, Outcome::Skipped);
        assert!(!item.tag_pending);
        let stored_items = storage.documents(EntityKind::Item);
        assert_eq!(stored_items[0]["statisticalCodeIds"], json!(["c-1"]));
        Ok(())
    }
}
