//! Transition planning for one upsert request.
//!
//! Planning runs in three steps that the caller drives:
//!
//! 1. [`UpsertPlan::new`] matches the incoming set against the stored set of
//!    the same instance, assigning UPDATE to matched records and DELETE or
//!    NONE to stored records the request omits.
//! 2. The caller looks up every [`ForeignLookup`] store-wide and feeds the
//!    answers to [`UpsertPlan::resolve_foreign`], then resolves relation
//!    targets for [`UpsertPlan::plan_relations`].
//! 3. [`UpsertPlan::finalize`] stamps identities and parent references and
//!    hands back the record set ready for execution.

use std::collections::HashMap;

use serde_json::Value;

use crate::deletion::apply_statistical_coding;
use crate::instructions::{EntityInstructions, ProcessingInstructions};
use crate::model::{text_field, ConstraintKind, EntityKind, Record, RecordId, Transition, ID_FIELD};
use crate::record_set::{HoldingsEntry, RecordPath, RecordSet};
use crate::relations::{plan_relations, InstanceIdentifier, RelationRecord};
use crate::PlanError;

/// Item statuses that protect an item from deletion.
pub const DEFAULT_ACTIVE_ITEM_STATUSES: [&str; 9] = [
    "Awaiting delivery",
    "Awaiting pickup",
    "Checked out",
    "Aged to lost",
    "Claimed returned",
    "Declared lost",
    "In process",
    "In transit",
    "Paged",
];

/// An incoming child that did not match within its own instance and must be
/// looked up store-wide by natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignLookup {
    pub path: RecordPath,
    pub kind: EntityKind,
    pub natural_key: String,
}

#[derive(Debug, Clone, Copy)]
enum HoldingsFate {
    Matched(usize),
    Appended(usize),
    Untouched,
}

#[derive(Debug, Clone)]
pub struct UpsertPlan {
    set: RecordSet,
    existing_relations: Vec<RelationRecord>,
    instructions: ProcessingInstructions,
    active_statuses: Vec<String>,
}

impl UpsertPlan {
    /// Match an incoming record set against the stored one.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when a stored record has no identity.
    pub fn new(
        incoming: RecordSet,
        existing: Option<RecordSet>,
        instructions: ProcessingInstructions,
        active_statuses: &[String],
    ) -> Result<Self, PlanError> {
        let mut plan = Self {
            set: incoming,
            existing_relations: Vec::new(),
            instructions,
            active_statuses: active_statuses.to_vec(),
        };

        match existing {
            Some(existing) => {
                plan.adopt(RecordPath::Instance, existing.instance)?;
                plan.existing_relations = existing.relations;
                plan.reconcile_children(existing.holdings)?;
            }
            None => {
                let id = text_field(&plan.set.instance.document, ID_FIELD)
                    .map_or_else(RecordId::generate, RecordId);
                plan.set.instance.plan_create(id);
            }
        }
        Ok(plan)
    }

    #[must_use]
    pub fn record_set(&self) -> &RecordSet {
        &self.set
    }

    #[must_use]
    pub fn instance_id(&self) -> Option<&RecordId> {
        self.set.instance.id.as_ref()
    }

    /// Incoming holdings and items that still need a store-wide lookup.
    #[must_use]
    pub fn unresolved(&self) -> Vec<ForeignLookup> {
        self.set
            .paths()
            .into_iter()
            .filter(|path| matches!(path, RecordPath::Holdings(_) | RecordPath::Item(..)))
            .filter_map(|path| {
                let record = self.set.record(path)?;
                (record.transition == Transition::Unknown).then(|| ForeignLookup {
                    path,
                    kind: record.kind,
                    natural_key: record.natural_key.clone(),
                })
            })
            .collect()
    }

    /// Settle an unresolved record: a stored document found elsewhere makes it
    /// an UPDATE that moves the record here, no document makes it a CREATE.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when the path does not address an
    /// unresolved record or the stored document has no identity.
    pub fn resolve_foreign(&mut self, path: RecordPath, found: Option<Value>) -> Result<(), PlanError> {
        let Some(record) = self.set.record(path) else {
            return Err(PlanError::Internal(format!("no record at {path:?}")));
        };
        if record.transition != Transition::Unknown {
            return Err(PlanError::Internal(format!(
                "{} {} is already resolved",
                record.kind, record.natural_key
            )));
        }
        let kind = record.kind;
        match found {
            Some(document) => self.adopt(path, Record::existing(kind, document)?),
            None => {
                let Some(record) = self.set.record_mut(path) else {
                    return Err(PlanError::Internal(format!("no record at {path:?}")));
                };
                let id = text_field(&record.document, ID_FIELD).map_or_else(RecordId::generate, RecordId);
                record.plan_create(id);
                Ok(())
            }
        }
    }

    /// Every instance the relation lists of the request point at.
    #[must_use]
    pub fn relation_targets(&self) -> Vec<InstanceIdentifier> {
        self.set.relation_requests.targets()
    }

    /// Diff relations once their targets are resolved to stored instance identities.
    pub fn plan_relations(&mut self, resolved: &HashMap<InstanceIdentifier, RecordId>) {
        let Some(instance_id) = self.set.instance.id.clone() else {
            return;
        };
        let existing = std::mem::take(&mut self.existing_relations);
        self.set.relations = plan_relations(&instance_id, &self.set.relation_requests, existing, resolved);
    }

    /// Stamp identities and parent references and return the executable set.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when any record was left unresolved.
    pub fn finalize(mut self) -> Result<RecordSet, PlanError> {
        if !self.existing_relations.is_empty() {
            let resolved = HashMap::new();
            self.plan_relations(&resolved);
        }

        let set = &mut self.set;
        ensure_planned(&set.instance)?;
        let Some(instance_id) = set.instance.id.clone() else {
            return Err(PlanError::Internal("instance has no identity after planning".to_string()));
        };
        set.instance.stamp_id();

        for entry in &mut set.holdings {
            ensure_planned(&entry.record)?;
            if writes_document(&entry.record) {
                entry.record.stamp_id();
                entry.record.stamp_parent(&instance_id);
            }
            let holdings_id = entry.record.id.clone();
            for item in &mut entry.items {
                ensure_planned(item)?;
                if !writes_document(item) {
                    continue;
                }
                let Some(holdings_id) = holdings_id.as_ref() else {
                    return Err(PlanError::Internal(format!(
                        "item {} has a holdings record without identity",
                        item.natural_key
                    )));
                };
                item.stamp_id();
                item.stamp_parent(holdings_id);
            }
        }
        for relation in &set.relations {
            ensure_planned(&relation.record)?;
        }

        for path in set.paths() {
            if let Some(record) = set.record_mut(path) {
                if record.awaits(Transition::None) {
                    record.skip();
                }
            }
        }
        apply_statistical_coding(set, &self.instructions);
        Ok(self.set)
    }

    /// Take over a stored record's identity for the incoming record at `path`.
    fn adopt(&mut self, path: RecordPath, stored: Record) -> Result<(), PlanError> {
        let Some(id) = stored.id.clone() else {
            return Err(PlanError::Internal(format!(
                "stored {} {} has no identity",
                stored.kind, stored.natural_key
            )));
        };
        let Some(record) = self.set.record_mut(path) else {
            return Err(PlanError::Internal(format!("no record at {path:?}")));
        };
        let incoming = std::mem::take(&mut record.document);
        record.document = retain_values(&self.instructions, stored.kind, &stored.document, incoming);
        record.plan_update(id);
        Ok(())
    }

    fn rules(&self, kind: EntityKind) -> Option<&EntityInstructions> {
        self.instructions.for_kind(kind)
    }

    fn is_active(&self, item: &Record) -> bool {
        text_field(&item.document, "status.name").is_some_and(|status| {
            self.active_statuses.iter().any(|active| active.eq_ignore_ascii_case(&status))
        })
    }

    fn reconcile_children(&mut self, existing: Vec<HoldingsEntry>) -> Result<(), PlanError> {
        let mut stored_items = Vec::new();
        for entry in existing {
            let fate = self.place_stored_holdings(entry.record)?;
            stored_items.extend(entry.items.into_iter().map(|item| (fate, item)));
        }

        let mut appended = Vec::new();
        for (fate, item) in stored_items {
            if let Some((holdings_pos, item_pos)) = self.set.item_position(&item.natural_key) {
                self.adopt(RecordPath::Item(holdings_pos, item_pos), item)?;
                continue;
            }
            let placed = match fate {
                HoldingsFate::Untouched => None,
                HoldingsFate::Matched(pos) => {
                    let items_present = self.set.holdings.get(pos).is_some_and(|entry| entry.items_present);
                    items_present.then(|| (pos, self.omitted_item(item)))
                }
                HoldingsFate::Appended(pos) => {
                    let retained_holdings = self
                        .set
                        .holdings
                        .get(pos)
                        .is_some_and(|entry| entry.record.transition == Transition::None);
                    let mut item = item;
                    if retained_holdings {
                        item.plan_untouched();
                    } else {
                        item = self.omitted_item(item);
                    }
                    appended.push(pos);
                    Some((pos, item))
                }
            };
            if let Some((pos, item)) = placed {
                if let Some(entry) = self.set.holdings.get_mut(pos) {
                    entry.items.push(item);
                }
            }
        }

        appended.sort_unstable();
        appended.dedup();
        for pos in appended {
            if let Some(entry) = self.set.holdings.get_mut(pos) {
                settle_deleted_holdings(entry);
            }
        }
        self.set.reindex()
    }

    fn place_stored_holdings(&mut self, stored: Record) -> Result<HoldingsFate, PlanError> {
        if let Some(pos) = self.set.holdings_position(&stored.natural_key) {
            self.adopt(RecordPath::Holdings(pos), stored)?;
            return Ok(HoldingsFate::Matched(pos));
        }
        if !self.set.holdings_present {
            return Ok(HoldingsFate::Untouched);
        }
        let mut stored = stored;
        if self.rules(EntityKind::HoldingsRecord).is_some_and(|rules| rules.retain_omitted_record(&stored.document)) {
            stored.plan_untouched();
        } else {
            stored.plan_delete();
        }
        self.set.holdings.push(HoldingsEntry { record: stored, items: Vec::new(), items_present: true });
        Ok(HoldingsFate::Appended(self.set.holdings.len() - 1))
    }

    fn omitted_item(&self, mut item: Record) -> Record {
        if self.rules(EntityKind::Item).is_some_and(|rules| rules.retain_omitted_record(&item.document)) {
            item.plan_untouched();
            return item;
        }
        item.plan_delete();
        if self.is_active(&item) {
            item.retain(ConstraintKind::ItemStatus);
        }
        item
    }
}

/// A holdings record planned for deletion gives way to what happens to its items.
fn settle_deleted_holdings(entry: &mut HoldingsEntry) {
    if entry.record.transition != Transition::Delete {
        return;
    }
    if entry.items.iter().any(|item| item.transition == Transition::None) {
        entry.record.plan_untouched();
        return;
    }
    let constraints = entry
        .items
        .iter()
        .filter(|item| item.transition == Transition::Delete)
        .flat_map(|item| item.constraints.iter().copied())
        .collect::<Vec<_>>();
    for constraint in constraints {
        entry.record.retain(constraint);
    }
}

fn retain_values(
    instructions: &ProcessingInstructions,
    kind: EntityKind,
    existing: &Value,
    incoming: Value,
) -> Value {
    match instructions.for_kind(kind) {
        Some(rules) => rules.apply_value_retention(kind, existing, incoming),
        None => incoming,
    }
}

fn writes_document(record: &Record) -> bool {
    matches!(record.transition, Transition::Create | Transition::Update)
}

fn ensure_planned(record: &Record) -> Result<(), PlanError> {
    if record.transition == Transition::Unknown {
        return Err(PlanError::Internal(format!(
            "{} {} has no planned transition",
            record.kind, record.natural_key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::Outcome;
    use crate::relations::{RelationRole, StoredRelation};

    fn active() -> Vec<String> {
        DEFAULT_ACTIVE_ITEM_STATUSES.iter().map(ToString::to_string).collect()
    }

    fn stored_set() -> Result<RecordSet, PlanError> {
        RecordSet::from_stored(
            json!({"id": "i-1", "hrid": "1", "title": "Old"}),
            vec![
                (
                    json!({"id": "h-1", "hrid": "H1", "instanceId": "i-1"}),
                    vec![json!({"id": "t-1", "hrid": "IT1", "holdingsRecordId": "h-1", "status": {"name": "Available"}})],
                ),
                (
                    json!({"id": "h-2", "hrid": "H2", "instanceId": "i-1"}),
                    vec![json!({"id": "t-2", "hrid": "IT2", "holdingsRecordId": "h-2", "status": {"name": "Available"}})],
                ),
            ],
            Vec::new(),
        )
    }

    fn plan(request: &Value, instructions: ProcessingInstructions) -> Result<UpsertPlan, PlanError> {
        UpsertPlan::new(RecordSet::from_request(request)?, Some(stored_set()?), instructions, &active())
    }

    fn holdings<'a>(set: &'a RecordSet, key: &str) -> &'a Record {
        match set.holdings_by_key(key) {
            Some(entry) => &entry.record,
            None => panic!("holdings {key} should be in the set"),
        }
    }

    #[test]
    fn new_instance_without_children_is_created() -> Result<(), PlanError> {
        let incoming = RecordSet::from_request(&json!({"instance": {"hrid": "1", "id": "given"}}))?;
        let set = UpsertPlan::new(incoming, None, ProcessingInstructions::default(), &active())?.finalize()?;
        assert_eq!(set.instance.transition, Transition::Create);
        assert_eq!(set.instance.document["id"], "given");
        Ok(())
    }

    #[test]
    fn omitted_holdings_are_deleted_with_their_items() -> Result<(), PlanError> {
        let plan = plan(
            &json!({"instance": {"hrid": "1"}, "holdingsRecords": [
                {"hrid": "H2", "items": [{"hrid": "IT2"}]}
            ]}),
            ProcessingInstructions::default(),
        )?;
        assert!(plan.unresolved().is_empty());
        let set = plan.finalize()?;
        assert_eq!(set.instance.transition, Transition::Update);
        assert_eq!(holdings(&set, "H2").transition, Transition::Update);
        assert_eq!(holdings(&set, "H1").transition, Transition::Delete);
        assert_eq!(set.item_by_key("IT1").map(|item| item.transition), Some(Transition::Delete));
        assert_eq!(set.item_by_key("IT2").map(|item| item.transition), Some(Transition::Update));
        Ok(())
    }

    #[test]
    fn absent_holdings_property_touches_nothing() -> Result<(), PlanError> {
        let set = plan(&json!({"instance": {"hrid": "1"}}), ProcessingInstructions::default())?.finalize()?;
        assert!(set.holdings.is_empty());
        assert_eq!(set.instance.transition, Transition::Update);
        Ok(())
    }

    #[test]
    fn empty_holdings_array_deletes_everything() -> Result<(), PlanError> {
        let set = plan(&json!({"instance": {"hrid": "1"}, "holdingsRecords": []}), ProcessingInstructions::default())?
            .finalize()?;
        assert!(set.holdings.iter().all(|entry| entry.record.transition == Transition::Delete));
        assert_eq!(set.holdings.iter().map(|entry| entry.items.len()).sum::<usize>(), 2);
        Ok(())
    }

    #[test]
    fn moved_item_keeps_its_identity() -> Result<(), PlanError> {
        let set = plan(
            &json!({"instance": {"hrid": "1"}, "holdingsRecords": [
                {"hrid": "H1", "items": []},
                {"hrid": "H2", "items": [{"hrid": "IT1"}, {"hrid": "IT2"}]}
            ]}),
            ProcessingInstructions::default(),
        )?
        .finalize()?;
        let Some(moved) = set.item_by_key("IT1") else {
            panic!("moved item should be in the set");
        };
        assert_eq!(moved.transition, Transition::Update);
        assert_eq!(moved.id, Some(RecordId::from("t-1")));
        assert_eq!(moved.document["holdingsRecordId"], "h-2");
        assert_eq!(set.holdings.iter().flat_map(|entry| &entry.items).count(), 2);
        Ok(())
    }

    #[test]
    fn active_item_protects_its_holdings() -> Result<(), PlanError> {
        let stored = RecordSet::from_stored(
            json!({"id": "i-1", "hrid": "1"}),
            vec![(
                json!({"id": "h-1", "hrid": "H1", "instanceId": "i-1"}),
                vec![json!({"id": "t-1", "hrid": "IT1", "status": {"name": "Checked out"}})],
            )],
            Vec::new(),
        )?;
        let incoming = RecordSet::from_request(&json!({"instance": {"hrid": "1"}, "holdingsRecords": []}))?;
        let set = UpsertPlan::new(incoming, Some(stored), ProcessingInstructions::default(), &active())?.finalize()?;
        let record = holdings(&set, "H1");
        assert_eq!(record.outcome, Outcome::Skipped);
        assert!(record.constraints.contains(&ConstraintKind::ItemStatus));
        assert_eq!(set.item_by_key("IT1").map(|item| item.outcome), Some(Outcome::Skipped));
        Ok(())
    }

    #[test]
    fn retained_item_keeps_its_holdings() -> Result<(), PlanError> {
        let instructions: ProcessingInstructions = serde_json::from_value(json!({
            "item": {"retainOmittedRecord": {"ifField": "hrid", "matchesPattern": "^IT1$"}}
        }))
        .map_err(|err| PlanError::Validation(err.to_string()))?;
        let set = plan(&json!({"instance": {"hrid": "1"}, "holdingsRecords": []}), instructions)?.finalize()?;
        assert_eq!(holdings(&set, "H1").transition, Transition::None);
        assert_eq!(holdings(&set, "H2").transition, Transition::Delete);
        Ok(())
    }

    #[test]
    fn unmatched_children_wait_for_foreign_lookup() -> Result<(), PlanError> {
        let mut plan = plan(
            &json!({"instance": {"hrid": "1"}, "holdingsRecords": [
                {"hrid": "H9", "items": [{"hrid": "IT9"}, {"hrid": "IT8"}]}
            ]}),
            ProcessingInstructions::default(),
        )?;
        let lookups = plan.unresolved();
        assert_eq!(lookups.len(), 3);
        for lookup in lookups {
            let found = (lookup.natural_key == "IT9")
                .then(|| json!({"id": "t-9", "hrid": "IT9", "holdingsRecordId": "elsewhere", "barcode": "b"}));
            plan.resolve_foreign(lookup.path, found)?;
        }
        let set = plan.finalize()?;
        let Some(migrated) = set.item_by_key("IT9") else {
            panic!("migrated item should be in the set");
        };
        assert_eq!(migrated.transition, Transition::Update);
        assert_eq!(migrated.id, Some(RecordId::from("t-9")));
        assert_eq!(holdings(&set, "H9").transition, Transition::Create);
        assert_eq!(migrated.document["holdingsRecordId"], holdings(&set, "H9").document["id"]);
        assert!(migrated.document.get("barcode").is_none());
        Ok(())
    }

    #[test]
    fn finalize_rejects_unresolved_records() -> Result<(), PlanError> {
        let plan = plan(
            &json!({"instance": {"hrid": "1"}, "holdingsRecords": [{"hrid": "H9"}]}),
            ProcessingInstructions::default(),
        )?;
        assert!(matches!(plan.finalize(), Err(PlanError::Internal(_))));
        Ok(())
    }

    #[test]
    fn stored_relations_are_kept_when_request_has_none() -> Result<(), PlanError> {
        let stored = RecordSet::from_stored(
            json!({"id": "i-1", "hrid": "1"}),
            Vec::new(),
            vec![StoredRelation {
                kind: EntityKind::InstanceRelationship,
                document: json!({"id": "r-1", "superInstanceId": "i-0", "subInstanceId": "i-1"}),
            }],
        )?;
        let incoming = RecordSet::from_request(&json!({"instance": {"hrid": "1"}}))?;
        let set = UpsertPlan::new(incoming, Some(stored), ProcessingInstructions::default(), &active())?.finalize()?;
        assert_eq!(set.relations.len(), 1);
        assert_eq!(set.relations[0].role, RelationRole::ParentInstance);
        assert_eq!(set.relations[0].record.transition, Transition::None);
        Ok(())
    }
}
