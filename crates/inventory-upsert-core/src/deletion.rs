//! Deletion planning with bottom-up constraint propagation.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::identity::{identifiers, strip_identifier, LocalIdentifier};
use crate::instructions::ProcessingInstructions;
use crate::model::{text_field, ConstraintKind, EntityKind, Outcome, Record, Transition};
use crate::record_set::RecordSet;

pub const STATISTICAL_CODES_FIELD: &str = "statisticalCodeIds";

/// What the deletion planner needs to know beyond the stored record set.
#[derive(Debug, Clone, Copy)]
pub struct DeletionContext<'a> {
    pub instructions: &'a ProcessingInstructions,
    pub active_statuses: &'a [String],
    /// Purchase order lines that reference the instance.
    pub order_line_count: usize,
}

impl DeletionContext<'_> {
    fn is_active(&self, item: &Record) -> bool {
        text_field(&item.document, "status.name").is_some_and(|status| {
            self.active_statuses.iter().any(|active| active.eq_ignore_ascii_case(&status))
        })
    }

    fn blocks(&self, record: &Record) -> bool {
        self.instructions
            .for_kind(record.kind)
            .is_some_and(|rules| rules.block_deletion(&record.document))
    }
}

/// Plan deletion of a whole stored record set.
#[must_use]
pub fn plan_deletion(mut set: RecordSet, context: &DeletionContext<'_>) -> RecordSet {
    let instance_constraints = plan_children_deletion(&mut set, context);

    set.instance.plan_delete();
    for constraint in instance_constraints {
        set.instance.retain(constraint);
    }
    if context.blocks(&set.instance) {
        set.instance.retain(ConstraintKind::InstancePatternMatch);
    }
    if context.order_line_count > 0 {
        set.instance.retain(ConstraintKind::PoLineReference);
    }

    for relation in &mut set.relations {
        relation.record.plan_delete();
    }

    apply_statistical_coding(&mut set, context.instructions);
    set
}

/// Plan removal of one institution's share of a shared instance.
///
/// `set` holds only the institution's own holdings. The instance is deleted
/// when nothing else keeps it alive, and updated with the identifier stripped
/// otherwise.
#[must_use]
pub fn plan_shared_deletion(
    mut set: RecordSet,
    local: &LocalIdentifier,
    foreign_holdings_remain: bool,
    context: &DeletionContext<'_>,
) -> RecordSet {
    let mut instance_constraints = plan_children_deletion(&mut set, context);
    strip_identifier(&mut set.instance.document, local);

    if context.blocks(&set.instance) {
        instance_constraints.insert(ConstraintKind::InstancePatternMatch);
    }
    if context.order_line_count > 0 {
        instance_constraints.insert(ConstraintKind::PoLineReference);
    }

    let still_shared = foreign_holdings_remain || !identifiers(&set.instance.document).is_empty();
    match set.instance.id.clone() {
        Some(id) if still_shared || !instance_constraints.is_empty() => {
            set.instance.plan_update(id);
            set.instance.stamp_id();
            set.instance.constraints.extend(instance_constraints);
            for relation in &mut set.relations {
                relation.record.plan_untouched();
            }
        }
        _ => {
            set.instance.plan_delete();
            for relation in &mut set.relations {
                relation.record.plan_delete();
            }
        }
    }

    apply_statistical_coding(&mut set, context.instructions);
    set
}

/// Mark holdings and items for deletion and return the constraints that must
/// be registered on the instance.
fn plan_children_deletion(set: &mut RecordSet, context: &DeletionContext<'_>) -> BTreeSet<ConstraintKind> {
    let mut instance_constraints = BTreeSet::new();
    for entry in &mut set.holdings {
        entry.record.plan_delete();
        for item in &mut entry.items {
            item.plan_delete();
            if context.is_active(item) {
                item.retain(ConstraintKind::ItemStatus);
            }
            if context.blocks(item) {
                item.retain(ConstraintKind::ItemPatternMatch);
            }
            for constraint in item.constraints.clone() {
                entry.record.retain(constraint);
            }
        }
        if context.blocks(&entry.record) {
            entry.record.retain(ConstraintKind::HoldingsRecordPatternMatch);
        }
        instance_constraints.extend(entry.record.constraints.iter().copied());
    }
    instance_constraints
}

/// Attach configured statistical codes to records kept because of a constraint.
///
/// Records that receive a new code are flagged for a storage update.
pub fn apply_statistical_coding(set: &mut RecordSet, instructions: &ProcessingInstructions) {
    for path in set.paths() {
        let Some(record) = set.record_mut(path) else {
            continue;
        };
        if record.kind.is_relation() || record.constraints.is_empty() || record.id.is_none() {
            continue;
        }
        let skipped_delete = record.transition == Transition::Delete && record.outcome == Outcome::Skipped;
        let constrained_update = record.transition == Transition::Update && record.kind == EntityKind::Instance;
        if !skipped_delete && !constrained_update {
            continue;
        }
        let Some(rules) = instructions.for_kind(record.kind) else {
            continue;
        };
        let codes = record
            .constraints
            .iter()
            .filter_map(|constraint| rules.statistical_code(*constraint))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        for code in codes {
            if add_statistical_code(&mut record.document, &code) && skipped_delete {
                record.tag_pending = true;
            }
        }
    }
}

fn add_statistical_code(document: &mut Value, code: &str) -> bool {
    let Some(object) = document.as_object_mut() else {
        return false;
    };
    let codes = object.entry(STATISTICAL_CODES_FIELD).or_insert_with(|| Value::Array(Vec::new()));
    let Some(list) = codes.as_array_mut() else {
        return false;
    };
    if list.iter().any(|existing| existing.as_str() == Some(code)) {
        return false;
    }
    list.push(Value::String(code.to_string()));
    true
}
