//! Instance-to-instance relationships: parent/child links and title successions.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::model::{
    text_field, EntityKind, ErrorCategory, Record, RecordError, RecordId, Transition,
    NATURAL_KEY_FIELD,
};
use crate::PlanError;

pub const RELATIONS_FIELD: &str = "instanceRelations";
const PROVISIONAL_REQUIRED_FIELDS: [&str; 2] = ["title", "instanceTypeId"];

/// Which side of a relationship the planned instance is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RelationRole {
    ParentInstance,
    ChildInstance,
    SucceedingTitle,
    PrecedingTitle,
}

impl RelationRole {
    pub const ALL: [Self; 4] =
        [Self::ParentInstance, Self::ChildInstance, Self::SucceedingTitle, Self::PrecedingTitle];

    /// Request field listing relations of this role.
    #[must_use]
    pub fn list_field(self) -> &'static str {
        match self {
            Self::ParentInstance => "parentInstances",
            Self::ChildInstance => "childInstances",
            Self::SucceedingTitle => "succeedingTitles",
            Self::PrecedingTitle => "precedingTitles",
        }
    }

    #[must_use]
    pub fn kind(self) -> EntityKind {
        match self {
            Self::ParentInstance | Self::ChildInstance => EntityKind::InstanceRelationship,
            Self::SucceedingTitle | Self::PrecedingTitle => EntityKind::TitleSuccession,
        }
    }

    /// Document linking `this` instance to `target` in this role.
    #[must_use]
    pub fn link_document(self, this: &RecordId, target: &RecordId, type_id: Option<&str>) -> Value {
        match self {
            Self::ParentInstance => json!({
                "superInstanceId": target.as_str(),
                "subInstanceId": this.as_str(),
                "instanceRelationshipTypeId": type_id,
            }),
            Self::ChildInstance => json!({
                "superInstanceId": this.as_str(),
                "subInstanceId": target.as_str(),
                "instanceRelationshipTypeId": type_id,
            }),
            Self::SucceedingTitle => json!({
                "precedingInstanceId": this.as_str(),
                "succeedingInstanceId": target.as_str(),
            }),
            Self::PrecedingTitle => json!({
                "precedingInstanceId": target.as_str(),
                "succeedingInstanceId": this.as_str(),
            }),
        }
    }
}

impl Display for RelationRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.list_field())
    }
}

/// How a request names the instance at the other end of a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceIdentifier {
    Hrid(String),
    Uuid(String),
}

impl InstanceIdentifier {
    fn parse(entry: &Value) -> Result<Self, PlanError> {
        let identifier = entry.get("instanceIdentifier").ok_or_else(|| {
            PlanError::Validation("relation entry MUST carry instanceIdentifier".to_string())
        })?;
        if let Some(hrid) = text_field(identifier, NATURAL_KEY_FIELD).filter(|v| !v.trim().is_empty()) {
            return Ok(Self::Hrid(hrid));
        }
        if let Some(uuid) = text_field(identifier, "uuid").filter(|v| !v.trim().is_empty()) {
            return Ok(Self::Uuid(uuid));
        }
        Err(PlanError::Validation(
            "instanceIdentifier MUST carry a non-empty hrid or uuid".to_string(),
        ))
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Hrid(value) | Self::Uuid(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationRequest {
    pub role: RelationRole,
    pub target: InstanceIdentifier,
    pub relationship_type_id: Option<String>,
    pub provisional_instance: Option<Value>,
}

/// Relation lists of one incoming request. A role is present only when its list
/// appeared in the request, possibly empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationRequests {
    lists: BTreeMap<RelationRole, Vec<RelationRequest>>,
}

impl RelationRequests {
    /// Parse the `instanceRelations` element of a request.
    ///
    /// # Errors
    /// Returns [`PlanError::Validation`] when a list or entry is malformed.
    pub fn parse(request: &Value) -> Result<Self, PlanError> {
        let mut lists = BTreeMap::new();
        let Some(relations) = request.get(RELATIONS_FIELD) else {
            return Ok(Self { lists });
        };
        if relations.is_null() {
            return Ok(Self { lists });
        }
        let Some(relations) = relations.as_object() else {
            return Err(PlanError::Validation(format!("{RELATIONS_FIELD} MUST be an object")));
        };
        for role in RelationRole::ALL {
            let Some(list) = relations.get(role.list_field()) else {
                continue;
            };
            let Some(entries) = list.as_array() else {
                return Err(PlanError::Validation(format!("{role} MUST be an array")));
            };
            let mut requests = Vec::with_capacity(entries.len());
            for entry in entries {
                requests.push(RelationRequest {
                    role,
                    target: InstanceIdentifier::parse(entry)?,
                    relationship_type_id: text_field(entry, "instanceRelationshipTypeId"),
                    provisional_instance: entry
                        .get("provisionalInstance")
                        .filter(|value| value.is_object())
                        .cloned(),
                });
            }
            lists.insert(role, requests);
        }
        Ok(Self { lists })
    }

    #[must_use]
    pub fn is_present(&self, role: RelationRole) -> bool {
        self.lists.contains_key(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelationRequest> {
        self.lists.values().flatten()
    }

    /// Every distinct target the request names.
    #[must_use]
    pub fn targets(&self) -> Vec<InstanceIdentifier> {
        let mut targets = self.iter().map(|request| request.target.clone()).collect::<Vec<_>>();
        targets.sort();
        targets.dedup();
        targets
    }
}

/// A stored relationship document as returned by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRelation {
    pub kind: EntityKind,
    pub document: Value,
}

/// A relationship record plus the role it plays for the planned instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRecord {
    pub role: RelationRole,
    pub target_id: Option<RecordId>,
    pub relationship_type_id: Option<String>,
    pub record: Record,
    /// Placeholder target instance created ahead of the relation.
    pub provisional: Option<Record>,
}

impl RelationRecord {
    /// Interpret a stored relation from the point of view of `instance_id`.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when the document does not reference the instance.
    pub fn from_stored(instance_id: &RecordId, stored: StoredRelation) -> Result<Self, PlanError> {
        let this = instance_id.as_str();
        let field = |name: &str| text_field(&stored.document, name);
        let (role, target) = match stored.kind {
            EntityKind::InstanceRelationship => {
                if field("subInstanceId").as_deref() == Some(this) {
                    (RelationRole::ParentInstance, field("superInstanceId"))
                } else if field("superInstanceId").as_deref() == Some(this) {
                    (RelationRole::ChildInstance, field("subInstanceId"))
                } else {
                    return Err(unrelated(instance_id, &stored));
                }
            }
            EntityKind::TitleSuccession => {
                if field("succeedingInstanceId").as_deref() == Some(this) {
                    (RelationRole::PrecedingTitle, field("precedingInstanceId"))
                } else if field("precedingInstanceId").as_deref() == Some(this) {
                    (RelationRole::SucceedingTitle, field("succeedingInstanceId"))
                } else {
                    return Err(unrelated(instance_id, &stored));
                }
            }
            EntityKind::Instance | EntityKind::HoldingsRecord | EntityKind::Item => {
                return Err(PlanError::Internal(format!(
                    "{} is not a relationship kind",
                    stored.kind
                )));
            }
        };
        let relationship_type_id = field("instanceRelationshipTypeId");
        let mut record = Record::existing(stored.kind, stored.document)?;
        record.natural_key =
            format!("{role}:{}", target.as_deref().unwrap_or("(unlinked)"));
        Ok(Self {
            role,
            target_id: target.map(RecordId),
            relationship_type_id,
            record,
            provisional: None,
        })
    }

    fn same_link(&self, role: RelationRole, target: &RecordId) -> bool {
        self.role == role && self.target_id.as_ref() == Some(target)
    }
}

fn unrelated(instance_id: &RecordId, stored: &StoredRelation) -> PlanError {
    PlanError::Internal(format!(
        "{} {} does not reference instance {instance_id}",
        stored.kind,
        text_field(&stored.document, "id").unwrap_or_default()
    ))
}

/// Diff the requested relations of one instance against the stored ones.
///
/// `resolved` maps every requested target to the identity of an existing
/// instance; targets missing from it do not exist yet. Stored relations that
/// stay in place, including every relation of a role absent from the request,
/// come back untouched.
#[must_use]
pub fn plan_relations(
    instance_id: &RecordId,
    requests: &RelationRequests,
    existing: Vec<RelationRecord>,
    resolved: &HashMap<InstanceIdentifier, RecordId>,
) -> Vec<RelationRecord> {
    let mut planned = Vec::new();
    let mut kept = vec![false; existing.len()];

    for request in requests.iter() {
        let kind = request.role.kind();
        let natural_key = format!("{}:{}", request.role, request.target.key());
        let Some(target_id) = resolved.get(&request.target) else {
            planned.push(provisional_relation(instance_id, request, natural_key));
            continue;
        };

        let matching = existing
            .iter()
            .position(|relation| relation.same_link(request.role, target_id));
        if let Some(index) = matching {
            let type_changed = kind == EntityKind::InstanceRelationship
                && existing[index].relationship_type_id != request.relationship_type_id;
            if !type_changed {
                kept[index] = true;
                continue;
            }
        }

        let document = request.role.link_document(
            instance_id,
            target_id,
            request.relationship_type_id.as_deref(),
        );
        let mut record = Record::incoming(kind, natural_key, document);
        record.plan_create(RecordId::generate());
        record.stamp_id();
        planned.push(RelationRecord {
            role: request.role,
            target_id: Some(target_id.clone()),
            relationship_type_id: request.relationship_type_id.clone(),
            record,
            provisional: None,
        });
    }

    for (mut relation, kept) in existing.into_iter().zip(kept) {
        if kept || !requests.is_present(relation.role) {
            relation.record.plan_untouched();
        } else {
            relation.record.plan_delete();
        }
        planned.push(relation);
    }

    planned
}

fn provisional_relation(
    instance_id: &RecordId,
    request: &RelationRequest,
    natural_key: String,
) -> RelationRecord {
    let kind = request.role.kind();
    let Some(payload) = request.provisional_instance.as_ref().and_then(Value::as_object) else {
        let mut record = Record::incoming(kind, natural_key, Value::Object(Map::new()));
        record.transition = Transition::Create;
        record.fail(RecordError::new(
            ErrorCategory::Validation,
            422,
            "Provisional instance required",
            format!(
                "target instance {} does not exist and no provisionalInstance was supplied",
                request.target.key()
            ),
        ));
        return RelationRecord {
            role: request.role,
            target_id: None,
            relationship_type_id: request.relationship_type_id.clone(),
            record,
            provisional: None,
        };
    };

    let payload_value = Value::Object(payload.clone());
    let missing = PROVISIONAL_REQUIRED_FIELDS
        .iter()
        .filter(|field| text_field(&payload_value, field).map_or(true, |v| v.trim().is_empty()))
        .copied()
        .collect::<Vec<_>>();

    let mut document = payload.clone();
    let provisional_id = match &request.target {
        InstanceIdentifier::Hrid(hrid) => {
            document.insert(NATURAL_KEY_FIELD.to_string(), Value::String(hrid.clone()));
            RecordId::generate()
        }
        InstanceIdentifier::Uuid(uuid) => RecordId(uuid.clone()),
    };
    let mut provisional = Record::incoming(EntityKind::Instance, request.target.key(), Value::Object(document));
    provisional.plan_create(provisional_id.clone());
    provisional.stamp_id();

    let link = request.role.link_document(
        instance_id,
        &provisional_id,
        request.relationship_type_id.as_deref(),
    );
    let mut record = Record::incoming(kind, natural_key, link);
    record.plan_create(RecordId::generate());
    record.stamp_id();

    if !missing.is_empty() {
        let message = format!(
            "provisional instance for {} is missing required fields: {}",
            request.target.key(),
            missing.join(", ")
        );
        let error = RecordError::new(ErrorCategory::Validation, 422, "Incomplete provisional instance", message);
        provisional.fail(error.clone());
        record.fail(error);
    }

    RelationRecord {
        role: request.role,
        target_id: Some(provisional_id),
        relationship_type_id: request.relationship_type_id.clone(),
        record,
        provisional: Some(provisional),
    }
}
