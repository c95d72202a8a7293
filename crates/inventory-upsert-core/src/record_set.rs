use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::model::{text_field, EntityKind, Outcome, Record, NATURAL_KEY_FIELD};
use crate::relations::{RelationRecord, RelationRequests, RelationRole, StoredRelation, RELATIONS_FIELD};
use crate::PlanError;

pub const INSTANCE_FIELD: &str = "instance";
pub const HOLDINGS_FIELD: &str = "holdingsRecords";
pub const ITEMS_FIELD: &str = "items";

/// A holdings record and the items it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingsEntry {
    pub record: Record,
    pub items: Vec<Record>,
    /// The `items` property appeared on the incoming document.
    pub items_present: bool,
}

/// Address of one record inside a [`RecordSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordPath {
    Instance,
    Holdings(usize),
    Item(usize, usize),
    Relation(usize),
    Provisional(usize),
}

/// One instance with its holdings, items and relations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    pub instance: Record,
    pub holdings: Vec<HoldingsEntry>,
    /// The `holdingsRecords` property appeared on the incoming document.
    pub holdings_present: bool,
    pub relation_requests: RelationRequests,
    pub relations: Vec<RelationRecord>,
    /// The inbound document this set was built from, kept for error reports.
    pub request: Value,
    holdings_index: HashMap<String, usize>,
    item_index: HashMap<String, (usize, usize)>,
}

impl RecordSet {
    /// Build an incoming record set from an upsert request document.
    ///
    /// # Errors
    /// Returns [`PlanError::Validation`] when the instance is missing, a record
    /// lacks its natural key, or a natural key repeats within the set.
    pub fn from_request(request: &Value) -> Result<Self, PlanError> {
        let instance_document = request
            .get(INSTANCE_FIELD)
            .filter(|value| value.is_object())
            .cloned()
            .ok_or_else(|| PlanError::Validation("request MUST contain an instance object".to_string()))?;
        let instance = incoming_record(EntityKind::Instance, instance_document)?;

        let (holdings, holdings_present) = match request.get(HOLDINGS_FIELD) {
            None | Some(Value::Null) => (Vec::new(), false),
            Some(Value::Array(entries)) => (
                entries.iter().map(parse_holdings_entry).collect::<Result<Vec<_>, _>>()?,
                true,
            ),
            Some(_) => {
                return Err(PlanError::Validation(format!("{HOLDINGS_FIELD} MUST be an array")));
            }
        };

        let mut set = Self {
            instance,
            holdings,
            holdings_present,
            relation_requests: RelationRequests::parse(request)?,
            relations: Vec::new(),
            request: request.clone(),
            holdings_index: HashMap::new(),
            item_index: HashMap::new(),
        };
        set.reindex()?;
        Ok(set)
    }

    /// Build the existing record set from stored documents.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when a stored document lacks its identity
    /// or a relation does not reference the instance.
    pub fn from_stored(
        instance: Value,
        holdings: Vec<(Value, Vec<Value>)>,
        relations: Vec<StoredRelation>,
    ) -> Result<Self, PlanError> {
        let instance = Record::existing(EntityKind::Instance, instance)?;
        let Some(instance_id) = instance.id.clone() else {
            return Err(PlanError::Internal("stored instance has no identity".to_string()));
        };
        let holdings = holdings
            .into_iter()
            .map(|(holdings, items)| {
                Ok(HoldingsEntry {
                    record: Record::existing(EntityKind::HoldingsRecord, holdings)?,
                    items: items
                        .into_iter()
                        .map(|item| Record::existing(EntityKind::Item, item))
                        .collect::<Result<Vec<_>, PlanError>>()?,
                    items_present: true,
                })
            })
            .collect::<Result<Vec<_>, PlanError>>()?;
        let relations = relations
            .into_iter()
            .map(|stored| RelationRecord::from_stored(&instance_id, stored))
            .collect::<Result<Vec<_>, _>>()?;

        let mut set = Self {
            instance,
            holdings,
            holdings_present: true,
            relation_requests: RelationRequests::default(),
            relations,
            request: Value::Null,
            holdings_index: HashMap::new(),
            item_index: HashMap::new(),
        };
        set.reindex()?;
        Ok(set)
    }

    /// Rebuild the natural-key indices after holdings or items were added.
    ///
    /// # Errors
    /// Returns [`PlanError::Validation`] when a natural key repeats.
    pub fn reindex(&mut self) -> Result<(), PlanError> {
        self.holdings_index.clear();
        self.item_index.clear();
        for (holdings_pos, entry) in self.holdings.iter().enumerate() {
            if self.holdings_index.insert(entry.record.natural_key.clone(), holdings_pos).is_some() {
                return Err(PlanError::Validation(format!(
                    "holdings record hrid {} occurs more than once",
                    entry.record.natural_key
                )));
            }
            for (item_pos, item) in entry.items.iter().enumerate() {
                if self.item_index.insert(item.natural_key.clone(), (holdings_pos, item_pos)).is_some() {
                    return Err(PlanError::Validation(format!(
                        "item hrid {} occurs more than once",
                        item.natural_key
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn holdings_position(&self, natural_key: &str) -> Option<usize> {
        self.holdings_index.get(natural_key).copied()
    }

    #[must_use]
    pub fn item_position(&self, natural_key: &str) -> Option<(usize, usize)> {
        self.item_index.get(natural_key).copied()
    }

    #[must_use]
    pub fn holdings_by_key(&self, natural_key: &str) -> Option<&HoldingsEntry> {
        self.holdings_position(natural_key).and_then(|pos| self.holdings.get(pos))
    }

    #[must_use]
    pub fn item_by_key(&self, natural_key: &str) -> Option<&Record> {
        self.item_position(natural_key)
            .and_then(|(holdings_pos, item_pos)| self.holdings.get(holdings_pos)?.items.get(item_pos))
    }

    #[must_use]
    pub fn record(&self, path: RecordPath) -> Option<&Record> {
        match path {
            RecordPath::Instance => Some(&self.instance),
            RecordPath::Holdings(pos) => self.holdings.get(pos).map(|entry| &entry.record),
            RecordPath::Item(holdings_pos, item_pos) => {
                self.holdings.get(holdings_pos)?.items.get(item_pos)
            }
            RecordPath::Relation(pos) => self.relations.get(pos).map(|relation| &relation.record),
            RecordPath::Provisional(pos) => self.relations.get(pos)?.provisional.as_ref(),
        }
    }

    pub fn record_mut(&mut self, path: RecordPath) -> Option<&mut Record> {
        match path {
            RecordPath::Instance => Some(&mut self.instance),
            RecordPath::Holdings(pos) => self.holdings.get_mut(pos).map(|entry| &mut entry.record),
            RecordPath::Item(holdings_pos, item_pos) => {
                self.holdings.get_mut(holdings_pos)?.items.get_mut(item_pos)
            }
            RecordPath::Relation(pos) => {
                self.relations.get_mut(pos).map(|relation| &mut relation.record)
            }
            RecordPath::Provisional(pos) => self.relations.get_mut(pos)?.provisional.as_mut(),
        }
    }

    /// Paths of every record in the set, parents before children.
    #[must_use]
    pub fn paths(&self) -> Vec<RecordPath> {
        let mut paths = vec![RecordPath::Instance];
        for (holdings_pos, entry) in self.holdings.iter().enumerate() {
            paths.push(RecordPath::Holdings(holdings_pos));
            paths.extend((0..entry.items.len()).map(|item_pos| RecordPath::Item(holdings_pos, item_pos)));
        }
        for (pos, relation) in self.relations.iter().enumerate() {
            if relation.provisional.is_some() {
                paths.push(RecordPath::Provisional(pos));
            }
            paths.push(RecordPath::Relation(pos));
        }
        paths
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        std::iter::once(&self.instance)
            .chain(self.holdings.iter().flat_map(|entry| std::iter::once(&entry.record).chain(entry.items.iter())))
            .chain(self.relations.iter().map(|relation| &relation.record))
    }

    pub fn provisional_records(&self) -> impl Iterator<Item = &Record> {
        self.relations.iter().filter_map(|relation| relation.provisional.as_ref())
    }

    /// Skip every pending record below the instance.
    pub fn mark_children_skipped(&mut self) {
        for entry in &mut self.holdings {
            skip_if_pending(&mut entry.record);
            entry.items.iter_mut().for_each(skip_if_pending);
        }
        for relation in &mut self.relations {
            skip_if_pending(&mut relation.record);
            if let Some(provisional) = relation.provisional.as_mut() {
                skip_if_pending(provisional);
            }
        }
    }

    /// Natural keys of every holdings record and item in the set.
    #[must_use]
    pub fn natural_keys(&self) -> (HashSet<&str>, HashSet<&str>) {
        let holdings = self.holdings.iter().map(|entry| entry.record.natural_key.as_str()).collect();
        let items = self
            .holdings
            .iter()
            .flat_map(|entry| entry.items.iter().map(|item| item.natural_key.as_str()))
            .collect();
        (holdings, items)
    }

    /// Serialize the set as persisted, each record annotated with its outcome.
    #[must_use]
    pub fn to_result_document(&self) -> Value {
        let mut result = Map::new();
        result.insert(INSTANCE_FIELD.to_string(), self.instance.annotated_document());

        let holdings = self
            .holdings
            .iter()
            .filter(|entry| entry.record.is_persisted())
            .map(|entry| {
                let mut document = entry.record.annotated_document();
                let items = entry
                    .items
                    .iter()
                    .filter(|item| item.is_persisted())
                    .map(Record::annotated_document)
                    .collect::<Vec<_>>();
                if let Some(object) = document.as_object_mut() {
                    object.insert(ITEMS_FIELD.to_string(), Value::Array(items));
                }
                document
            })
            .collect::<Vec<_>>();
        result.insert(HOLDINGS_FIELD.to_string(), Value::Array(holdings));

        let mut relations = Map::new();
        for role in RelationRole::ALL {
            let entries = self
                .relations
                .iter()
                .filter(|relation| relation.role == role && relation.record.is_persisted())
                .map(|relation| {
                    let mut document = relation.record.annotated_document();
                    if let (Some(object), Some(provisional)) =
                        (document.as_object_mut(), relation.provisional.as_ref())
                    {
                        object.insert("provisionalInstance".to_string(), provisional.annotated_document());
                    }
                    document
                })
                .collect::<Vec<_>>();
            if !entries.is_empty() {
                relations.insert(role.list_field().to_string(), Value::Array(entries));
            }
        }
        if !relations.is_empty() {
            result.insert(RELATIONS_FIELD.to_string(), Value::Object(relations));
        }

        Value::Object(result)
    }

    /// Whether any record ended up failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.records().chain(self.provisional_records()).any(|record| record.outcome == Outcome::Failed)
    }
}

fn skip_if_pending(record: &mut Record) {
    if record.is_pending() {
        record.skip();
    }
}

fn incoming_record(kind: EntityKind, document: Value) -> Result<Record, PlanError> {
    let natural_key = text_field(&document, NATURAL_KEY_FIELD)
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| PlanError::Validation(format!("{kind} MUST carry a non-empty {NATURAL_KEY_FIELD}")))?;
    Ok(Record::incoming(kind, natural_key, document))
}

fn parse_holdings_entry(value: &Value) -> Result<HoldingsEntry, PlanError> {
    let Some(object) = value.as_object() else {
        return Err(PlanError::Validation(format!("{HOLDINGS_FIELD} entries MUST be objects")));
    };
    let mut document = object.clone();
    let items_value = document.remove(ITEMS_FIELD);
    let (items, items_present) = match items_value {
        None | Some(Value::Null) => (Vec::new(), false),
        Some(Value::Array(items)) => (
            items
                .into_iter()
                .map(|item| {
                    if item.is_object() {
                        incoming_record(EntityKind::Item, item)
                    } else {
                        Err(PlanError::Validation(format!("{ITEMS_FIELD} entries MUST be objects")))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?,
            true,
        ),
        Some(_) => return Err(PlanError::Validation(format!("{ITEMS_FIELD} MUST be an array"))),
    };
    Ok(HoldingsEntry {
        record: incoming_record(EntityKind::HoldingsRecord, Value::Object(document))?,
        items,
        items_present,
    })
}
