use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::PlanError;

/// Field holding the human-readable natural key on instances, holdings and items.
pub const NATURAL_KEY_FIELD: &str = "hrid";
/// Field holding the server identity on every stored document.
pub const ID_FIELD: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Generate a fresh identity for a record about to be created.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Instance,
    HoldingsRecord,
    Item,
    InstanceRelationship,
    #[serde(rename = "INSTANCE_TITLE_SUCCESSION")]
    TitleSuccession,
}

impl EntityKind {
    pub const ALL: [Self; 5] = [
        Self::Instance,
        Self::HoldingsRecord,
        Self::Item,
        Self::InstanceRelationship,
        Self::TitleSuccession,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "INSTANCE",
            Self::HoldingsRecord => "HOLDINGS_RECORD",
            Self::Item => "ITEM",
            Self::InstanceRelationship => "INSTANCE_RELATIONSHIP",
            Self::TitleSuccession => "INSTANCE_TITLE_SUCCESSION",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSTANCE" => Some(Self::Instance),
            "HOLDINGS_RECORD" => Some(Self::HoldingsRecord),
            "ITEM" => Some(Self::Item),
            "INSTANCE_RELATIONSHIP" => Some(Self::InstanceRelationship),
            "INSTANCE_TITLE_SUCCESSION" => Some(Self::TitleSuccession),
            _ => None,
        }
    }

    /// Kinds that are always reported in metrics, even without activity.
    #[must_use]
    pub fn is_core(self) -> bool {
        matches!(self, Self::Instance | Self::HoldingsRecord | Self::Item)
    }

    /// Document field referencing the owning record, for dependent kinds.
    #[must_use]
    pub fn parent_field(self) -> Option<&'static str> {
        match self {
            Self::HoldingsRecord => Some("instanceId"),
            Self::Item => Some("holdingsRecordId"),
            Self::Instance | Self::InstanceRelationship | Self::TitleSuccession => None,
        }
    }

    #[must_use]
    pub fn is_relation(self) -> bool {
        matches!(self, Self::InstanceRelationship | Self::TitleSuccession)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    None,
    Create,
    Update,
    Delete,
    Unknown,
}

impl Transition {
    /// Transitions that carry a storage operation and appear in metrics.
    pub const COUNTED: [Self; 3] = [Self::Create, Self::Update, Self::Delete];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl Outcome {
    pub const ALL: [Self; 4] = [Self::Completed, Self::Failed, Self::Skipped, Self::Pending];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// Named reason forcing a record's deletion to be skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintKind {
    ItemStatus,
    ItemPatternMatch,
    HoldingsRecordPatternMatch,
    InstancePatternMatch,
    PoLineReference,
}

impl ConstraintKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ItemStatus => "ITEM_STATUS",
            Self::ItemPatternMatch => "ITEM_PATTERN_MATCH",
            Self::HoldingsRecordPatternMatch => "HOLDINGS_RECORD_PATTERN_MATCH",
            Self::InstancePatternMatch => "INSTANCE_PATTERN_MATCH",
            Self::PoLineReference => "PO_LINE_REFERENCE",
        }
    }

    /// The block-rule constraint raised by a matching `blockDeletion` pattern.
    #[must_use]
    pub fn pattern_match_for(kind: EntityKind) -> Option<Self> {
        match kind {
            EntityKind::Instance => Some(Self::InstancePatternMatch),
            EntityKind::HoldingsRecord => Some(Self::HoldingsRecordPatternMatch),
            EntityKind::Item => Some(Self::ItemPatternMatch),
            EntityKind::InstanceRelationship | EntityKind::TitleSuccession => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Storage,
    BatchStorage,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Storage => "STORAGE",
            Self::BatchStorage => "BATCH_STORAGE",
            Self::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub category: ErrorCategory,
    pub status_code: u16,
    pub short_message: String,
    pub message: String,
}

impl RecordError {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        status_code: u16,
        short_message: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            status_code,
            short_message: short_message.into(),
            message: message.into(),
        }
    }
}

/// One node of a record graph together with its planned lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: Option<RecordId>,
    pub natural_key: String,
    pub kind: EntityKind,
    pub transition: Transition,
    pub outcome: Outcome,
    pub error: Option<RecordError>,
    pub document: Value,
    pub constraints: BTreeSet<ConstraintKind>,
    /// A statistical code was attached while retaining this record and must be stored.
    pub tag_pending: bool,
}

impl Record {
    /// Build an unidentified record from an incoming document.
    #[must_use]
    pub fn incoming(kind: EntityKind, natural_key: impl Into<String>, document: Value) -> Self {
        Self {
            id: None,
            natural_key: natural_key.into(),
            kind,
            transition: Transition::Unknown,
            outcome: Outcome::Pending,
            error: None,
            document,
            constraints: BTreeSet::new(),
            tag_pending: false,
        }
    }

    /// Build an identified record from a stored document.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when the stored document has no `id`.
    pub fn existing(kind: EntityKind, document: Value) -> Result<Self, PlanError> {
        let id = text_field(&document, ID_FIELD).ok_or_else(|| {
            PlanError::Internal(format!("stored {kind} document has no {ID_FIELD}"))
        })?;
        let natural_key = text_field(&document, NATURAL_KEY_FIELD).unwrap_or_else(|| id.clone());
        Ok(Self {
            id: Some(RecordId(id)),
            natural_key,
            kind,
            transition: Transition::None,
            outcome: Outcome::Pending,
            error: None,
            document,
            constraints: BTreeSet::new(),
            tag_pending: false,
        })
    }

    pub fn plan_create(&mut self, id: RecordId) {
        self.id = Some(id);
        self.transition = Transition::Create;
    }

    pub fn plan_update(&mut self, id: RecordId) {
        self.id = Some(id);
        self.transition = Transition::Update;
    }

    pub fn plan_delete(&mut self) {
        self.transition = Transition::Delete;
    }

    /// Leave the record untouched; its outcome is settled immediately.
    pub fn plan_untouched(&mut self) {
        self.transition = Transition::None;
        self.outcome = Outcome::Skipped;
    }

    /// Retain the record because of a deletion constraint.
    pub fn retain(&mut self, constraint: ConstraintKind) {
        self.constraints.insert(constraint);
        self.outcome = Outcome::Skipped;
    }

    pub fn complete(&mut self) {
        self.outcome = Outcome::Completed;
        self.error = None;
    }

    pub fn fail(&mut self, error: RecordError) {
        self.outcome = Outcome::Failed;
        self.error = Some(error);
    }

    pub fn skip(&mut self) {
        self.outcome = Outcome::Skipped;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::Pending
    }

    /// Pending record scheduled for the given transition.
    #[must_use]
    pub fn awaits(&self, transition: Transition) -> bool {
        self.is_pending() && self.transition == transition
    }

    /// Whether the record is still present in storage once execution finishes.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        match self.transition {
            Transition::Delete => self.outcome != Outcome::Completed,
            Transition::Create => self.outcome == Outcome::Completed,
            Transition::None | Transition::Update | Transition::Unknown => true,
        }
    }

    /// Write the identity into the document.
    pub fn stamp_id(&mut self) {
        if let (Some(id), Some(object)) = (&self.id, self.document.as_object_mut()) {
            object.insert(ID_FIELD.to_string(), Value::String(id.0.clone()));
        }
    }

    /// Point the document at its owning record.
    pub fn stamp_parent(&mut self, parent: &RecordId) {
        let Some(field) = self.kind.parent_field() else {
            return;
        };
        if let Some(object) = self.document.as_object_mut() {
            object.insert(field.to_string(), Value::String(parent.0.clone()));
        }
    }

    /// Identity of the owning record as currently written in the document.
    #[must_use]
    pub fn parent_id(&self) -> Option<RecordId> {
        self.kind.parent_field().and_then(|field| text_field(&self.document, field)).map(RecordId)
    }

    /// The document annotated with its reconciliation state.
    #[must_use]
    pub fn annotated_document(&self) -> Value {
        let mut document = self.document.clone();
        if let Some(object) = document.as_object_mut() {
            let mut annotation = serde_json::Map::new();
            annotation.insert("entity".to_string(), Value::from(self.kind.as_str()));
            annotation.insert("transition".to_string(), Value::from(self.transition.as_str()));
            annotation.insert("outcome".to_string(), Value::from(self.outcome.as_str()));
            if !self.constraints.is_empty() {
                annotation.insert(
                    "constraints".to_string(),
                    Value::from(
                        self.constraints.iter().map(|kind| kind.as_str()).collect::<Vec<_>>(),
                    ),
                );
            }
            if let Some(error) = &self.error {
                annotation.insert(
                    "error".to_string(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
            object.insert("reconciliation".to_string(), Value::Object(annotation));
        }
        document
    }
}

/// Read a scalar field as text. Dotted paths descend into nested objects.
#[must_use]
pub fn text_field(document: &Value, path: &str) -> Option<String> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
