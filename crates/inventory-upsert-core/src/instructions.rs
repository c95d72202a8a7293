//! Per-entity processing instructions supplied with a request (or by settings).
//!
//! One value covers every entity kind; callers ask for the slice that applies
//! to a kind with [`ProcessingInstructions::for_kind`].

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{text_field, ConstraintKind, EntityKind, ID_FIELD, NATURAL_KEY_FIELD};
use crate::PlanError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingInstructions {
    #[serde(default)]
    pub instance: EntityInstructions,
    #[serde(default)]
    pub holdings_record: EntityInstructions,
    #[serde(default)]
    pub item: EntityInstructions,
}

impl ProcessingInstructions {
    /// Read the optional `processing` element of a request document.
    ///
    /// # Errors
    /// Returns [`PlanError::Validation`] when the element is malformed or carries
    /// a pattern that does not compile.
    pub fn from_request(request: &Value) -> Result<Option<Self>, PlanError> {
        match request.get("processing") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| PlanError::Validation(format!("invalid processing instructions: {err}"))),
        }
    }

    /// Instructions for one kind. Relations carry none.
    #[must_use]
    pub fn for_kind(&self, kind: EntityKind) -> Option<&EntityInstructions> {
        match kind {
            EntityKind::Instance => Some(&self.instance),
            EntityKind::HoldingsRecord => Some(&self.holdings_record),
            EntityKind::Item => Some(&self.item),
            EntityKind::InstanceRelationship | EntityKind::TitleSuccession => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInstructions {
    #[serde(default)]
    pub retain_existing_values: RetainExistingValues,
    pub retain_omitted_record: Option<FieldPattern>,
    pub block_deletion: Option<FieldPattern>,
    pub status: Option<StatusPolicy>,
    #[serde(default)]
    pub statistical_coding: Vec<StatisticalCoding>,
}

impl EntityInstructions {
    #[must_use]
    pub fn retain_omitted_properties(&self) -> bool {
        self.retain_existing_values.for_omitted_properties
    }

    #[must_use]
    pub fn retain_field(&self, name: &str) -> bool {
        self.retain_existing_values.for_these_properties.iter().any(|property| property == name)
    }

    #[must_use]
    pub fn block_deletion(&self, document: &Value) -> bool {
        self.block_deletion.as_ref().is_some_and(|rule| rule.matches(document))
    }

    #[must_use]
    pub fn retain_omitted_record(&self, document: &Value) -> bool {
        self.retain_omitted_record.as_ref().is_some_and(|rule| rule.matches(document))
    }

    /// Statistical code to set on a record whose deletion was skipped because of `constraint`.
    #[must_use]
    pub fn statistical_code(&self, constraint: ConstraintKind) -> Option<&str> {
        self.statistical_coding
            .iter()
            .find(|coding| {
                coding.condition == CodingCondition::DeleteSkipped && coding.because_of == constraint
            })
            .map(|coding| coding.set_code.as_str())
    }

    /// Merge an incoming document over the stored one, keeping the values the
    /// instructions say to retain.
    #[must_use]
    pub fn apply_value_retention(&self, kind: EntityKind, existing: &Value, incoming: Value) -> Value {
        let (Some(stored), Value::Object(mut merged)) = (existing.as_object(), incoming) else {
            return existing.clone();
        };

        if self.retain_omitted_properties() {
            for (name, value) in stored {
                if !merged.contains_key(name) {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }

        for name in &self.retain_existing_values.for_these_properties {
            if name == ID_FIELD || name == NATURAL_KEY_FIELD {
                continue;
            }
            if let Some(value) = stored.get(name) {
                merged.insert(name.clone(), value.clone());
            }
        }

        if kind == EntityKind::Item {
            self.resolve_item_status(stored, &mut merged);
        }

        Value::Object(merged)
    }

    fn resolve_item_status(&self, stored: &Map<String, Value>, merged: &mut Map<String, Value>) {
        let (Some(policy), Some(existing_status)) = (self.status.as_ref(), stored.get("status")) else {
            return;
        };
        let existing_name = text_field(existing_status, "name").unwrap_or_default();
        if !policy.overwrites(&existing_name) {
            merged.insert("status".to_string(), existing_status.clone());
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetainExistingValues {
    #[serde(default)]
    pub for_omitted_properties: bool,
    #[serde(default)]
    pub for_these_properties: Vec<String>,
}

/// A regular expression applied to the text of one document field.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawFieldPattern")]
pub struct FieldPattern {
    field: String,
    pattern: Regex,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFieldPattern {
    if_field: String,
    matches_pattern: String,
}

impl TryFrom<RawFieldPattern> for FieldPattern {
    type Error = String;

    fn try_from(raw: RawFieldPattern) -> Result<Self, Self::Error> {
        if raw.if_field.trim().is_empty() {
            return Err("ifField MUST be non-empty".to_string());
        }
        let pattern = Regex::new(&raw.matches_pattern)
            .map_err(|err| format!("invalid pattern {}: {err}", raw.matches_pattern))?;
        Ok(Self { field: raw.if_field, pattern })
    }
}

impl FieldPattern {
    /// Build a rule directly, as settings files and tests do.
    ///
    /// # Errors
    /// Returns [`PlanError::Validation`] when the pattern does not compile.
    pub fn new(field: &str, pattern: &str) -> Result<Self, PlanError> {
        Self::try_from(RawFieldPattern {
            if_field: field.to_string(),
            matches_pattern: pattern.to_string(),
        })
        .map_err(PlanError::Validation)
    }

    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        text_field(document, &self.field).is_some_and(|value| self.pattern.is_match(&value))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusPolicyKind {
    Retain,
    Overwrite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPolicy {
    pub policy: StatusPolicyKind,
    #[serde(default)]
    pub if_status_was: Vec<StatusName>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusName {
    pub name: String,
}

impl StatusPolicy {
    /// Whether an incoming status replaces a stored status named `existing`.
    #[must_use]
    pub fn overwrites(&self, existing: &str) -> bool {
        let listed = self.if_status_was.iter().any(|status| status.name.eq_ignore_ascii_case(existing));
        match self.policy {
            StatusPolicyKind::Retain => listed,
            StatusPolicyKind::Overwrite => !listed,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum CodingCondition {
    #[serde(rename = "deleteSkipped")]
    DeleteSkipped,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticalCoding {
    #[serde(rename = "if")]
    pub condition: CodingCondition,
    pub because_of: ConstraintKind,
    pub set_code: String,
}
