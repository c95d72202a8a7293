//! Identity helpers for the shared index: match keys and per-institution identifiers.

use serde_json::{json, Value};

use crate::model::text_field;
use crate::PlanError;

pub const MATCH_KEY_FIELD: &str = "matchKey";
pub const IDENTIFIERS_FIELD: &str = "identifiers";

const TITLE_WIDTH: usize = 70;
const LEADING_ARTICLES: [&str; 3] = ["the ", "a ", "an "];

/// Compute the composite key that identifies an instance across institutions.
///
/// An explicit `matchKey` string on the instance wins over the computed key.
#[must_use]
pub fn compute_match_key(instance: &Value) -> String {
    if let Some(Value::String(explicit)) = instance.get(MATCH_KEY_FIELD) {
        if !explicit.trim().is_empty() {
            return explicit.clone();
        }
    }

    let publication = instance.get("publication").and_then(|list| list.get(0));
    let title = text_field(instance, "title").unwrap_or_default();
    let date = publication.and_then(|value| text_field(value, "dateOfPublication")).unwrap_or_default();
    let pagination = instance
        .get("physicalDescriptions")
        .and_then(|list| list.get(0))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let edition = instance
        .get("editions")
        .and_then(|list| list.get(0))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let publisher = publication.and_then(|value| text_field(value, "publisher")).unwrap_or_default();

    let mut key = title_part(&title);
    key.push_str(&year_part(&date));
    key.push_str(&pad(pagination.chars().filter(char::is_ascii_digit), 4));
    key.push_str(&pad(alphanumerics(edition), 3));
    key.push_str(&pad(alphanumerics(&publisher), 5));
    key
}

fn title_part(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let stripped = LEADING_ARTICLES
        .iter()
        .find_map(|article| lowered.strip_prefix(article))
        .unwrap_or(&lowered);
    let normalized = stripped
        .chars()
        .filter_map(|ch| match ch {
            ' ' => Some('_'),
            ch if ch.is_alphanumeric() => Some(ch),
            _ => None,
        });
    pad(normalized, TITLE_WIDTH)
}

fn year_part(date: &str) -> String {
    let digits = date.chars().collect::<Vec<_>>();
    digits
        .windows(4)
        .find(|window| window.iter().all(char::is_ascii_digit))
        .map_or_else(|| "0000".to_string(), |window| window.iter().collect())
}

fn alphanumerics(value: &str) -> impl Iterator<Item = char> + '_ {
    value.chars().filter(|ch| ch.is_alphanumeric()).flat_map(char::to_lowercase)
}

fn pad(chars: impl Iterator<Item = char>, width: usize) -> String {
    let mut part = chars.take(width).collect::<String>();
    let len = part.chars().count();
    part.extend(std::iter::repeat('_').take(width - len));
    part
}

/// The identifier an institution uses for its copy of a shared instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentifier {
    pub institution_id: String,
    pub identifier_type_id: String,
    pub value: String,
}

impl LocalIdentifier {
    /// Read `institutionId`, `identifierTypeId` and `localIdentifier` from a request.
    ///
    /// # Errors
    /// Returns [`PlanError::Validation`] when any of the three is missing or empty.
    pub fn from_request(request: &Value) -> Result<Self, PlanError> {
        let required = |field: &str| {
            text_field(request, field)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| PlanError::Validation(format!("shared request MUST carry {field}")))
        };
        Ok(Self {
            institution_id: required("institutionId")?,
            identifier_type_id: required("identifierTypeId")?,
            value: required("localIdentifier")?,
        })
    }

    #[must_use]
    pub fn to_identifier(&self) -> Value {
        json!({"identifierTypeId": self.identifier_type_id, "value": self.value})
    }

    #[must_use]
    pub fn matches(&self, identifier: &Value) -> bool {
        text_field(identifier, "identifierTypeId").as_deref() == Some(self.identifier_type_id.as_str())
            && text_field(identifier, "value").as_deref() == Some(self.value.as_str())
    }
}

/// Union of two identifier lists, existing entries first, deduplicated by equality.
#[must_use]
pub fn merge_identifiers(existing: &[Value], incoming: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(existing.len() + incoming.len());
    for identifier in existing.iter().chain(incoming) {
        if !merged.contains(identifier) {
            merged.push(identifier.clone());
        }
    }
    merged
}

#[must_use]
pub fn identifiers(document: &Value) -> Vec<Value> {
    document.get(IDENTIFIERS_FIELD).and_then(Value::as_array).cloned().unwrap_or_default()
}

pub fn set_identifiers(document: &mut Value, identifiers: Vec<Value>) {
    if let Some(object) = document.as_object_mut() {
        object.insert(IDENTIFIERS_FIELD.to_string(), Value::Array(identifiers));
    }
}

/// Remove an institution's identifier from an instance. Returns whether anything was removed.
pub fn strip_identifier(document: &mut Value, local: &LocalIdentifier) -> bool {
    let current = identifiers(document);
    let before = current.len();
    let kept = current.into_iter().filter(|identifier| !local.matches(identifier)).collect::<Vec<_>>();
    let removed = kept.len() != before;
    if removed {
        set_identifiers(document, kept);
    }
    removed
}
