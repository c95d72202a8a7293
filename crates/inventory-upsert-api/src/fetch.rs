//! Loading stored record graphs.

use futures::future::try_join_all;
use inventory_upsert_core::{
    EntityKind, InventoryStorage, PlanError, RecordId, RecordSet, StorageError, StoredRelation,
};
use serde_json::{json, Value};

/// A stored instance with everything hanging off it, as storage returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredGraph {
    pub instance: Value,
    pub holdings: Vec<(Value, Vec<Value>)>,
    pub relations: Vec<StoredRelation>,
}

impl StoredGraph {
    /// Load the holdings, items and relations of a stored instance document.
    ///
    /// # Errors
    /// Returns the first storage error hit while loading.
    pub async fn load(storage: &dyn InventoryStorage, instance: Value) -> Result<Self, StorageError> {
        let Some(id) = instance.get("id").and_then(Value::as_str).map(RecordId::from) else {
            return Err(StorageError::NotFound("stored instance has no id".to_string()));
        };
        let holdings = storage.find_by_parent_id(EntityKind::HoldingsRecord, &id).await?;
        let with_items = try_join_all(holdings.into_iter().map(|holdings| async move {
            let holdings_id = holdings.get("id").and_then(Value::as_str).map(RecordId::from);
            let items = match holdings_id {
                Some(holdings_id) => storage.find_by_parent_id(EntityKind::Item, &holdings_id).await?,
                None => Vec::new(),
            };
            Ok::<_, StorageError>((holdings, items))
        }))
        .await?;
        let relations = storage.find_relations_by_instance_id(&id).await?;
        Ok(Self { instance, holdings: with_items, relations })
    }

    /// Find an instance by natural key and load its graph.
    ///
    /// # Errors
    /// Returns the first storage error hit while loading.
    pub async fn find(storage: &dyn InventoryStorage, hrid: &str) -> Result<Option<Self>, StorageError> {
        match storage.find_by_natural_key(EntityKind::Instance, hrid).await? {
            Some(instance) => Ok(Some(Self::load(storage, instance).await?)),
            None => Ok(None),
        }
    }

    /// Find an instance by identity and load its graph.
    ///
    /// # Errors
    /// Returns the first storage error hit while loading.
    pub async fn find_by_id(storage: &dyn InventoryStorage, id: &RecordId) -> Result<Option<Self>, StorageError> {
        match storage.find_by_id(EntityKind::Instance, id).await? {
            Some(instance) => Ok(Some(Self::load(storage, instance).await?)),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> Option<RecordId> {
        self.instance.get("id").and_then(Value::as_str).map(RecordId::from)
    }

    /// Keep the holdings whose flag in `keep` is set, items included.
    ///
    /// Returns the holdings that were removed.
    pub fn split_holdings(&mut self, keep: &[bool]) -> Vec<(Value, Vec<Value>)> {
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for (entry, keep) in std::mem::take(&mut self.holdings).into_iter().zip(keep.iter().copied()) {
            if keep {
                kept.push(entry);
            } else {
                removed.push(entry);
            }
        }
        self.holdings = kept;
        removed
    }

    /// Planner view of the graph.
    ///
    /// # Errors
    /// Returns [`PlanError::Internal`] when a stored document lacks its identity.
    pub fn into_record_set(self) -> Result<RecordSet, PlanError> {
        RecordSet::from_stored(self.instance, self.holdings, self.relations)
    }

    /// The graph as a single JSON document, items nested under their holdings.
    #[must_use]
    pub fn to_document(&self) -> Value {
        let holdings = self
            .holdings
            .iter()
            .map(|(holdings, items)| {
                let mut document = holdings.clone();
                if let Some(object) = document.as_object_mut() {
                    object.insert("items".to_string(), Value::Array(items.clone()));
                }
                document
            })
            .collect::<Vec<_>>();
        let relations = self
            .relations
            .iter()
            .map(|relation| json!({"entity": relation.kind.as_str(), "document": relation.document}))
            .collect::<Vec<_>>();
        json!({
            "instance": self.instance,
            "holdingsRecords": holdings,
            "relations": relations,
        })
    }
}
