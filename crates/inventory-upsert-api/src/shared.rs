//! Shared-index mode: several institutions contribute to one instance that is
//! matched on a composite key instead of its natural key.

use futures::future::join_all;
use inventory_upsert_core::identity::{identifiers, set_identifiers};
use inventory_upsert_core::model::text_field;
use inventory_upsert_core::{
    compute_match_key, merge_identifiers, plan_shared_deletion, strip_identifier, DeletionContext, EntityKind,
    ErrorCategory, ErrorReport, LocalIdentifier, Outcome, PlanError, RecordError, RecordId, RecordSet,
    UpsertReport, MATCH_KEY_FIELD,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::execution::execute;
use crate::{log_plan, InventoryUpsertApi, RequestError, StoredGraph};

const LOCATION_FIELD: &str = "permanentLocationId";

/// A planned shared upsert and the instances its local identifier moves off.
struct SharedUpsert {
    set: RecordSet,
    local: LocalIdentifier,
    stale: Vec<Value>,
}

impl InventoryUpsertApi {
    /// Upsert one institution's copy of a shared instance.
    ///
    /// The instance is matched on its match key and the institution's local
    /// identifier is merged into the stored identifiers. Holdings owned by other
    /// institutions are left alone. Once the instance is written, the local
    /// identifier is removed from instances still filed under an older key.
    pub async fn upsert_shared(&self, request: &Value) -> UpsertReport {
        match self.plan_shared_upsert(request).await {
            Ok(SharedUpsert { mut set, local, stale }) => {
                execute(self.storage.as_ref(), &mut set).await;
                let mut report = UpsertReport::from_record_set(&set);
                if set.instance.outcome == Outcome::Completed {
                    report.push_errors(self.shift_local_identifier(&local, stale).await);
                } else if !stale.is_empty() {
                    warn!(
                        hrid = %set.instance.natural_key,
                        institution = %local.institution_id,
                        "instance write failed, local identifier stays on its previous instance"
                    );
                }
                report
            }
            Err(error) => {
                warn!(error = %error, "shared upsert request rejected");
                error.to_report(request)
            }
        }
    }

    /// Withdraw one institution from a shared instance.
    pub async fn delete_shared(&self, request: &Value) -> UpsertReport {
        match self.plan_shared_delete(request).await {
            Ok(mut set) => {
                execute(self.storage.as_ref(), &mut set).await;
                UpsertReport::from_record_set(&set)
            }
            Err(error) => {
                warn!(error = %error, "shared delete request rejected");
                error.to_report(request)
            }
        }
    }

    async fn plan_shared_upsert(&self, request: &Value) -> Result<SharedUpsert, RequestError> {
        let local = LocalIdentifier::from_request(request)?;
        let mut incoming = RecordSet::from_request(request)?;
        let instructions = self.settings.instructions_for(request)?;

        let match_key = compute_match_key(&incoming.instance.document);
        if let Some(object) = incoming.instance.document.as_object_mut() {
            object.insert(MATCH_KEY_FIELD.to_string(), Value::String(match_key.clone()));
        }
        let holders = self
            .storage
            .find_instances_by_identifier(&local.identifier_type_id, &local.value)
            .await?;

        let stored = match self.storage.find_instance_by_match_key(&match_key).await? {
            Some(stored) => Some(stored),
            None => self.claim_natural_key(&mut incoming, &local, &holders).await?,
        };
        let target_id = stored.as_ref().and_then(|stored| text_field(stored, "id"));
        let stale = holders
            .into_iter()
            .filter(|holder| text_field(holder, MATCH_KEY_FIELD).as_deref() != Some(match_key.as_str()))
            .filter(|holder| target_id.is_none() || text_field(holder, "id") != target_id)
            .collect::<Vec<_>>();

        let incoming_identifiers = merge_identifiers(&identifiers(&incoming.instance.document), &[local.to_identifier()]);
        let existing = match stored {
            Some(stored) => {
                if let Some(hrid) = text_field(&stored, "hrid") {
                    rename_instance(&mut incoming, hrid);
                }
                let merged = merge_identifiers(&identifiers(&stored), &incoming_identifiers);
                set_identifiers(&mut incoming.instance.document, merged);

                let mut graph = StoredGraph::load(self.storage.as_ref(), stored).await?;
                self.keep_own_holdings(&mut graph, &local.institution_id).await?;
                Some(graph.into_record_set()?)
            }
            None => {
                set_identifiers(&mut incoming.instance.document, incoming_identifiers);
                None
            }
        };

        let set = self.complete_plan(incoming, existing, instructions).await?;
        Ok(SharedUpsert { set, local, stale })
    }

    /// Settle who owns the incoming hrid when no instance carries the match key.
    ///
    /// An instance holding the hrid that only this institution's identifier
    /// kept alive is taken over and refiled under the new key. An hrid held by
    /// any other instance is qualified with the institution id for the new
    /// instance.
    async fn claim_natural_key(
        &self,
        incoming: &mut RecordSet,
        local: &LocalIdentifier,
        holders: &[Value],
    ) -> Result<Option<Value>, RequestError> {
        let hrid = incoming.instance.natural_key.clone();
        let Some(current) = self.storage.find_by_natural_key(EntityKind::Instance, &hrid).await? else {
            return Ok(None);
        };
        let held_by_institution = text_field(&current, "id")
            .is_some_and(|id| holders.iter().any(|holder| text_field(holder, "id").as_deref() == Some(id.as_str())));
        let mut remaining = current.clone();
        strip_identifier(&mut remaining, local);
        if held_by_institution && identifiers(&remaining).is_empty() {
            info!(hrid = %hrid, institution = %local.institution_id, "instance refiled under its new match key");
            return Ok(Some(current));
        }

        let qualified = format!("{hrid}-{}", local.institution_id);
        if self.storage.find_by_natural_key(EntityKind::Instance, &qualified).await?.is_some() {
            return Err(PlanError::Validation(format!(
                "instance hrid {hrid} is held by an instance with another match key"
            ))
            .into());
        }
        info!(hrid = %hrid, qualified = %qualified, "hrid held under another match key, new instance qualified");
        rename_instance(incoming, qualified);
        Ok(None)
    }

    async fn plan_shared_delete(&self, request: &Value) -> Result<RecordSet, RequestError> {
        let local = LocalIdentifier::from_request(request)?;
        let instructions = self.settings.instructions_for(request)?;
        let holders = self
            .storage
            .find_instances_by_identifier(&local.identifier_type_id, &local.value)
            .await?;
        let Some(instance) = holders.into_iter().next() else {
            return Err(RequestError::NotFound(format!(
                "no instance carries identifier {} of type {}",
                local.value, local.identifier_type_id
            )));
        };

        let mut graph = StoredGraph::load(self.storage.as_ref(), instance).await?;
        let foreign = self.keep_own_holdings(&mut graph, &local.institution_id).await?;
        let order_line_count = self.order_line_count(&graph).await?;
        let context = DeletionContext {
            instructions: &instructions,
            active_statuses: &self.settings.active_item_statuses,
            order_line_count,
        };
        let mut set = plan_shared_deletion(graph.into_record_set()?, &local, !foreign.is_empty(), &context);
        set.request = request.clone();
        log_plan("shared delete", &set);
        Ok(set)
    }

    /// Drop holdings located at another institution from the graph and return them.
    async fn keep_own_holdings(
        &self,
        graph: &mut StoredGraph,
        institution_id: &str,
    ) -> Result<Vec<(Value, Vec<Value>)>, RequestError> {
        let mut keep = Vec::with_capacity(graph.holdings.len());
        for (holdings, _) in &graph.holdings {
            let owner = match text_field(holdings, LOCATION_FIELD) {
                Some(location) => self.locations.institution_of(&location).await?,
                None => None,
            };
            keep.push(owner.as_deref() == Some(institution_id));
        }
        Ok(graph.split_holdings(&keep))
    }

    /// Move a local identifier off instances filed under an older match key.
    ///
    /// Failures come back as error reports; they do not fail the request.
    async fn shift_local_identifier(&self, local: &LocalIdentifier, stale: Vec<Value>) -> Vec<ErrorReport> {
        let mut errors = Vec::new();
        let mut updates = Vec::with_capacity(stale.len());
        for mut holder in stale {
            if !strip_identifier(&mut holder, local) {
                continue;
            }
            match text_field(&holder, "id") {
                Some(id) => updates.push((RecordId(id), holder)),
                None => {
                    let error = RecordError::new(
                        ErrorCategory::Internal,
                        500,
                        "Instance without identity",
                        "stored instance carrying the local identifier has no id",
                    );
                    errors.push(ErrorReport::from_record(EntityKind::Instance, &error, holder));
                }
            }
        }
        if updates.is_empty() {
            return errors;
        }

        let storage = self.storage.as_ref();
        let results =
            join_all(updates.iter().map(|(id, holder)| storage.update(EntityKind::Instance, id, holder))).await;
        for ((_, holder), result) in updates.into_iter().zip(results) {
            match result {
                Ok(()) => info!(
                    hrid = %text_field(&holder, "hrid").unwrap_or_default(),
                    institution = %local.institution_id,
                    "local identifier moved off instance with a stale match key"
                ),
                Err(error) => {
                    warn!(error = %error, "failed to move local identifier off stale instance");
                    errors.push(ErrorReport::from_record(
                        EntityKind::Instance,
                        &error.to_record_error(EntityKind::Instance),
                        holder,
                    ));
                }
            }
        }
        errors
    }
}

fn rename_instance(set: &mut RecordSet, hrid: String) {
    if let Some(object) = set.instance.document.as_object_mut() {
        object.insert("hrid".to_string(), Value::String(hrid.clone()));
    }
    set.instance.natural_key = hrid;
}
