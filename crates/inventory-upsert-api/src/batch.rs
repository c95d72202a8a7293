//! Batch upserts with a bulk fast path that degrades to per-record writes.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use inventory_upsert_core::{
    EntityKind, ErrorReport, InstanceIdentifier, RecordPath, RecordSet, StorageError, Transition, UpsertReport,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::execution::execute;
use crate::InventoryUpsertApi;

/// Kinds written in bulk, parents first.
const BULK_KINDS: [EntityKind; 3] = [EntityKind::Instance, EntityKind::HoldingsRecord, EntityKind::Item];

impl InventoryUpsertApi {
    /// Upsert many record sets.
    ///
    /// Instances, holdings and items are written with one bulk call per kind.
    /// When storage rejects a bulk call every set is re-planned and executed
    /// one record at a time. Sets that share records or relation targets with
    /// another set skip the bulk path and run one after the other in request
    /// order. Sets that fail to parse are left out and reported.
    pub async fn upsert_batch(&self, requests: &[Value]) -> UpsertReport {
        if let [request] = requests {
            return match self.plan_upsert(request).await {
                Ok(mut set) => {
                    execute(self.storage.as_ref(), &mut set).await;
                    UpsertReport::batch(&[set], Vec::new())
                }
                Err(error) => UpsertReport::batch(&[], vec![error.to_error_report(request)]),
            };
        }

        let planned = join_all(requests.iter().map(|request| self.plan_upsert(request))).await;
        let mut accepted = Vec::with_capacity(requests.len());
        let mut rejected = Vec::new();
        for (request, outcome) in requests.iter().zip(planned) {
            match outcome {
                Ok(set) => accepted.push((request, set)),
                Err(error) => {
                    warn!(error = %error, "record set excluded from batch");
                    rejected.push(error.to_error_report(request));
                }
            }
        }

        let overlapping = overlapping_sets(accepted.iter().map(|(_, set)| set));
        let mut independent_requests = Vec::with_capacity(accepted.len());
        let mut sets = Vec::with_capacity(accepted.len());
        let mut chained = Vec::new();
        for ((request, set), overlaps) in accepted.into_iter().zip(overlapping) {
            if overlaps {
                chained.push(request);
            } else {
                independent_requests.push(request);
                sets.push(set);
            }
        }

        match self.write_in_bulk(&mut sets).await {
            Ok(()) => {
                for set in &mut sets {
                    execute(self.storage.as_ref(), set).await;
                }
            }
            Err(error) if self.settings.degrade_rejected_batches => {
                info!(error = %error, sets = sets.len(), "bulk write rejected, falling back to single-record upserts");
                sets.clear();
                self.upsert_in_order(independent_requests, &mut sets, &mut rejected).await;
            }
            Err(error) => {
                warn!(error = %error, sets = sets.len(), "bulk write rejected");
                for set in &mut sets {
                    fail_bulk_records(set, &error);
                }
            }
        }

        if !chained.is_empty() {
            info!(sets = chained.len(), "record sets sharing records with other sets run one at a time");
            self.upsert_in_order(chained, &mut sets, &mut rejected).await;
        }

        UpsertReport::batch(&sets, rejected)
    }

    /// Plan and execute each request only after the previous one's writes landed.
    async fn upsert_in_order(&self, requests: Vec<&Value>, sets: &mut Vec<RecordSet>, rejected: &mut Vec<ErrorReport>) {
        for request in requests {
            match self.plan_upsert(request).await {
                Ok(mut set) => {
                    execute(self.storage.as_ref(), &mut set).await;
                    sets.push(set);
                }
                Err(error) => rejected.push(error.to_error_report(request)),
            }
        }
    }

    /// Write every pending instance, holdings and item document kind by kind.
    async fn write_in_bulk(&self, sets: &mut [RecordSet]) -> Result<(), StorageError> {
        for kind in BULK_KINDS {
            let paths = sets
                .iter()
                .enumerate()
                .flat_map(|(index, set)| bulk_paths(set, kind).into_iter().map(move |path| (index, path)))
                .collect::<Vec<_>>();
            if paths.is_empty() {
                continue;
            }
            let documents = paths
                .iter()
                .filter_map(|(index, path)| sets.get(*index)?.record(*path).map(|record| record.document.clone()))
                .collect::<Vec<_>>();
            self.storage.upsert_batch(kind, &documents).await?;
            debug!(entity = %kind, documents = documents.len(), "bulk write stored");
            for (index, path) in paths {
                if let Some(record) = sets.get_mut(index).and_then(|set| set.record_mut(path)) {
                    record.complete();
                }
            }
        }
        Ok(())
    }
}

/// Flag every set that shares a record or relation target with another set.
///
/// Plans of such sets were all made against the same stored state, so they
/// cannot be written side by side.
fn overlapping_sets<'a>(sets: impl Iterator<Item = &'a RecordSet>) -> Vec<bool> {
    let footprints = sets.map(footprint).collect::<Vec<_>>();
    let mut seen = HashMap::<&str, usize>::new();
    for key in footprints.iter().flatten() {
        *seen.entry(key.as_str()).or_default() += 1;
    }
    footprints
        .iter()
        .map(|keys| keys.iter().any(|key| seen.get(key.as_str()).copied().unwrap_or_default() > 1))
        .collect()
}

/// Keys of every record a planned set reads or writes.
fn footprint(set: &RecordSet) -> HashSet<String> {
    let mut keys = HashSet::new();
    keys.insert(format!("instance:{}", set.instance.natural_key));
    if let Some(id) = &set.instance.id {
        keys.insert(format!("id:{id}"));
    }
    for entry in &set.holdings {
        keys.insert(format!("holdings:{}", entry.record.natural_key));
        keys.extend(entry.items.iter().map(|item| format!("item:{}", item.natural_key)));
    }
    for target in set.relation_requests.targets() {
        keys.insert(match target {
            InstanceIdentifier::Hrid(hrid) => format!("instance:{hrid}"),
            InstanceIdentifier::Uuid(uuid) => format!("id:{uuid}"),
        });
    }
    for relation in &set.relations {
        if let Some(target) = &relation.target_id {
            keys.insert(format!("id:{target}"));
        }
        if let Some(provisional) = &relation.provisional {
            keys.insert(format!("instance:{}", provisional.natural_key));
        }
    }
    keys
}

fn bulk_paths(set: &RecordSet, kind: EntityKind) -> Vec<RecordPath> {
    set.paths()
        .into_iter()
        .filter(|path| matches!(path, RecordPath::Instance | RecordPath::Holdings(_) | RecordPath::Item(..)))
        .filter(|path| {
            set.record(*path).is_some_and(|record| {
                record.kind == kind
                    && (record.awaits(Transition::Create) || record.awaits(Transition::Update))
            })
        })
        .collect()
}

fn fail_bulk_records(set: &mut RecordSet, error: &StorageError) {
    for kind in BULK_KINDS {
        for path in bulk_paths(set, kind) {
            if let Some(record) = set.record_mut(path) {
                record.fail(error.to_record_error(kind));
            }
        }
    }
    for path in set.paths() {
        if let Some(record) = set.record_mut(path) {
            if record.is_pending() {
                record.skip();
            }
        }
    }
}
