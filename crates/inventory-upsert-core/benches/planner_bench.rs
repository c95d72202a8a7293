use criterion::{criterion_group, criterion_main, Criterion};
use inventory_upsert_core::{
    plan_deletion, DeletionContext, ProcessingInstructions, RecordSet, UpsertPlan,
    DEFAULT_ACTIVE_ITEM_STATUSES,
};
use serde_json::{json, Value};

fn mk_holdings(index: usize, items: usize) -> Value {
    json!({
        "id": format!("h-{index}"),
        "hrid": format!("ho{index:04}"),
        "instanceId": "i-1",
        "permanentLocationId": "loc-1",
        "items": (0..items)
            .map(|item| json!({
                "id": format!("t-{index}-{item}"),
                "hrid": format!("it{index:04}-{item:02}"),
                "holdingsRecordId": format!("h-{index}"),
                "status": {"name": if item % 7 == 0 { "Checked out" } else { "Available" }},
            }))
            .collect::<Vec<_>>(),
    })
}

fn stored_set(holdings: usize, items: usize) -> RecordSet {
    let documents = (0..holdings)
        .map(|index| {
            let mut document = mk_holdings(index, items);
            let item_documents = document
                .as_object_mut()
                .and_then(|object| object.remove("items"))
                .and_then(|value| value.as_array().cloned())
                .unwrap_or_default();
            (document, item_documents)
        })
        .collect::<Vec<_>>();
    match RecordSet::from_stored(json!({"id": "i-1", "hrid": "in0001", "title": "Bench"}), documents, Vec::new()) {
        Ok(set) => set,
        Err(err) => panic!("stored bench fixture failed: {err}"),
    }
}

fn bench_upsert_plan(c: &mut Criterion) {
    let active = DEFAULT_ACTIVE_ITEM_STATUSES.iter().map(ToString::to_string).collect::<Vec<_>>();
    // Every other holdings record is omitted from the request.
    let request = json!({
        "instance": {"hrid": "in0001", "title": "Bench"},
        "holdingsRecords": (0..200).step_by(2).map(|index| mk_holdings(index, 10)).collect::<Vec<_>>(),
    });

    c.bench_function("upsert_plan_200_holdings_2000_items", |b| {
        b.iter(|| {
            let planned = RecordSet::from_request(&request).and_then(|incoming| {
                UpsertPlan::new(incoming, Some(stored_set(200, 10)), ProcessingInstructions::default(), &active)
            });
            if let Err(err) = planned.and_then(UpsertPlan::finalize) {
                panic!("upsert plan benchmark failed: {err}");
            }
        });
    });
}

fn bench_deletion_plan(c: &mut Criterion) {
    let active = DEFAULT_ACTIVE_ITEM_STATUSES.iter().map(ToString::to_string).collect::<Vec<_>>();
    let instructions = ProcessingInstructions::default();
    let context = DeletionContext { instructions: &instructions, active_statuses: &active, order_line_count: 0 };

    c.bench_function("deletion_plan_200_holdings_2000_items", |b| {
        b.iter(|| plan_deletion(stored_set(200, 10), &context));
    });
}

criterion_group!(planner_benches, bench_upsert_plan, bench_deletion_plan);
criterion_main!(planner_benches);
