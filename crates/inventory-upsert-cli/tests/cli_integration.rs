use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_iu<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_iu"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute iu binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_iu(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "iu command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, value.to_string())
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    path
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn metric(report: &Value, entity: &str, transition: &str, outcome: &str) -> i64 {
    report["metrics"][entity][transition][outcome]
        .as_i64()
        .unwrap_or_else(|| panic!("missing metric {entity}.{transition}.{outcome} in report: {report}"))
}

fn record_set(hrid: &str, item_status: &str) -> Value {
    json!({
        "instance": {"hrid": hrid, "title": "Cataloguing rules"},
        "holdingsRecords": [{
            "hrid": format!("{hrid}-h1"),
            "items": [
                {"hrid": format!("{hrid}-i1"), "status": {"name": "Available"}},
                {"hrid": format!("{hrid}-i2"), "status": {"name": item_status}}
            ]
        }]
    })
}

// Test IDs: TCLI-001
#[test]
fn db_commands_report_and_apply_migrations() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-db");
    let db = sandbox.join("inventory.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(before["up_to_date"], false);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run["dry_run"], true);
    assert_eq!(
        dry_run["would_apply_versions"].as_array().map(Vec::len),
        Some(usize::try_from(as_i64(&dry_run, "target_version")).unwrap_or_default())
    );

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(migrated["up_to_date"], true);
    assert_eq!(migrated["after_version"], migrated["target_version"]);

    let after = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(after["up_to_date"], true);
}

// Test IDs: TCLI-002
#[test]
fn upsert_show_and_delete_round_trip() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-upsert");
    let db = sandbox.join("inventory.sqlite3");
    let request = write_json(&sandbox, "set.json", &record_set("in-1", "Available"));

    let created = run_json(["--db", path_str(&db), "upsert", "--in", path_str(&request)]);
    assert_eq!(as_str(&created, "status"), "OK");
    assert_eq!(metric(&created, "INSTANCE", "CREATE", "COMPLETED"), 1);
    assert_eq!(metric(&created, "ITEM", "CREATE", "COMPLETED"), 2);

    let repeated = run_json(["--db", path_str(&db), "upsert", "--in", path_str(&request)]);
    assert_eq!(metric(&repeated, "INSTANCE", "UPDATE", "COMPLETED"), 1);
    assert_eq!(metric(&repeated, "ITEM", "CREATE", "COMPLETED"), 0);

    let shown = run_json(["--db", path_str(&db), "show", "--hrid", "in-1"]);
    assert_eq!(shown["instance"]["hrid"], "in-1");
    assert_eq!(shown["holdingsRecords"][0]["items"].as_array().map(Vec::len), Some(2));

    let delete = write_json(&sandbox, "delete.json", &json!({"hrid": "in-1"}));
    let deleted = run_json(["--db", path_str(&db), "delete", "--in", path_str(&delete)]);
    assert_eq!(metric(&deleted, "INSTANCE", "DELETE", "COMPLETED"), 1);
    assert_eq!(metric(&deleted, "ITEM", "DELETE", "COMPLETED"), 2);

    let missing = run_iu(["--db", path_str(&db), "show", "--hrid", "in-1"]);
    assert!(!missing.status.success());
    assert_eq!(parse_stdout(&missing)["found"], false);
}

// Test IDs: TCLI-003
#[test]
fn failing_reports_exit_nonzero_with_json_on_stdout() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-errors");
    let db = sandbox.join("inventory.sqlite3");

    let delete = write_json(&sandbox, "delete.json", &json!({"hrid": "nowhere"}));
    let output = run_iu(["--db", path_str(&db), "delete", "--in", path_str(&delete)]);
    assert!(!output.status.success());
    let report = parse_stdout(&output);
    assert_eq!(as_str(&report, "status"), "NOT_FOUND");
    assert_eq!(as_i64(&report, "statusCode"), 404);

    let malformed = write_json(&sandbox, "bad.json", &json!({"instance": {"title": "no hrid"}}));
    let output = run_iu(["--db", path_str(&db), "upsert", "--in", path_str(&malformed)]);
    assert!(!output.status.success());
    assert_eq!(as_i64(&parse_stdout(&output), "statusCode"), 400);
}

// Test IDs: TCLI-004
#[test]
fn active_items_and_order_lines_block_deletion() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-constraints");
    let db = sandbox.join("inventory.sqlite3");
    let request = write_json(&sandbox, "set.json", &record_set("in-2", "Checked out"));
    run_json(["--db", path_str(&db), "upsert", "--in", path_str(&request)]);

    let shown = run_json(["--db", path_str(&db), "show", "--hrid", "in-2"]);
    let instance_id = as_str(&shown["instance"], "id").to_string();
    run_json(["--db", path_str(&db), "order-line", "add", "--id", "po-1", "--instance-id", &instance_id]);

    let delete = write_json(&sandbox, "delete.json", &json!({"hrid": "in-2"}));
    let report = run_json(["--db", path_str(&db), "delete", "--in", path_str(&delete)]);
    assert_eq!(metric(&report, "ITEM", "DELETE", "COMPLETED"), 1);
    assert_eq!(metric(&report, "ITEM", "DELETE", "SKIPPED"), 1);
    assert_eq!(metric(&report, "INSTANCE", "DELETE", "SKIPPED"), 1);

    let remaining = run_json(["--db", path_str(&db), "show", "--hrid", "in-2"]);
    assert_eq!(remaining["holdingsRecords"][0]["items"].as_array().map(Vec::len), Some(1));
}

// Test IDs: TCLI-005
#[test]
fn settings_file_overrides_active_item_statuses() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-settings");
    let db = sandbox.join("inventory.sqlite3");
    let settings = sandbox.join("settings.yaml");
    fs::write(&settings, "activeItemStatuses: []\n")
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", settings.display()));

    let request = write_json(&sandbox, "set.json", &record_set("in-3", "Checked out"));
    run_json(["--db", path_str(&db), "upsert", "--in", path_str(&request)]);

    let delete = write_json(&sandbox, "delete.json", &json!({"hrid": "in-3"}));
    let report = run_json([
        "--db",
        path_str(&db),
        "--settings",
        path_str(&settings),
        "delete",
        "--in",
        path_str(&delete),
    ]);
    assert_eq!(metric(&report, "ITEM", "DELETE", "COMPLETED"), 2);
    assert_eq!(metric(&report, "INSTANCE", "DELETE", "COMPLETED"), 1);
}

// Test IDs: TCLI-006
#[test]
fn batch_upsert_writes_every_set() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-batch");
    let db = sandbox.join("inventory.sqlite3");
    let batch = write_json(
        &sandbox,
        "batch.json",
        &json!([record_set("b-1", "Available"), record_set("b-2", "Available"), {"instance": {}}]),
    );

    let report = run_json(["--db", path_str(&db), "upsert-batch", "--in", path_str(&batch)]);
    assert_eq!(as_str(&report, "status"), "PARTIAL_SUCCESS");
    assert_eq!(metric(&report, "INSTANCE", "CREATE", "COMPLETED"), 2);
    assert_eq!(metric(&report, "ITEM", "CREATE", "COMPLETED"), 4);
    assert_eq!(report["errors"].as_array().map(Vec::len), Some(1));

    let not_array = write_json(&sandbox, "single.json", &record_set("b-3", "Available"));
    let output = run_iu(["--db", path_str(&db), "upsert-batch", "--in", path_str(&not_array)]);
    assert!(!output.status.success());
}

// Test IDs: TCLI-007
#[test]
fn shared_upserts_merge_institutions_onto_one_instance() {
    let sandbox = unique_temp_dir("inventory-upsert-cli-shared");
    let db = sandbox.join("inventory.sqlite3");
    run_json(["--db", path_str(&db), "location", "add", "--id", "loc-a", "--institution", "inst-a"]);
    run_json(["--db", path_str(&db), "location", "add", "--id", "loc-b", "--institution", "inst-b"]);

    let shared = |institution: &str, local: &str, hrid: &str, location: &str| {
        json!({
            "institutionId": institution,
            "localIdentifier": local,
            "identifierTypeId": "local-id",
            "instance": {"hrid": hrid, "title": "Shared title"},
            "holdingsRecords": [{"hrid": format!("{hrid}-h"), "permanentLocationId": location, "items": []}]
        })
    };
    let first = write_json(&sandbox, "a.json", &shared("inst-a", "a-1", "SA", "loc-a"));
    let second = write_json(&sandbox, "b.json", &shared("inst-b", "b-1", "SB", "loc-b"));
    run_json(["--db", path_str(&db), "upsert", "--shared", "--in", path_str(&first)]);
    let merged = run_json(["--db", path_str(&db), "upsert", "--shared", "--in", path_str(&second)]);
    assert_eq!(metric(&merged, "INSTANCE", "UPDATE", "COMPLETED"), 1);

    let shown = run_json(["--db", path_str(&db), "show", "--hrid", "SA"]);
    assert_eq!(shown["holdingsRecords"].as_array().map(Vec::len), Some(2));
    assert_eq!(shown["instance"]["identifiers"].as_array().map(Vec::len), Some(2));

    let withdraw = write_json(
        &sandbox,
        "withdraw.json",
        &json!({"institutionId": "inst-a", "localIdentifier": "a-1", "identifierTypeId": "local-id"}),
    );
    run_json(["--db", path_str(&db), "delete", "--shared", "--in", path_str(&withdraw)]);
    let shown = run_json(["--db", path_str(&db), "show", "--hrid", "SA"]);
    assert_eq!(shown["holdingsRecords"].as_array().map(Vec::len), Some(1));
}
