use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_db(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", ulid::Ulid::new()))
}

fn remove_db(db: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = fs::remove_file(format!("{}{suffix}", db.display()));
    }
}

fn run_ak<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ak"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ak binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ak(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ak command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    value
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn created_field_id(record: &Value) -> i64 {
    record
        .pointer("/params/params/field_id")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("create_field record has no field id: {record}"))
}

fn create_table(db: &Path, name: &str) -> i64 {
    let table = run_json(db, ["table", "create", "--workspace-id", "1", "--name", name]);
    as_i64(&table, "id")
}

fn create_field(db: &Path, session: &str, table_id: i64, name: &str, config: &str) -> i64 {
    let record = run_json(
        db,
        [
            "field",
            "create",
            "--table-id",
            &table_id.to_string(),
            "--name",
            name,
            "--config",
            config,
            "--actor-id",
            "1",
            "--session-id",
            session,
        ],
    );
    created_field_id(&record)
}

fn field_named(db: &Path, table_id: i64, field_id: i64) -> String {
    let fields = run_json(db, ["field", "list", "--table-id", &table_id.to_string()]);
    as_array(&fields, "fields")
        .iter()
        .find(|field| field.get("id").and_then(Value::as_i64) == Some(field_id))
        .and_then(|field| field.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| panic!("field {field_id} not listed: {fields}"))
}

// Test IDs: TCLI-001
#[test]
fn cli_migrate_reports_plan_then_up_to_date() {
    let db = unique_temp_db("actionkernel-cli-migrate");

    let plan = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(plan.get("dry_run").and_then(Value::as_bool), Some(true));
    assert_eq!(plan.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(applied.get("up_to_date").and_then(Value::as_bool), Some(true));

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 2);

    let report = run_json(&db, ["db", "integrity-check"]);
    assert_eq!(report.get("quick_check_ok").and_then(Value::as_bool), Some(true));

    remove_db(&db);
}

// Test IDs: TCLI-002
#[test]
fn cli_type_change_undo_redo_restores_cells() {
    let db = unique_temp_db("actionkernel-cli-history");
    let table_id = create_table(&db, "Invoices");
    let field_id = create_field(&db, "tab-a", table_id, "Amount", r#"{"type":"text"}"#);

    let values = serde_json::json!({ field_id.to_string(): "42.5" }).to_string();
    let row = run_json(&db, ["row", "create", "--table-id", &table_id.to_string(), "--values", &values]);
    let row_id = as_i64(&row, "id");

    let converted = run_json(
        &db,
        [
            "field",
            "update",
            "--field-id",
            &field_id.to_string(),
            "--config",
            r#"{"type":"number","decimal_places":0}"#,
            "--actor-id",
            "1",
            "--session-id",
            "tab-a",
        ],
    );
    assert_eq!(
        converted.pointer("/backup_data/artifact").and_then(Value::as_str),
        Some("shadow_column")
    );
    let backups = run_json(&db, ["backups", "list"]);
    assert_eq!(as_array(&backups, "artifacts").len(), 1);

    let cell = |db: &Path| {
        let rows = run_json(db, ["row", "list", "--table-id", &table_id.to_string()]);
        as_array(&rows, "rows")
            .iter()
            .find(|row| row.get("id").and_then(Value::as_i64) == Some(row_id))
            .and_then(|row| row.pointer(&format!("/values/{field_id}")).cloned())
            .unwrap_or_else(|| panic!("row {row_id} not listed: {rows}"))
    };
    assert_eq!(cell(&db), serde_json::json!(43.0));

    let selector = format!("table:{table_id}");
    let undone = run_json(&db, ["history", "undo", "--session-id", "tab-a", "--selector", &selector]);
    assert_eq!(undone.get("changed").and_then(Value::as_bool), Some(true));
    assert_eq!(cell(&db), serde_json::json!("42.5"));

    let redone = run_json(&db, ["history", "redo", "--session-id", "tab-a", "--selector", &selector]);
    assert_eq!(as_array(&redone, "records").len(), 1);
    assert_eq!(cell(&db), serde_json::json!(43.0));

    let history = run_json(&db, ["history", "list", "--session-id", "tab-a"]);
    assert_eq!(as_array(&history, "actions").len(), 2);

    remove_db(&db);
}

// Test IDs: TCLI-003
#[test]
fn cli_undo_in_other_session_changes_nothing() {
    let db = unique_temp_db("actionkernel-cli-session");
    let table_id = create_table(&db, "People");
    let field_id = create_field(&db, "tab-a", table_id, "Name", r#"{"type":"text"}"#);

    let selector = format!("create_field@table:{table_id}");
    let other = run_json(&db, ["history", "undo", "--session-id", "tab-b", "--selector", &selector]);
    assert_eq!(other.get("changed").and_then(Value::as_bool), Some(false));
    assert_eq!(field_named(&db, table_id, field_id), "Name");

    let owner = run_json(&db, ["history", "undo", "--session-id", "tab-a", "--selector", &selector]);
    assert_eq!(owner.get("changed").and_then(Value::as_bool), Some(true));
    let listed = run_json(&db, ["field", "list", "--table-id", &table_id.to_string()]);
    assert!(as_array(&listed, "fields").is_empty());

    remove_db(&db);
}

// Test IDs: TCLI-004
#[test]
fn cli_undo_collision_renames_with_suffix() {
    let db = unique_temp_db("actionkernel-cli-collision");
    let table_id = create_table(&db, "People");
    let field_id = create_field(&db, "tab-a", table_id, "Name", r#"{"type":"text"}"#);

    run_json(
        &db,
        [
            "field",
            "update",
            "--field-id",
            &field_id.to_string(),
            "--name",
            "test",
            "--actor-id",
            "1",
            "--session-id",
            "tab-a",
        ],
    );
    create_field(&db, "tab-b", table_id, "Name", r#"{"type":"text"}"#);

    let selector = format!("update_field@table:{table_id}");
    run_json(&db, ["history", "undo", "--session-id", "tab-a", "--selector", &selector]);
    assert_eq!(field_named(&db, table_id, field_id), "Name (From undo)");

    remove_db(&db);
}

// Test IDs: TCLI-005
#[test]
fn cli_rejects_unknown_selector_kind() {
    let db = unique_temp_db("actionkernel-cli-selector");
    let output = run_ak(
        &db,
        ["history", "undo", "--session-id", "tab-a", "--selector", "explode_table@table:1"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown action kind"), "unexpected stderr: {stderr}");

    remove_db(&db);
}

// Test IDs: TCLI-006
#[test]
fn cli_backup_cleanup_expires_records_after_retention() {
    let db = unique_temp_db("actionkernel-cli-retention");
    let table_id = create_table(&db, "Readings");
    let field_id = create_field(&db, "tab-a", table_id, "Flag", r#"{"type":"text"}"#);
    run_json(
        &db,
        [
            "field",
            "update",
            "--field-id",
            &field_id.to_string(),
            "--config",
            r#"{"type":"boolean"}"#,
            "--actor-id",
            "1",
            "--session-id",
            "tab-a",
        ],
    );

    let early = run_json(&db, ["backups", "cleanup"]);
    assert_eq!(as_i64(&early, "records_expired"), 0);

    let summary = run_json(
        &db,
        ["--backup-retention-minutes", "1", "backups", "cleanup", "--now", "2999-01-01T00:00:00Z"],
    );
    assert_eq!(as_i64(&summary, "records_expired"), 2);
    assert_eq!(as_i64(&summary, "backups_released"), 1);

    let backups = run_json(&db, ["backups", "list"]);
    assert!(as_array(&backups, "artifacts").is_empty());
    let pruned = run_json(&db, ["backups", "prune-orphans"]);
    assert!(as_array(&pruned, "released").is_empty());

    remove_db(&db);
}

// Test IDs: TCLI-007
#[test]
fn cli_config_file_rejects_zero_retention() {
    let db = unique_temp_db("actionkernel-cli-config");
    let config =
        std::env::temp_dir().join(format!("actionkernel-config-{}.json", ulid::Ulid::new()));
    fs::write(&config, r#"{"backup_retention_minutes":0}"#)
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));

    let args = [OsStr::new("--config"), config.as_os_str(), OsStr::new("backups"), OsStr::new("list")];
    let output = run_ak(&db, args);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("backup_retention_minutes"), "unexpected stderr: {stderr}");

    let _ = fs::remove_file(&config);
    remove_db(&db);
}
