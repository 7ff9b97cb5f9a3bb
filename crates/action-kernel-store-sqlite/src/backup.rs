use action_kernel_core::{ActionId, BackupData, EngineError, FieldId, TableId};
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::schema::{self, data_table, relation_table};
use crate::{table_columns, table_exists};

const SHADOW_PREFIX: &str = "bak_";
const SHADOW_RELATION_PREFIX: &str = "bak_rel_";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupSummary {
    pub records_expired: usize,
    pub backups_released: usize,
    pub expired_action_ids: Vec<ActionId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PruneSummary {
    pub referenced: usize,
    pub released: Vec<BackupData>,
}

fn unique_suffix() -> String {
    Ulid::new().to_string().to_lowercase()
}

pub(crate) fn shadow_column_name(field_id: FieldId) -> String {
    format!("{SHADOW_PREFIX}{field_id}_{}", unique_suffix())
}

/// Throwaway column used while a field is rebuilt without keeping a backup.
pub(crate) fn scratch_column_name(field_id: FieldId) -> String {
    format!("tmp_{field_id}_{}", unique_suffix())
}

/// Copy the relation table of `relation_id`, row ids included, under a fresh backup name.
pub(crate) fn snapshot_relation(conn: &Connection, relation_id: FieldId) -> Result<BackupData> {
    let table = format!("{SHADOW_RELATION_PREFIX}{relation_id}_{}", unique_suffix());
    let source = relation_table(relation_id);
    if table_exists(conn, &source)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {table} AS SELECT id, source_row_id, target_row_id FROM {source}"
        ))
    } else {
        conn.execute_batch(&format!(
            "CREATE TABLE {table} (id INTEGER, source_row_id INTEGER, target_row_id INTEGER)"
        ))
    }
    .with_context(|| format!("failed to snapshot relation table {source}"))?;

    tracing::debug!(relation_id = relation_id.0, backup = %table, "created shadow relation table");
    Ok(BackupData::ShadowRelation { relation_id, table })
}

/// Copy the shadow column back into the (already recreated) field column.
pub(crate) fn restore_column(
    conn: &Connection,
    table_id: TableId,
    field_id: FieldId,
    shadow_column: &str,
) -> Result<()> {
    if !table_columns(conn, &data_table(table_id))?.iter().any(|name| name == shadow_column) {
        return Err(EngineError::TargetUnrecoverable(format!(
            "backup column {shadow_column} of table {table_id} no longer exists"
        ))
        .into());
    }
    schema::copy_column(conn, table_id, shadow_column, &schema::field_column(field_id))
}

/// Recreate relation table `relation_id` from its backup, dropping pairs whose rows are gone.
pub(crate) fn restore_relation(
    conn: &Connection,
    backup_table: &str,
    relation_id: FieldId,
    source_table: TableId,
    target_table: TableId,
) -> Result<()> {
    if !table_exists(conn, backup_table)? {
        return Err(EngineError::TargetUnrecoverable(format!(
            "backup table {backup_table} no longer exists"
        ))
        .into());
    }

    schema::drop_relation_table(conn, relation_id)?;
    schema::create_relation_table(conn, relation_id)?;
    conn.execute(
        &format!(
            "INSERT INTO {relation}(id, source_row_id, target_row_id)
             SELECT id, source_row_id, target_row_id FROM {backup_table}
             WHERE source_row_id IN (SELECT id FROM {source})
               AND target_row_id IN (SELECT id FROM {target})",
            relation = relation_table(relation_id),
            source = data_table(source_table),
            target = data_table(target_table),
        ),
        [],
    )
    .with_context(|| format!("failed to restore relation {relation_id} from {backup_table}"))?;
    Ok(())
}

fn drop_artifact(conn: &Connection, backup: &BackupData) -> Result<bool> {
    match backup {
        BackupData::ShadowColumn { table_id, column } => {
            schema::drop_column_if_exists(conn, *table_id, column)
        }
        BackupData::ShadowRelation { table, .. } => {
            if !table_exists(conn, table)? {
                return Ok(false);
            }
            conn.execute_batch(&format!("DROP TABLE {table}"))
                .with_context(|| format!("failed to drop backup table {table}"))?;
            Ok(true)
        }
    }
}

/// Delete a backup artifact. Already missing artifacts and missing parent tables are success;
/// failures are logged and never returned.
pub(crate) fn release(conn: &Connection, backup: &BackupData) {
    match drop_artifact(conn, backup) {
        Ok(true) => tracing::debug!(backup = %backup.describe(), "released backup artifact"),
        Ok(false) => tracing::debug!(backup = %backup.describe(), "backup artifact already gone"),
        Err(err) => {
            tracing::warn!(backup = %backup.describe(), error = %err, "failed to release backup artifact");
        }
    }
}

/// Every backup artifact present in the database, whether or not a record still references it.
pub(crate) fn list_artifacts(conn: &Connection) -> Result<Vec<BackupData>> {
    let tables = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table'
             AND (name LIKE 'bak\\_%' ESCAPE '\\' OR name LIKE 'tbl\\_%' ESCAPE '\\')
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list candidate tables")?
    };

    let mut artifacts = Vec::new();
    for table in tables {
        if let Some(rest) = table.strip_prefix(SHADOW_RELATION_PREFIX) {
            let relation_id = rest
                .split('_')
                .next()
                .and_then(|raw| raw.parse::<i64>().ok())
                .map_or(FieldId(0), FieldId);
            artifacts.push(BackupData::ShadowRelation { relation_id, table });
        } else if let Some(raw_id) = table.strip_prefix("tbl_") {
            let Ok(table_id) = raw_id.parse::<i64>().map(TableId) else {
                continue;
            };
            for column in table_columns(conn, &table)? {
                if column.starts_with(SHADOW_PREFIX) {
                    artifacts.push(BackupData::ShadowColumn { table_id, column });
                }
            }
        }
    }
    Ok(artifacts)
}
