use std::collections::BTreeMap;

use action_kernel_core::{
    normalize_name, CellValue, EngineError, Field, FieldConfig, FieldId, FieldType, Row, RowId,
    SelectOption, Table, TableId, WorkspaceId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{now_rfc3339, parse_rfc3339, table_exists, table_has_column};

pub(crate) fn data_table(table_id: TableId) -> String {
    format!("tbl_{table_id}")
}

pub(crate) fn relation_table(relation_id: FieldId) -> String {
    format!("rel_{relation_id}")
}

pub(crate) fn field_column(field_id: FieldId) -> String {
    format!("field_{field_id}")
}

pub(crate) fn insert_table(conn: &Connection, workspace_id: WorkspaceId, name: &str) -> Result<Table> {
    let name = normalize_name("table", name)?;
    let created_at = now_rfc3339()?;
    conn.execute(
        "INSERT INTO workspace_tables(workspace_id, name, created_at) VALUES (?1, ?2, ?3)",
        params![workspace_id.0, name, created_at],
    )
    .context("failed to insert table metadata")?;
    let id = TableId(conn.last_insert_rowid());

    conn.execute_batch(&format!(
        "CREATE TABLE {} (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        data_table(id)
    ))
    .with_context(|| format!("failed to create storage table for table {id}"))?;

    Ok(Table { id, workspace_id, name, created_at: parse_rfc3339(&created_at)? })
}

pub(crate) fn load_table(conn: &Connection, table_id: TableId) -> Result<Option<Table>> {
    let raw = conn
        .query_row(
            "SELECT workspace_id, name, created_at FROM workspace_tables WHERE id = ?1",
            params![table_id.0],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()
        .with_context(|| format!("failed to load table {table_id}"))?;

    raw.map(|(workspace_id, name, created_at)| {
        Ok(Table {
            id: table_id,
            workspace_id: WorkspaceId(workspace_id),
            name,
            created_at: parse_rfc3339(&created_at)?,
        })
    })
    .transpose()
}

/// Resolve a table that must exist for a new action.
pub(crate) fn existing_table(conn: &Connection, table_id: TableId) -> Result<Table> {
    load_table(conn, table_id)?
        .ok_or_else(|| EngineError::Validation(format!("table {table_id} does not exist")).into())
}

/// Resolve the container of an undo/redo; a missing table means it was permanently deleted.
pub(crate) fn require_table(conn: &Connection, table_id: TableId) -> Result<Table> {
    load_table(conn, table_id)?.ok_or_else(|| {
        EngineError::TargetUnrecoverable(format!("table {table_id} was permanently deleted"))
            .into()
    })
}

pub(crate) fn list_tables(conn: &Connection, workspace_id: Option<WorkspaceId>) -> Result<Vec<Table>> {
    let mut stmt = conn.prepare(
        "SELECT id, workspace_id, name, created_at FROM workspace_tables
         WHERE ?1 IS NULL OR workspace_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![workspace_id.map(|id| id.0)], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut tables = Vec::new();
    for row in rows {
        let (id, workspace_id, name, created_at) = row?;
        tables.push(Table {
            id: TableId(id),
            workspace_id: WorkspaceId(workspace_id),
            name,
            created_at: parse_rfc3339(&created_at)?,
        });
    }
    Ok(tables)
}

pub(crate) fn rename_table(conn: &Connection, table_id: TableId, name: &str) -> Result<()> {
    conn.execute("UPDATE workspace_tables SET name = ?1 WHERE id = ?2", params![name, table_id.0])
        .with_context(|| format!("failed to rename table {table_id}"))?;
    Ok(())
}

/// Permanently delete a table with its storage, its fields and every relationship it takes part in.
pub(crate) fn purge_table(conn: &Connection, table_id: TableId) -> Result<bool> {
    if load_table(conn, table_id)?.is_none() {
        return Ok(false);
    }

    for field in list_fields(conn, table_id, true)? {
        if let FieldConfig::LinkRow { related_field_id, relation_id, .. } = &field.config {
            if let Some(relation_id) = relation_id {
                drop_relation_table(conn, *relation_id)?;
            }
            if let Some(related_field_id) = related_field_id {
                delete_field_row(conn, *related_field_id)?;
            }
        }
        delete_field_row(conn, field.id)?;
    }

    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", data_table(table_id)))
        .with_context(|| format!("failed to drop storage table for table {table_id}"))?;
    conn.execute("DELETE FROM workspace_tables WHERE id = ?1", params![table_id.0])
        .with_context(|| format!("failed to delete table {table_id}"))?;
    Ok(true)
}

fn stored_config(config: &FieldConfig) -> FieldConfig {
    match config {
        FieldConfig::SingleSelect { .. } => FieldConfig::SingleSelect { options: Vec::new() },
        other => other.clone(),
    }
}

fn decode_field(
    conn: &Connection,
    id: i64,
    table_id: i64,
    name: String,
    position: i64,
    config_json: &str,
    trashed: bool,
) -> Result<Field> {
    let mut config: FieldConfig = serde_json::from_str(config_json)
        .with_context(|| format!("invalid config_json for field {id}"))?;
    if let FieldConfig::SingleSelect { options } = &mut config {
        *options = load_options(conn, FieldId(id))?;
    }
    Ok(Field { id: FieldId(id), table_id: TableId(table_id), name, position, config, trashed })
}

pub(crate) fn load_field(conn: &Connection, field_id: FieldId) -> Result<Option<Field>> {
    let raw = conn
        .query_row(
            "SELECT table_id, name, position, config_json, trashed FROM fields WHERE id = ?1",
            params![field_id.0],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("failed to load field {field_id}"))?;

    raw.map(|(table_id, name, position, config_json, trashed)| {
        decode_field(conn, field_id.0, table_id, name, position, &config_json, trashed)
    })
    .transpose()
}

/// Resolve a live field for a new action.
pub(crate) fn existing_field(conn: &Connection, field_id: FieldId) -> Result<Field> {
    match load_field(conn, field_id)? {
        Some(field) if !field.trashed => Ok(field),
        _ => Err(EngineError::Validation(format!("field {field_id} does not exist")).into()),
    }
}

/// Resolve a field for undo/redo. Trashed fields are still valid targets.
pub(crate) fn require_field(conn: &Connection, field_id: FieldId) -> Result<Field> {
    load_field(conn, field_id)?.ok_or_else(|| {
        EngineError::TargetUnrecoverable(format!("field {field_id} no longer exists")).into()
    })
}

pub(crate) fn list_fields(
    conn: &Connection,
    table_id: TableId,
    include_trashed: bool,
) -> Result<Vec<Field>> {
    let raw = {
        let mut stmt = conn.prepare(
            "SELECT id, name, position, config_json, trashed FROM fields
             WHERE table_id = ?1 AND (?2 = 1 OR trashed = 0)
             ORDER BY position ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![table_id.0, include_trashed], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    raw.into_iter()
        .map(|(id, name, position, config_json, trashed)| {
            decode_field(conn, id, table_id.0, name, position, &config_json, trashed)
        })
        .collect()
}

pub(crate) fn field_name_taken(
    conn: &Connection,
    table_id: TableId,
    name: &str,
    except: Option<FieldId>,
) -> Result<bool> {
    let taken = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM fields
                WHERE table_id = ?1 AND name = ?2 AND trashed = 0 AND (?3 IS NULL OR id != ?3)
             )",
            params![table_id.0, name, except.map(|id| id.0)],
            |row| row.get::<_, bool>(0),
        )
        .with_context(|| format!("failed to check field name in table {table_id}"))?;
    Ok(taken)
}

pub(crate) fn field_exists(conn: &Connection, field_id: FieldId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM fields WHERE id = ?1)",
            params![field_id.0],
            |row| row.get::<_, bool>(0),
        )
        .with_context(|| format!("failed to check if field exists: {field_id}"))?;
    Ok(exists)
}

/// Insert a field row. An explicit id restores a field under the identity it had before.
pub(crate) fn insert_field_row(
    conn: &Connection,
    id: Option<FieldId>,
    table_id: TableId,
    name: &str,
    position: Option<i64>,
    config: &FieldConfig,
) -> Result<FieldId> {
    let position = match position {
        Some(position) => position,
        None => conn
            .query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM fields WHERE table_id = ?1",
                params![table_id.0],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to compute field position")?,
    };
    let config_json =
        serde_json::to_string(&stored_config(config)).context("failed to serialize field config")?;

    conn.execute(
        "INSERT INTO fields(id, table_id, name, position, field_type, config_json, trashed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            id.map(|id| id.0),
            table_id.0,
            name,
            position,
            config.field_type().as_str(),
            config_json
        ],
    )
    .with_context(|| format!("failed to insert field {name} into table {table_id}"))?;

    Ok(FieldId(conn.last_insert_rowid()))
}

/// Persist name, configuration and trash state of an existing field row.
pub(crate) fn write_field(conn: &Connection, field: &Field) -> Result<()> {
    let config_json = serde_json::to_string(&stored_config(&field.config))
        .context("failed to serialize field config")?;
    conn.execute(
        "UPDATE fields SET name = ?1, field_type = ?2, config_json = ?3, trashed = ?4 WHERE id = ?5",
        params![
            field.name,
            field.config.field_type().as_str(),
            config_json,
            field.trashed,
            field.id.0
        ],
    )
    .with_context(|| format!("failed to update field {}", field.id))?;
    Ok(())
}

pub(crate) fn rename_field(conn: &Connection, field_id: FieldId, name: &str) -> Result<()> {
    conn.execute("UPDATE fields SET name = ?1 WHERE id = ?2", params![name, field_id.0])
        .with_context(|| format!("failed to rename field {field_id}"))?;
    Ok(())
}

pub(crate) fn set_trashed(conn: &Connection, field_id: FieldId, trashed: bool) -> Result<()> {
    conn.execute("UPDATE fields SET trashed = ?1 WHERE id = ?2", params![trashed, field_id.0])
        .with_context(|| format!("failed to update trash state of field {field_id}"))?;
    Ok(())
}

pub(crate) fn delete_field_row(conn: &Connection, field_id: FieldId) -> Result<()> {
    delete_options(conn, field_id)?;
    conn.execute("DELETE FROM fields WHERE id = ?1", params![field_id.0])
        .with_context(|| format!("failed to delete field {field_id}"))?;
    Ok(())
}

pub(crate) fn load_options(conn: &Connection, field_id: FieldId) -> Result<Vec<SelectOption>> {
    let mut stmt = conn.prepare(
        "SELECT id, value, color FROM field_select_options
         WHERE field_id = ?1 ORDER BY position ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![field_id.0], |row| {
        Ok(SelectOption { id: Some(row.get(0)?), value: row.get(1)?, color: row.get(2)? })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to load select options of field {field_id}"))
}

pub(crate) fn delete_options(conn: &Connection, field_id: FieldId) -> Result<()> {
    conn.execute("DELETE FROM field_select_options WHERE field_id = ?1", params![field_id.0])
        .with_context(|| format!("failed to delete select options of field {field_id}"))?;
    Ok(())
}

/// Replace the option set of a field. Options that carry an id keep it; new ones get a fresh id.
pub(crate) fn replace_options(
    conn: &Connection,
    field_id: FieldId,
    options: &[SelectOption],
) -> Result<Vec<SelectOption>> {
    delete_options(conn, field_id)?;

    let mut stored = Vec::with_capacity(options.len());
    for (position, option) in (0_i64..).zip(options) {
        conn.execute(
            "INSERT INTO field_select_options(id, field_id, value, color, position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![option.id, field_id.0, option.value, option.color, position],
        )
        .with_context(|| format!("failed to insert select option {} of field {field_id}", option.value))?;
        stored.push(SelectOption {
            id: Some(conn.last_insert_rowid()),
            value: option.value.clone(),
            color: option.color.clone(),
        });
    }
    Ok(stored)
}

pub(crate) fn add_column(
    conn: &Connection,
    table_id: TableId,
    field_id: FieldId,
    config: &FieldConfig,
) -> Result<()> {
    let Some(column_type) = config.column_type() else {
        return Err(anyhow!("field {field_id} has no column storage"));
    };
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN \"{}\" {column_type}",
        data_table(table_id),
        field_column(field_id)
    ))
    .with_context(|| format!("failed to add column for field {field_id}"))?;
    Ok(())
}

pub(crate) fn rename_column(conn: &Connection, table_id: TableId, from: &str, to: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME COLUMN \"{from}\" TO \"{to}\"",
        data_table(table_id)
    ))
    .with_context(|| format!("failed to rename column {from} to {to} in table {table_id}"))?;
    Ok(())
}

pub(crate) fn drop_column_if_exists(conn: &Connection, table_id: TableId, column: &str) -> Result<bool> {
    let table = data_table(table_id);
    if !table_has_column(conn, &table, column)? {
        return Ok(false);
    }
    conn.execute_batch(&format!("ALTER TABLE {table} DROP COLUMN \"{column}\""))
        .with_context(|| format!("failed to drop column {column} from {table}"))?;
    Ok(true)
}

pub(crate) fn row_ids(conn: &Connection, table_id: TableId) -> Result<Vec<RowId>> {
    let mut stmt = conn.prepare(&format!("SELECT id FROM {} ORDER BY id ASC", data_table(table_id)))?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0).map(RowId))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to list rows of table {table_id}"))
}

pub(crate) fn row_exists(conn: &Connection, table_id: TableId, row_id: RowId) -> Result<bool> {
    let exists = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", data_table(table_id)),
            params![row_id.0],
            |row| row.get::<_, bool>(0),
        )
        .with_context(|| format!("failed to check row {row_id} in table {table_id}"))?;
    Ok(exists)
}

pub(crate) fn insert_row(conn: &Connection, table_id: TableId) -> Result<RowId> {
    conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", data_table(table_id)), [])
        .with_context(|| format!("failed to insert row into table {table_id}"))?;
    Ok(RowId(conn.last_insert_rowid()))
}

#[allow(clippy::cast_precision_loss)]
fn decode_cell(value: ValueRef<'_>, field_type: FieldType) -> CellValue {
    match (value, field_type) {
        (ValueRef::Null, FieldType::Boolean) => CellValue::Boolean(false),
        (ValueRef::Null, _) => CellValue::Null,
        (ValueRef::Integer(raw), FieldType::Boolean) => CellValue::Boolean(raw != 0),
        (ValueRef::Integer(raw), _) => CellValue::Number(raw as f64),
        (ValueRef::Real(raw), _) => CellValue::Number(raw),
        (ValueRef::Text(raw) | ValueRef::Blob(raw), _) => {
            CellValue::Text(String::from_utf8_lossy(raw).into_owned())
        }
    }
}

fn encode_cell(value: &CellValue, field_type: FieldType) -> Value {
    match (value, field_type) {
        (CellValue::Boolean(flag), _) => Value::Integer(i64::from(*flag)),
        (cell @ CellValue::Number(_), FieldType::SingleSelect) => {
            cell.option_id().map_or(Value::Null, Value::Integer)
        }
        (CellValue::Number(number), _) => Value::Real(*number),
        (CellValue::Text(text), _) => Value::Text(text.clone()),
        (CellValue::Null | CellValue::Links(_), _) => Value::Null,
    }
}

/// Read every row's value of a physical column, decoding it the way `config` stores cells.
pub(crate) fn read_column(
    conn: &Connection,
    table_id: TableId,
    column: &str,
    config: &FieldConfig,
) -> Result<Vec<(RowId, CellValue)>> {
    let field_type = config.field_type();
    let mut stmt = conn
        .prepare(&format!("SELECT id, \"{column}\" FROM {} ORDER BY id ASC", data_table(table_id)))
        .with_context(|| format!("failed to read column {column} of table {table_id}"))?;
    let mut rows = stmt.query([])?;
    let mut cells = Vec::new();
    while let Some(row) = rows.next()? {
        cells.push((RowId(row.get(0)?), decode_cell(row.get_ref(1)?, field_type)));
    }
    Ok(cells)
}

pub(crate) fn write_column_cell(
    conn: &Connection,
    table_id: TableId,
    field_id: FieldId,
    config: &FieldConfig,
    row_id: RowId,
    value: &CellValue,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET \"{}\" = ?1 WHERE id = ?2",
            data_table(table_id),
            field_column(field_id)
        ),
        params![encode_cell(value, config.field_type()), row_id.0],
    )
    .with_context(|| format!("failed to write field {field_id} of row {row_id}"))?;
    Ok(())
}

pub(crate) fn copy_column(conn: &Connection, table_id: TableId, from: &str, to: &str) -> Result<()> {
    conn.execute(&format!("UPDATE {} SET \"{to}\" = \"{from}\"", data_table(table_id)), [])
        .with_context(|| format!("failed to copy column {from} into {to}"))?;
    Ok(())
}

pub(crate) fn create_relation_table(conn: &Connection, relation_id: FieldId) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           source_row_id INTEGER NOT NULL,
           target_row_id INTEGER NOT NULL,
           UNIQUE(source_row_id, target_row_id)
         )",
        relation_table(relation_id)
    ))
    .with_context(|| format!("failed to create relation table for relation {relation_id}"))?;
    Ok(())
}

pub(crate) fn drop_relation_table(conn: &Connection, relation_id: FieldId) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", relation_table(relation_id)))
        .with_context(|| format!("failed to drop relation table for relation {relation_id}"))?;
    Ok(())
}

/// Relation table of a link field and whether the field reads it from the source side.
fn link_storage(field: &Field) -> Result<(FieldId, bool)> {
    match &field.config {
        FieldConfig::LinkRow { relation_id: Some(relation_id), .. } => {
            Ok((*relation_id, *relation_id == field.id))
        }
        _ => Err(anyhow!("field {} has no relation storage", field.id)),
    }
}

pub(crate) fn read_links(conn: &Connection, field: &Field) -> Result<BTreeMap<RowId, Vec<RowId>>> {
    let (relation_id, forward) = link_storage(field)?;
    let table = relation_table(relation_id);
    if !table_exists(conn, &table)? {
        return Ok(BTreeMap::new());
    }

    let (own, other) =
        if forward { ("source_row_id", "target_row_id") } else { ("target_row_id", "source_row_id") };
    let mut stmt = conn.prepare(&format!("SELECT {own}, {other} FROM {table} ORDER BY {own}, {other}"))?;
    let rows = stmt.query_map([], |row| Ok((RowId(row.get(0)?), RowId(row.get(1)?))))?;

    let mut links: BTreeMap<RowId, Vec<RowId>> = BTreeMap::new();
    for row in rows {
        let (own_row, other_row) = row?;
        links.entry(own_row).or_default().push(other_row);
    }
    Ok(links)
}

pub(crate) fn set_links(conn: &Connection, field: &Field, row_id: RowId, targets: &[RowId]) -> Result<()> {
    let (relation_id, forward) = link_storage(field)?;
    let table = relation_table(relation_id);
    let (own, other) =
        if forward { ("source_row_id", "target_row_id") } else { ("target_row_id", "source_row_id") };

    conn.execute(&format!("DELETE FROM {table} WHERE {own} = ?1"), params![row_id.0])
        .with_context(|| format!("failed to clear links of row {row_id} in {table}"))?;
    for target in targets {
        conn.execute(
            &format!("INSERT OR IGNORE INTO {table}({own}, {other}) VALUES (?1, ?2)"),
            params![row_id.0, target.0],
        )
        .with_context(|| format!("failed to link row {row_id} to row {target} in {table}"))?;
    }
    Ok(())
}

/// Name for the reverse field of a new link: the source table name or its next free variant.
fn related_field_name(conn: &Connection, table_id: TableId, base: &str) -> Result<String> {
    if !field_name_taken(conn, table_id, base, None)? {
        return Ok(base.to_string());
    }
    let mut counter = 2_u32;
    loop {
        let candidate = format!("{base} {counter}");
        if !field_name_taken(conn, table_id, &candidate, None)? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

/// Create the relation storage of link field `field_id` in `table` together with the reverse
/// field in `target`. `related_hint` reuses a previously assigned reverse field id when free.
pub(crate) fn create_link(
    conn: &Connection,
    table: &Table,
    field_id: FieldId,
    target: &Table,
    related_hint: Option<FieldId>,
) -> Result<FieldConfig> {
    if target.id == table.id {
        return Err(EngineError::Validation("link_row fields MUST target another table".to_string()).into());
    }

    create_relation_table(conn, field_id)?;

    let related_id = match related_hint {
        Some(id) if !field_exists(conn, id)? => Some(id),
        _ => None,
    };
    let name = related_field_name(conn, target.id, &table.name)?;
    let related_config = FieldConfig::LinkRow {
        link_row_table_id: table.id,
        related_field_id: Some(field_id),
        relation_id: Some(field_id),
    };
    let related_id = insert_field_row(conn, related_id, target.id, &name, None, &related_config)?;

    Ok(FieldConfig::LinkRow {
        link_row_table_id: target.id,
        related_field_id: Some(related_id),
        relation_id: Some(field_id),
    })
}

/// Validate a cell for `field` and bring it into the canonical stored form.
pub(crate) fn coerce_cell(conn: &Connection, field: &Field, value: &CellValue) -> Result<CellValue> {
    let mismatch = || -> anyhow::Error {
        EngineError::Validation(format!(
            "value {value:?} is not valid for {} field {}",
            field.config.field_type().as_str(),
            field.id
        ))
        .into()
    };

    match (&field.config, value) {
        (FieldConfig::LinkRow { link_row_table_id, .. }, CellValue::Links(rows)) => {
            for row_id in rows {
                if !row_exists(conn, *link_row_table_id, *row_id)? {
                    return Err(EngineError::Validation(format!(
                        "row {row_id} does not exist in table {link_row_table_id}"
                    ))
                    .into());
                }
            }
            let mut rows = rows.clone();
            rows.sort_unstable();
            rows.dedup();
            Ok(CellValue::Links(rows))
        }
        (FieldConfig::LinkRow { .. }, CellValue::Null) => Ok(CellValue::Links(Vec::new())),
        (FieldConfig::LinkRow { .. }, _) => Err(mismatch()),
        (FieldConfig::Boolean, CellValue::Null) => Ok(CellValue::Boolean(false)),
        (_, CellValue::Null)
        | (FieldConfig::Text, CellValue::Text(_))
        | (FieldConfig::Boolean, CellValue::Boolean(_)) => Ok(value.clone()),
        (FieldConfig::Number { .. }, CellValue::Number(_)) => {
            Ok(action_kernel_core::convert_cell(value, &field.config, &field.config))
        }
        (FieldConfig::SingleSelect { options }, cell @ CellValue::Number(_)) => {
            let id = cell.option_id().ok_or_else(mismatch)?;
            if options.iter().any(|option| option.id == Some(id)) {
                Ok(CellValue::from_option_id(id))
            } else {
                Err(EngineError::Validation(format!(
                    "select option {id} does not belong to field {}",
                    field.id
                ))
                .into())
            }
        }
        _ => Err(mismatch()),
    }
}

/// Current value of one cell in stored form.
pub(crate) fn read_cell(conn: &Connection, field: &Field, row_id: RowId) -> Result<CellValue> {
    if matches!(field.config, FieldConfig::LinkRow { .. }) {
        let mut links = read_links(conn, field)?;
        return Ok(CellValue::Links(links.remove(&row_id).unwrap_or_default()));
    }

    let raw = conn
        .query_row(
            &format!(
                "SELECT \"{}\" FROM {} WHERE id = ?1",
                field_column(field.id),
                data_table(field.table_id)
            ),
            params![row_id.0],
            |row| Ok(decode_cell(row.get_ref(0)?, field.config.field_type())),
        )
        .optional()
        .with_context(|| format!("failed to read field {} of row {row_id}", field.id))?;
    raw.ok_or_else(|| anyhow!("row {row_id} does not exist in table {}", field.table_id))
}

/// Write an already coerced cell.
pub(crate) fn write_cell(conn: &Connection, field: &Field, row_id: RowId, value: &CellValue) -> Result<()> {
    match (&field.config, value) {
        (FieldConfig::LinkRow { .. }, CellValue::Links(targets)) => {
            set_links(conn, field, row_id, targets)
        }
        (FieldConfig::LinkRow { .. }, _) => set_links(conn, field, row_id, &[]),
        (config, value) => {
            write_column_cell(conn, field.table_id, field.id, config, row_id, value)
        }
    }
}

pub(crate) fn list_rows(conn: &Connection, table_id: TableId) -> Result<Vec<Row>> {
    existing_table(conn, table_id)?;
    let fields = list_fields(conn, table_id, false)?;

    let mut rows = row_ids(conn, table_id)?
        .into_iter()
        .map(|id| (id, BTreeMap::new()))
        .collect::<BTreeMap<RowId, BTreeMap<FieldId, CellValue>>>();

    for field in &fields {
        if matches!(field.config, FieldConfig::LinkRow { .. }) {
            let mut links = read_links(conn, field)?;
            for (row_id, values) in &mut rows {
                values.insert(field.id, CellValue::Links(links.remove(row_id).unwrap_or_default()));
            }
        } else {
            for (row_id, value) in read_column(conn, table_id, &field_column(field.id), &field.config)? {
                if let Some(values) = rows.get_mut(&row_id) {
                    values.insert(field.id, value);
                }
            }
        }
    }

    Ok(rows.into_iter().map(|(id, values)| Row { id, values }).collect())
}
