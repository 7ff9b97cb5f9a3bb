use action_kernel_core::{
    convert_cell, normalize_name, requires_backup, ActionKind, ActionParams, ActionRecord,
    ActionRequest, ActionScope, ActorId, BackupData, CellValue, EngineError, Field, FieldConfig,
    FieldUpdate, RestoreDirection, RowId, Table, UpdateFieldParams,
};
use anyhow::{anyhow, Result};
use rusqlite::Connection;

use super::{params_mismatch, request_mismatch, restore_field_name, ActionHandler, Performed};
use crate::backup;
use crate::schema;

/// Renames and reconfigures fields. Representation changes keep a shadow column or a shadow
/// relation table so undo can bring the old cells back.
pub(crate) struct UpdateFieldHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preserve {
    /// Keep the old representation as a backup artifact.
    Backup,
    /// Rebuild in place and throw the old representation away.
    Discard,
}

struct Conversion {
    config: FieldConfig,
    backup: Option<BackupData>,
    removed_related: Option<Field>,
}

impl ActionHandler for UpdateFieldHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::UpdateField
    }

    fn perform(&self, conn: &Connection, _actor: ActorId, request: ActionRequest) -> Result<Performed> {
        let request = match request {
            ActionRequest::UpdateField(request) => request,
            other => return Err(request_mismatch(self.kind(), other.kind())),
        };
        if request.update.is_empty() {
            return Err(EngineError::Validation(
                "field update MUST change the name or the configuration".to_string(),
            )
            .into());
        }

        let field = schema::existing_field(conn, request.field_id)?;
        let table = schema::existing_table(conn, field.table_id)?;

        let name = match &request.update.name {
            Some(name) => normalize_name("field", name)?,
            None => field.name.clone(),
        };
        if name != field.name && schema::field_name_taken(conn, table.id, &name, Some(field.id))? {
            return Err(EngineError::Validation(format!(
                "a field named `{name}` already exists in table {}",
                table.id
            ))
            .into());
        }

        let config = match &request.update.config {
            Some(config) => {
                config.validate()?;
                validate_option_ids(&field, config)?;
                config.clone()
            }
            None => field.config.clone(),
        };

        let mut applied = field.clone();
        applied.name = name;
        let mut backup_data = None;
        let mut previous_related = None;

        if requires_backup(&field.config, &config) {
            let conversion = convert_representation(conn, &table, &field, &config, Preserve::Backup)?;
            applied.config = conversion.config;
            backup_data = conversion.backup;
            previous_related = conversion.removed_related;
        }
        schema::write_field(conn, &applied)?;

        let update = FieldUpdate {
            name: (applied.name != field.name).then(|| applied.name.clone()),
            config: (applied.config != field.config).then(|| applied.config.clone()),
        };

        Ok(Performed {
            scope: ActionScope::Table(table.id),
            params: ActionParams::UpdateField(UpdateFieldParams {
                table_id: table.id,
                field_id: field.id,
                previous: field,
                previous_related,
                update,
            }),
            backup_data,
        })
    }

    fn undo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        let ActionParams::UpdateField(params) = &record.params else {
            return Err(params_mismatch(self.kind(), record));
        };
        let table = schema::require_table(conn, params.table_id)?;
        let current = schema::require_field(conn, params.field_id)?;

        // Only what this update touched goes back; later changes from other sessions stay.
        let mut restored = current.clone();
        if params.update.name.is_some() {
            restored.name =
                restore_field_name(conn, &current, &params.previous.name, RestoreDirection::Undo)?;
        }

        match &record.backup_data {
            Some(backup_data) => {
                teardown(conn, &table, &current)?;
                restore_previous(conn, &table, &params.previous, params.previous_related.as_ref(), backup_data)?;
                restored.config = params.previous.config.clone();
            }
            None if params.update.config.is_some()
                && requires_backup(&current.config, &params.previous.config) =>
            {
                restored.config = convert_representation(
                    conn,
                    &table,
                    &current,
                    &params.previous.config,
                    Preserve::Discard,
                )?
                .config;
            }
            None => {}
        }
        schema::write_field(conn, &restored)
    }

    fn redo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        let ActionParams::UpdateField(params) = &record.params else {
            return Err(params_mismatch(self.kind(), record));
        };
        let table = schema::require_table(conn, params.table_id)?;
        let current = schema::require_field(conn, params.field_id)?;

        let mut applied = current.clone();
        if let Some(name) = &params.update.name {
            applied.name = restore_field_name(conn, &current, name, RestoreDirection::Redo)?;
        }
        if let Some(config) = &params.update.config {
            if requires_backup(&current.config, config) {
                applied.config =
                    convert_representation(conn, &table, &current, config, Preserve::Discard)?.config;
            }
        }
        schema::write_field(conn, &applied)
    }
}

/// Options may only keep ids that already belong to the field.
fn validate_option_ids(field: &Field, next: &FieldConfig) -> Result<(), EngineError> {
    let owned = field.config.select_options();
    for id in next.select_options().iter().filter_map(|option| option.id) {
        if !owned.iter().any(|option| option.id == Some(id)) {
            return Err(EngineError::Validation(format!(
                "select option {id} does not belong to field {}",
                field.id
            )));
        }
    }
    Ok(())
}

/// Drop the relation storage of a link field and delete its reverse field.
fn detach_link(conn: &Connection, field: &Field) -> Result<Option<Field>> {
    let FieldConfig::LinkRow { related_field_id, relation_id, .. } = &field.config else {
        return Ok(None);
    };
    if let Some(relation_id) = relation_id {
        schema::drop_relation_table(conn, *relation_id)?;
    }
    let related = match related_field_id {
        Some(id) => schema::load_field(conn, *id)?,
        None => None,
    };
    if let Some(related) = &related {
        schema::delete_field_row(conn, related.id)?;
    }
    Ok(related)
}

/// Move `field` from its current storage to the one `next` describes, converting every cell.
fn convert_representation(
    conn: &Connection,
    table: &Table,
    field: &Field,
    next: &FieldConfig,
    preserve: Preserve,
) -> Result<Conversion> {
    let link_target = match next.link_target() {
        Some(target_id) if target_id == table.id => {
            return Err(
                EngineError::Validation("link_row fields MUST target another table".to_string())
                    .into(),
            );
        }
        Some(target_id) if preserve == Preserve::Backup => Some(schema::existing_table(conn, target_id)?),
        Some(target_id) => Some(schema::require_table(conn, target_id)?),
        None => None,
    };

    let mut backup_data = None;
    let mut scratch_column = None;
    let mut removed_related = None;

    let cells: Vec<(RowId, CellValue)> = if let FieldConfig::LinkRow { relation_id, .. } = &field.config {
        if let (Preserve::Backup, Some(relation_id)) = (preserve, relation_id) {
            backup_data = Some(backup::snapshot_relation(conn, *relation_id)?);
        }
        removed_related = detach_link(conn, field)?;
        schema::row_ids(conn, table.id)?.into_iter().map(|id| (id, CellValue::Null)).collect()
    } else {
        let column = match preserve {
            Preserve::Backup => backup::shadow_column_name(field.id),
            Preserve::Discard => backup::scratch_column_name(field.id),
        };
        schema::rename_column(conn, table.id, &schema::field_column(field.id), &column)?;
        let cells = schema::read_column(conn, table.id, &column, &field.config)?;
        match preserve {
            Preserve::Backup => {
                tracing::debug!(field_id = field.id.0, backup = %column, "created shadow column");
                backup_data = Some(BackupData::ShadowColumn { table_id: table.id, column });
            }
            Preserve::Discard => scratch_column = Some(column),
        }
        cells
    };

    if matches!(field.config, FieldConfig::SingleSelect { .. }) {
        schema::delete_options(conn, field.id)?;
    }

    let config = match next {
        FieldConfig::LinkRow { related_field_id, .. } => {
            let Some(target) = link_target else {
                return Err(anyhow!("link target of field {} was not resolved", field.id));
            };
            schema::create_link(conn, table, field.id, &target, *related_field_id)?
        }
        FieldConfig::SingleSelect { options } => FieldConfig::SingleSelect {
            options: schema::replace_options(conn, field.id, options)?,
        },
        other => other.clone(),
    };

    if config.column_type().is_some() {
        schema::add_column(conn, table.id, field.id, &config)?;
        for (row_id, value) in &cells {
            let converted = convert_cell(value, &field.config, &config);
            if !converted.is_null() {
                schema::write_column_cell(conn, table.id, field.id, &config, *row_id, &converted)?;
            }
        }
    }

    if let Some(column) = scratch_column {
        schema::drop_column_if_exists(conn, table.id, &column)?;
    }

    Ok(Conversion { config, backup: backup_data, removed_related })
}

/// Remove whatever storage the field uses right now.
fn teardown(conn: &Connection, table: &Table, current: &Field) -> Result<()> {
    match &current.config {
        FieldConfig::LinkRow { .. } => {
            detach_link(conn, current)?;
        }
        config => {
            schema::drop_column_if_exists(conn, table.id, &schema::field_column(current.id))?;
            if matches!(config, FieldConfig::SingleSelect { .. }) {
                schema::delete_options(conn, current.id)?;
            }
        }
    }
    Ok(())
}

fn restore_previous(
    conn: &Connection,
    table: &Table,
    previous: &Field,
    previous_related: Option<&Field>,
    backup_data: &BackupData,
) -> Result<()> {
    match (&previous.config, backup_data) {
        (
            FieldConfig::LinkRow { link_row_table_id, relation_id: Some(relation_id), .. },
            BackupData::ShadowRelation { table: backup_table, .. },
        ) => {
            let linked = schema::require_table(conn, *link_row_table_id)?;
            let (source_table, target_table) =
                if *relation_id == previous.id { (table.id, linked.id) } else { (linked.id, table.id) };
            backup::restore_relation(conn, backup_table, *relation_id, source_table, target_table)?;
            if let Some(related) = previous_related {
                restore_related_field(conn, related)?;
            }
            Ok(())
        }
        (config, BackupData::ShadowColumn { column, .. }) if config.column_type().is_some() => {
            schema::add_column(conn, table.id, previous.id, config)?;
            backup::restore_column(conn, table.id, previous.id, column)?;
            if let FieldConfig::SingleSelect { options } = config {
                schema::replace_options(conn, previous.id, options)?;
            }
            Ok(())
        }
        _ => Err(EngineError::PayloadMismatch(format!(
            "backup {} cannot restore a {} field",
            backup_data.describe(),
            previous.config.field_type().as_str()
        ))
        .into()),
    }
}

/// Re-insert the reverse field of a link under its original id.
fn restore_related_field(conn: &Connection, related: &Field) -> Result<()> {
    if schema::field_exists(conn, related.id)? {
        return Ok(());
    }
    let placeholder = Field { trashed: true, ..related.clone() };
    let name = restore_field_name(conn, &placeholder, &related.name, RestoreDirection::Undo)?;
    schema::insert_field_row(
        conn,
        Some(related.id),
        related.table_id,
        &name,
        Some(related.position),
        &related.config,
    )?;
    if related.trashed {
        schema::set_trashed(conn, related.id, true)?;
    }
    Ok(())
}
