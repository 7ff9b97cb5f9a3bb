use action_kernel_core::{
    normalize_name, ActionKind, ActionParams, ActionRecord, ActionRequest, ActionScope, ActorId,
    EngineError, Field, FieldConfig, FieldId, FieldLifecycleParams, RestoreDirection,
    SelectOption,
};
use anyhow::Result;
use rusqlite::Connection;

use super::{params_mismatch, request_mismatch, restore_field_name, ActionHandler, Performed};
use crate::schema;

pub(crate) struct CreateFieldHandler;

pub(crate) struct DeleteFieldHandler;

fn related_field_id(field: &Field) -> Option<FieldId> {
    match &field.config {
        FieldConfig::LinkRow { related_field_id, .. } => *related_field_id,
        _ => None,
    }
}

fn lifecycle_params<'a>(
    expected: ActionKind,
    record: &'a ActionRecord,
) -> Result<&'a FieldLifecycleParams> {
    match (&record.params, expected) {
        (ActionParams::CreateField(params), ActionKind::CreateField)
        | (ActionParams::DeleteField(params), ActionKind::DeleteField) => Ok(params),
        _ => Err(params_mismatch(expected, record)),
    }
}

/// Move a field, and the reverse side of a link, to the trash.
fn trash_with_related(conn: &Connection, field: &Field) -> Result<()> {
    schema::set_trashed(conn, field.id, true)?;
    if let Some(related_id) = related_field_id(field) {
        if schema::field_exists(conn, related_id)? {
            schema::set_trashed(conn, related_id, true)?;
        }
    }
    Ok(())
}

fn restore_from_trash(conn: &Connection, field: &Field, direction: RestoreDirection) -> Result<()> {
    if !field.trashed {
        return Ok(());
    }
    let name = restore_field_name(conn, field, &field.name, direction)?;
    if name != field.name {
        schema::rename_field(conn, field.id, &name)?;
    }
    schema::set_trashed(conn, field.id, false)
}

fn restore_with_related(
    conn: &Connection,
    params: &FieldLifecycleParams,
    direction: RestoreDirection,
) -> Result<()> {
    schema::require_table(conn, params.table_id)?;
    let field = schema::require_field(conn, params.field_id)?;
    restore_from_trash(conn, &field, direction)?;

    if let Some(related_id) = related_field_id(&field) {
        if let Some(related) = schema::load_field(conn, related_id)? {
            restore_from_trash(conn, &related, direction)?;
        }
    }
    Ok(())
}

fn trash_recorded_field(conn: &Connection, params: &FieldLifecycleParams) -> Result<()> {
    schema::require_table(conn, params.table_id)?;
    let field = schema::require_field(conn, params.field_id)?;
    trash_with_related(conn, &field)
}

impl ActionHandler for CreateFieldHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::CreateField
    }

    fn perform(&self, conn: &Connection, _actor: ActorId, request: ActionRequest) -> Result<Performed> {
        let request = match request {
            ActionRequest::CreateField(request) => request,
            other => return Err(request_mismatch(self.kind(), other.kind())),
        };

        let table = schema::existing_table(conn, request.table_id)?;
        let name = normalize_name("field", &request.name)?;
        if schema::field_name_taken(conn, table.id, &name, None)? {
            return Err(EngineError::Validation(format!(
                "a field named `{name}` already exists in table {}",
                table.id
            ))
            .into());
        }
        request.config.validate()?;

        let target = match request.config.link_target() {
            Some(target_id) if target_id == table.id => {
                return Err(EngineError::Validation(
                    "link_row fields MUST target another table".to_string(),
                )
                .into());
            }
            Some(target_id) => Some(schema::existing_table(conn, target_id)?),
            None => None,
        };

        let provisional = match &request.config {
            FieldConfig::SingleSelect { .. } => FieldConfig::SingleSelect { options: Vec::new() },
            FieldConfig::LinkRow { link_row_table_id, .. } => FieldConfig::link_row(*link_row_table_id),
            other => other.clone(),
        };
        let field_id = schema::insert_field_row(conn, None, table.id, &name, None, &provisional)?;

        let config = match (&request.config, &target) {
            (FieldConfig::LinkRow { .. }, Some(target)) => {
                schema::create_link(conn, &table, field_id, target, None)?
            }
            (FieldConfig::SingleSelect { options }, _) => {
                let fresh = options
                    .iter()
                    .map(|option| SelectOption { id: None, ..option.clone() })
                    .collect::<Vec<_>>();
                FieldConfig::SingleSelect { options: schema::replace_options(conn, field_id, &fresh)? }
            }
            (other, _) => other.clone(),
        };
        if config.column_type().is_some() {
            schema::add_column(conn, table.id, field_id, &config)?;
        }

        let mut field = schema::require_field(conn, field_id)?;
        field.config = config;
        schema::write_field(conn, &field)?;

        Ok(Performed {
            scope: ActionScope::Table(table.id),
            params: ActionParams::CreateField(FieldLifecycleParams {
                table_id: table.id,
                field_id,
                related_field_id: related_field_id(&field),
            }),
            backup_data: None,
        })
    }

    fn undo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        trash_recorded_field(conn, lifecycle_params(self.kind(), record)?)
    }

    fn redo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        restore_with_related(conn, lifecycle_params(self.kind(), record)?, RestoreDirection::Redo)
    }
}

impl ActionHandler for DeleteFieldHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::DeleteField
    }

    fn perform(&self, conn: &Connection, _actor: ActorId, request: ActionRequest) -> Result<Performed> {
        let request = match request {
            ActionRequest::DeleteField(request) => request,
            other => return Err(request_mismatch(self.kind(), other.kind())),
        };

        let field = schema::existing_field(conn, request.field_id)?;
        let table = schema::existing_table(conn, field.table_id)?;
        trash_with_related(conn, &field)?;

        Ok(Performed {
            scope: ActionScope::Table(table.id),
            params: ActionParams::DeleteField(FieldLifecycleParams {
                table_id: table.id,
                field_id: field.id,
                related_field_id: related_field_id(&field),
            }),
            backup_data: None,
        })
    }

    fn undo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        restore_with_related(conn, lifecycle_params(self.kind(), record)?, RestoreDirection::Undo)
    }

    fn redo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        trash_recorded_field(conn, lifecycle_params(self.kind(), record)?)
    }
}
