use std::collections::BTreeMap;

use action_kernel_core::{
    ActionKind, ActionParams, ActionRecord, ActionRequest, ActionScope, ActorId, CellValue,
    EngineError, FieldConfig, FieldId, RowId, Table, UpdateRowParams,
};
use anyhow::Result;
use rusqlite::Connection;

use super::{params_mismatch, request_mismatch, ActionHandler, Performed};
use crate::{live_field_in_table, row_must_exist, schema};

/// Cell edits on one row. Params keep the previous and new value of every touched field.
pub(crate) struct UpdateRowHandler;

impl ActionHandler for UpdateRowHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::UpdateRow
    }

    fn perform(&self, conn: &Connection, _actor: ActorId, request: ActionRequest) -> Result<Performed> {
        let request = match request {
            ActionRequest::UpdateRow(request) => request,
            other => return Err(request_mismatch(self.kind(), other.kind())),
        };
        if request.values.is_empty() {
            return Err(
                EngineError::Validation("row update MUST set at least one value".to_string()).into()
            );
        }

        let table = schema::existing_table(conn, request.table_id)?;
        row_must_exist(conn, table.id, request.row_id)?;

        let mut fields = Vec::with_capacity(request.values.len());
        for (field_id, value) in &request.values {
            let field = live_field_in_table(conn, *field_id, table.id)?;
            let value = schema::coerce_cell(conn, &field, value)?;
            fields.push((field, value));
        }

        let mut previous_values = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (field, value) in fields {
            previous_values.insert(field.id, schema::read_cell(conn, &field, request.row_id)?);
            schema::write_cell(conn, &field, request.row_id, &value)?;
            values.insert(field.id, value);
        }

        Ok(Performed {
            scope: ActionScope::Table(table.id),
            params: ActionParams::UpdateRow(UpdateRowParams {
                table_id: table.id,
                row_id: request.row_id,
                previous_values,
                values,
            }),
            backup_data: None,
        })
    }

    fn undo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        let ActionParams::UpdateRow(params) = &record.params else {
            return Err(params_mismatch(self.kind(), record));
        };
        let table = schema::require_table(conn, params.table_id)?;
        apply_values(conn, &table, params.row_id, &params.previous_values)
    }

    fn redo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        let ActionParams::UpdateRow(params) = &record.params else {
            return Err(params_mismatch(self.kind(), record));
        };
        let table = schema::require_table(conn, params.table_id)?;
        apply_values(conn, &table, params.row_id, &params.values)
    }
}

/// Write recorded values back. Fields that were deleted or changed type since are skipped.
fn apply_values(
    conn: &Connection,
    table: &Table,
    row_id: RowId,
    values: &BTreeMap<FieldId, CellValue>,
) -> Result<()> {
    if !schema::row_exists(conn, table.id, row_id)? {
        return Err(EngineError::TargetUnrecoverable(format!(
            "row {row_id} no longer exists in table {}",
            table.id
        ))
        .into());
    }

    for (field_id, value) in values {
        let Some(field) = schema::load_field(conn, *field_id)?.filter(|field| field.table_id == table.id)
        else {
            tracing::debug!(field_id = field_id.0, row_id = row_id.0, "field is gone; value skipped");
            continue;
        };

        let value = match (&field.config, value) {
            (FieldConfig::LinkRow { link_row_table_id, .. }, CellValue::Links(rows)) => {
                let mut surviving = Vec::with_capacity(rows.len());
                for linked in rows {
                    if schema::row_exists(conn, *link_row_table_id, *linked)? {
                        surviving.push(*linked);
                    }
                }
                CellValue::Links(surviving)
            }
            _ => value.clone(),
        };

        match schema::coerce_cell(conn, &field, &value) {
            Ok(value) => schema::write_cell(conn, &field, row_id, &value)?,
            Err(err) if err.downcast_ref::<EngineError>().is_some() => {
                tracing::warn!(
                    field_id = field_id.0,
                    row_id = row_id.0,
                    error = %err,
                    "recorded value no longer fits the field; value skipped"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
