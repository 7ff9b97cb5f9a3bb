use action_kernel_core::{
    normalize_name, ActionKind, ActionParams, ActionRecord, ActionRequest, ActionScope, ActorId,
    UpdateTableParams,
};
use anyhow::Result;
use rusqlite::Connection;

use super::{params_mismatch, request_mismatch, ActionHandler, Performed};
use crate::schema;

/// Table renames. Table names are not unique within a workspace, so restores never collide.
pub(crate) struct UpdateTableHandler;

impl ActionHandler for UpdateTableHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::UpdateTable
    }

    fn perform(&self, conn: &Connection, _actor: ActorId, request: ActionRequest) -> Result<Performed> {
        let request = match request {
            ActionRequest::UpdateTable(request) => request,
            other => return Err(request_mismatch(self.kind(), other.kind())),
        };

        let table = schema::existing_table(conn, request.table_id)?;
        let name = normalize_name("table", &request.name)?;
        schema::rename_table(conn, table.id, &name)?;

        Ok(Performed {
            scope: ActionScope::Workspace(table.workspace_id),
            params: ActionParams::UpdateTable(UpdateTableParams {
                workspace_id: table.workspace_id,
                table_id: table.id,
                previous_name: table.name,
                name,
            }),
            backup_data: None,
        })
    }

    fn undo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        let ActionParams::UpdateTable(params) = &record.params else {
            return Err(params_mismatch(self.kind(), record));
        };
        schema::require_table(conn, params.table_id)?;
        schema::rename_table(conn, params.table_id, &params.previous_name)
    }

    fn redo(&self, conn: &Connection, _actor: ActorId, record: &ActionRecord) -> Result<()> {
        let ActionParams::UpdateTable(params) = &record.params else {
            return Err(params_mismatch(self.kind(), record));
        };
        schema::require_table(conn, params.table_id)?;
        schema::rename_table(conn, params.table_id, &params.name)
    }
}
