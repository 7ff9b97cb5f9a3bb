use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use action_kernel_core::{
    resolve_restore_name, ActionKind, ActionParams, ActionRecord, ActionRequest, ActionScope,
    ActorId, BackupData, EngineError, Field, RestoreDirection, ResolvedName,
};
use anyhow::Result;
use rusqlite::Connection;

use crate::backup;
use crate::schema;

mod field_lifecycle;
mod update_field;
mod update_row;
mod update_table;

pub(crate) use field_lifecycle::{CreateFieldHandler, DeleteFieldHandler};
pub(crate) use update_field::UpdateFieldHandler;
pub(crate) use update_row::UpdateRowHandler;
pub(crate) use update_table::UpdateTableHandler;

/// Result of a handler's `perform`: everything the orchestrator persists besides identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Performed {
    pub scope: ActionScope,
    pub params: ActionParams,
    pub backup_data: Option<BackupData>,
}

/// One reversible operation kind.
///
/// Every method runs inside the orchestrator's transaction; returning an error rolls back the
/// data mutation together with the history change.
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Validate `request` against the live schema, apply it and describe how to reverse it.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] before any mutation when the request is invalid.
    fn perform(&self, conn: &Connection, actor: ActorId, request: ActionRequest) -> Result<Performed>;

    /// Restore the state captured in the record's params and backup.
    ///
    /// # Errors
    /// Returns [`EngineError::TargetUnrecoverable`] when the containing table is gone.
    fn undo(&self, conn: &Connection, actor: ActorId, record: &ActionRecord) -> Result<()>;

    /// Re-apply the forward change recorded in the params. Never reads the backup.
    ///
    /// # Errors
    /// Returns [`EngineError::TargetUnrecoverable`] when the containing table is gone.
    fn redo(&self, conn: &Connection, actor: ActorId, record: &ActionRecord) -> Result<()>;

    /// Release the record's backup artifact. Idempotent and silent.
    fn cleanup(&self, conn: &Connection, record: &ActionRecord) {
        if let Some(backup_data) = &record.backup_data {
            backup::release(conn, backup_data);
        }
    }
}

/// Kind to handler map built once at startup and shared by reference.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<ActionKind, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(UpdateFieldHandler));
        registry.register(Box::new(CreateFieldHandler));
        registry.register(Box::new(DeleteFieldHandler));
        registry.register(Box::new(UpdateTableHandler));
        registry.register(Box::new(UpdateRowHandler));
        registry
    }

    /// Register a handler, replacing and returning any handler of the same kind.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) -> Option<Box<dyn ActionHandler>> {
        self.handlers.insert(handler.kind(), handler)
    }

    /// # Errors
    /// Returns [`EngineError::UnknownKind`] when no handler is registered for `kind`.
    pub fn handler(&self, kind: ActionKind) -> Result<&dyn ActionHandler, EngineError> {
        self.handlers
            .get(&kind)
            .map(|handler| &**handler)
            .ok_or_else(|| EngineError::UnknownKind(kind.as_str().to_string()))
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.handlers.keys().copied().collect()
    }
}

impl Debug for ActionRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry").field("kinds", &self.kinds()).finish()
    }
}

pub(crate) fn request_mismatch(expected: ActionKind, actual: ActionKind) -> anyhow::Error {
    EngineError::PayloadMismatch(format!("{expected} handler received a {actual} request")).into()
}

pub(crate) fn params_mismatch(expected: ActionKind, record: &ActionRecord) -> anyhow::Error {
    EngineError::PayloadMismatch(format!(
        "{expected} handler received action {} with {} params",
        record.id,
        record.params.kind()
    ))
    .into()
}

/// Name `field` should carry when it goes back to `desired`, suffixed once on collision.
pub(crate) fn restore_field_name(
    conn: &Connection,
    field: &Field,
    desired: &str,
    direction: RestoreDirection,
) -> Result<String> {
    if field.name == desired && !field.trashed {
        return Ok(desired.to_string());
    }

    let resolved = resolve_restore_name(desired, direction, |candidate| {
        schema::field_name_taken(conn, field.table_id, candidate, Some(field.id))
    })?;
    if let ResolvedName::Renamed(name) = &resolved {
        tracing::warn!(
            field_id = field.id.0,
            table_id = field.table_id.0,
            desired,
            restored = %name,
            "field name already in use; restored under a suffixed name"
        );
    }
    Ok(resolved.into_name())
}
