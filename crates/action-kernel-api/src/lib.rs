use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use action_kernel_core::{
    ActionGroupId, ActionId, ActionRecord, ActionRequest, ActionSelector, ActorId, BackupData,
    CellValue, EngineConfig, Field, FieldId, Row, SessionId, Table, TableId, WorkspaceId,
};
use action_kernel_store_sqlite::{
    ActionRegistry, CleanupSummary, IntegrityReport, PruneSummary, SchemaStatus, SqliteStore,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// One reversible action issued by a client tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformRequest {
    pub actor_id: ActorId,
    pub session_id: SessionId,
    #[serde(default)]
    pub action_group: Option<ActionGroupId>,
    pub request: ActionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryStepRequest {
    pub session_id: SessionId,
    pub selectors: Vec<ActionSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryStepResult {
    pub session_id: SessionId,
    pub changed: bool,
    pub records: Vec<ActionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupInventory {
    pub artifacts: Vec<BackupData>,
}

/// In-process entry point for the API layer and the backup scheduler.
///
/// The handler registry is built once; every call opens the database, applies pending
/// migrations and delegates to the store.
#[derive(Debug, Clone)]
pub struct ActionKernelApi {
    db_path: PathBuf,
    config: EngineConfig,
    registry: Arc<ActionRegistry>,
}

impl ActionKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            config: EngineConfig::default(),
            registry: Arc::new(ActionRegistry::with_default_handlers()),
        }
    }

    /// # Errors
    /// Returns an error when `config` does not validate.
    pub fn with_config(db_path: PathBuf, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, ..Self::new(db_path) })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_config(&self.db_path, self.config)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the integrity pragmas cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the name is invalid or persistence fails.
    pub fn create_table(&self, workspace_id: WorkspaceId, name: &str) -> Result<Table> {
        let mut store = self.open_migrated_store()?;
        store.create_table(workspace_id, name)
    }

    /// # Errors
    /// Returns an error when tables cannot be read.
    pub fn list_tables(&self, workspace_id: Option<WorkspaceId>) -> Result<Vec<Table>> {
        let store = self.open_migrated_store()?;
        store.list_tables(workspace_id)
    }

    /// Permanently delete a table, as the trash purge does. Backups pointing into it become
    /// unrecoverable.
    ///
    /// # Errors
    /// Returns an error when the purge fails.
    pub fn purge_table(&self, table_id: TableId) -> Result<bool> {
        let mut store = self.open_migrated_store()?;
        store.delete_table_permanently(table_id)
    }

    /// # Errors
    /// Returns an error when fields cannot be read.
    pub fn list_fields(&self, table_id: TableId, include_trashed: bool) -> Result<Vec<Field>> {
        let store = self.open_migrated_store()?;
        store.list_fields(table_id, include_trashed)
    }

    /// # Errors
    /// Returns an error when lookup fails or the field does not exist.
    pub fn get_field(&self, field_id: FieldId) -> Result<Field> {
        let store = self.open_migrated_store()?;
        store.get_field(field_id)?.ok_or_else(|| anyhow!("field not found: {field_id}"))
    }

    /// # Errors
    /// Returns an error when a value does not fit its field or persistence fails.
    pub fn create_row(&self, table_id: TableId, values: &BTreeMap<FieldId, CellValue>) -> Result<Row> {
        let mut store = self.open_migrated_store()?;
        store.create_row(table_id, values)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_rows(&self, table_id: TableId) -> Result<Vec<Row>> {
        let store = self.open_migrated_store()?;
        store.list_rows(table_id)
    }

    /// Perform one reversible action and persist its record.
    ///
    /// # Errors
    /// Returns an error when the request is invalid or persistence fails.
    pub fn perform(&self, input: PerformRequest) -> Result<ActionRecord> {
        let mut store = self.open_migrated_store()?;
        store.perform(
            &self.registry,
            input.actor_id,
            &input.session_id,
            input.action_group,
            input.request,
        )
    }

    /// # Errors
    /// Returns an error when the matching action cannot be undone; nothing changes then.
    pub fn undo(&self, input: HistoryStepRequest) -> Result<HistoryStepResult> {
        let mut store = self.open_migrated_store()?;
        let records = store.undo(&self.registry, &input.session_id, &input.selectors)?;
        Ok(HistoryStepResult { session_id: input.session_id, changed: !records.is_empty(), records })
    }

    /// # Errors
    /// Returns an error when the matching action cannot be redone; nothing changes then.
    pub fn redo(&self, input: HistoryStepRequest) -> Result<HistoryStepResult> {
        let mut store = self.open_migrated_store()?;
        let records = store.redo(&self.registry, &input.session_id, &input.selectors)?;
        Ok(HistoryStepResult { session_id: input.session_id, changed: !records.is_empty(), records })
    }

    /// # Errors
    /// Returns an error when history cannot be read.
    pub fn list_actions(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ActionRecord>> {
        let store = self.open_migrated_store()?;
        store.list_actions(session_id, limit)
    }

    /// # Errors
    /// Returns an error when lookup fails or the record does not exist.
    pub fn get_action(&self, action_id: ActionId) -> Result<ActionRecord> {
        let store = self.open_migrated_store()?;
        store.get_action(action_id)?.ok_or_else(|| anyhow!("action not found: {action_id}"))
    }

    /// Retention sweep entry point for the periodic scheduler.
    ///
    /// # Errors
    /// Returns an error when expired records cannot be read or deleted.
    pub fn cleanup_due_backups(&self, now: Option<OffsetDateTime>) -> Result<CleanupSummary> {
        let mut store = self.open_migrated_store()?;
        let now = now.unwrap_or_else(OffsetDateTime::now_utc);
        store.cleanup_due_backups(&self.registry, now)
    }

    /// # Errors
    /// Returns an error when the database catalog cannot be read.
    pub fn list_backup_artifacts(&self) -> Result<BackupInventory> {
        let store = self.open_migrated_store()?;
        Ok(BackupInventory { artifacts: store.list_backup_artifacts()? })
    }

    /// # Errors
    /// Returns an error when artifacts or records cannot be read.
    pub fn prune_orphaned_backups(&self) -> Result<PruneSummary> {
        let mut store = self.open_migrated_store()?;
        let summary = store.prune_orphaned_backups()?;
        tracing::debug!(
            referenced = summary.referenced,
            released = summary.released.len(),
            "prune finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use action_kernel_core::{
        ActionKind, ActionScope, CreateFieldRequest, EngineError, FieldConfig, FieldUpdate,
        UpdateFieldRequest,
    };

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("actionkernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn remove_db(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn tab() -> SessionId {
        SessionId("api-tab".to_string())
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_perform_undo_redo_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ActionKernelApi::new(db_path.clone());

        let table = api.create_table(WorkspaceId(7), "Contacts")?;
        let created = api.perform(PerformRequest {
            actor_id: ActorId(1),
            session_id: tab(),
            action_group: None,
            request: ActionRequest::CreateField(CreateFieldRequest {
                table_id: table.id,
                name: "Phone".to_string(),
                config: FieldConfig::Text,
            }),
        })?;
        assert_eq!(created.kind, ActionKind::CreateField);
        let fields = api.list_fields(table.id, false)?;
        assert_eq!(fields.len(), 1);

        let renamed = api.perform(PerformRequest {
            actor_id: ActorId(1),
            session_id: tab(),
            action_group: None,
            request: ActionRequest::UpdateField(UpdateFieldRequest {
                field_id: fields[0].id,
                update: FieldUpdate { name: Some("Mobile".to_string()), config: None },
            }),
        })?;

        let selectors = vec![ActionSelector::any_kind(ActionScope::Table(table.id))];
        let undone = api.undo(HistoryStepRequest { session_id: tab(), selectors: selectors.clone() })?;
        assert!(undone.changed);
        assert_eq!(undone.records[0].id, renamed.id);
        assert_eq!(api.get_field(fields[0].id)?.name, "Phone");

        let redone = api.redo(HistoryStepRequest { session_id: tab(), selectors })?;
        assert!(redone.changed);
        assert_eq!(api.get_field(fields[0].id)?.name, "Mobile");
        assert_eq!(api.list_actions(&tab(), 10)?.len(), 2);
        assert_eq!(api.get_action(renamed.id)?.undone_at, None);

        remove_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_retention_sweep_releases_destructive_backups() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ActionKernelApi::with_config(
            db_path.clone(),
            EngineConfig { backup_retention_minutes: 5, ..EngineConfig::default() },
        )?;

        let table = api.create_table(WorkspaceId(7), "Readings")?;
        let created = api.perform(PerformRequest {
            actor_id: ActorId(2),
            session_id: tab(),
            action_group: None,
            request: ActionRequest::CreateField(CreateFieldRequest {
                table_id: table.id,
                name: "Value".to_string(),
                config: FieldConfig::Text,
            }),
        })?;
        let field_id = match created.params {
            action_kernel_core::ActionParams::CreateField(params) => params.field_id,
            other => panic!("unexpected params: {other:?}"),
        };
        let converted = api.perform(PerformRequest {
            actor_id: ActorId(2),
            session_id: tab(),
            action_group: None,
            request: ActionRequest::UpdateField(UpdateFieldRequest {
                field_id,
                update: FieldUpdate {
                    name: None,
                    config: Some(FieldConfig::Number { decimal_places: 2 }),
                },
            }),
        })?;
        assert!(converted.backup_data.is_some());
        assert_eq!(api.list_backup_artifacts()?.artifacts.len(), 1);

        let early = api.cleanup_due_backups(None)?;
        assert_eq!(early.records_expired, 0);

        let later = OffsetDateTime::now_utc() + time::Duration::minutes(6);
        let summary = api.cleanup_due_backups(Some(later))?;
        assert_eq!(summary.records_expired, 2);
        assert_eq!(summary.backups_released, 1);
        assert!(api.list_backup_artifacts()?.artifacts.is_empty());
        assert_eq!(api.prune_orphaned_backups()?.released.len(), 0);

        remove_db(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_rejects_zero_retention_and_reports_migrations() -> Result<()> {
        let db_path = unique_temp_db_path();
        let invalid = ActionKernelApi::with_config(
            db_path.clone(),
            EngineConfig { backup_retention_minutes: 0, ..EngineConfig::default() },
        );
        match invalid {
            Ok(_) => panic!("zero retention must be rejected"),
            Err(err) => {
                assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Validation(_))));
            }
        }

        let api = ActionKernelApi::new(db_path.clone());
        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.integrity_check()?.quick_check_ok);

        remove_db(&db_path);
        Ok(())
    }
}
