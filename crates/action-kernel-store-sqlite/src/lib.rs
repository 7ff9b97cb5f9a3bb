use std::collections::BTreeMap;
use std::path::Path;

use action_kernel_core::{
    CellValue, EngineConfig, EngineError, Field, FieldId, Row, RowId, Table, TableId, WorkspaceId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod action_store;
mod backup;
mod handlers;
mod history;
mod schema;
mod scope;

pub use backup::{CleanupSummary, PruneSummary};
pub use handlers::{ActionHandler, ActionRegistry, Performed};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS workspace_tables (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workspace_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fields (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  table_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  position INTEGER NOT NULL,
  field_type TEXT NOT NULL CHECK (field_type IN ('text','number','boolean','single_select','link_row')),
  config_json TEXT NOT NULL,
  trashed INTEGER NOT NULL DEFAULT 0 CHECK (trashed IN (0, 1)),
  FOREIGN KEY (table_id) REFERENCES workspace_tables(id)
);

CREATE TABLE IF NOT EXISTS field_select_options (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  field_id INTEGER NOT NULL,
  value TEXT NOT NULL,
  color TEXT NOT NULL,
  position INTEGER NOT NULL,
  FOREIGN KEY (field_id) REFERENCES fields(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_fields_live_name ON fields(table_id, name) WHERE trashed = 0;
CREATE INDEX IF NOT EXISTS idx_fields_table ON fields(table_id);
CREATE INDEX IF NOT EXISTS idx_field_select_options_field ON field_select_options(field_id);
CREATE INDEX IF NOT EXISTS idx_workspace_tables_workspace ON workspace_tables(workspace_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS action_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL CHECK (kind IN ('update_field','create_field','delete_field','update_table','update_row')),
  actor_id INTEGER NOT NULL,
  session_id TEXT NOT NULL,
  action_group TEXT,
  scope TEXT NOT NULL,
  params_json TEXT NOT NULL,
  backup_json TEXT,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  undone_at TEXT,
  undone_seq INTEGER,
  CHECK ((undone_at IS NULL) = (undone_seq IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_action_records_session ON action_records(session_id, id DESC);
CREATE INDEX IF NOT EXISTS idx_action_records_scope ON action_records(scope);
CREATE INDEX IF NOT EXISTS idx_action_records_created ON action_records(created_at_ms);
CREATE INDEX IF NOT EXISTS idx_action_records_group ON action_records(session_id, action_group);
";

pub struct SqliteStore {
    conn: Connection,
    config: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed action store with default engine settings.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    /// Open a SQLite-backed action store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid, the database cannot be opened or
    /// pragmas cannot be applied.
    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::debug!(version, "applied schema migration");
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Create a table with empty row storage. Tables are not reversible actions.
    ///
    /// # Errors
    /// Returns an error when the name is invalid or the write fails.
    pub fn create_table(&mut self, workspace_id: WorkspaceId, name: &str) -> Result<Table> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let table = schema::insert_table(&tx, workspace_id, name)?;
        tx.commit().context("failed to commit table creation")?;
        tracing::debug!(table_id = table.id.0, workspace_id = workspace_id.0, "created table");
        Ok(table)
    }

    /// # Errors
    /// Returns an error when table metadata cannot be read.
    pub fn list_tables(&self, workspace_id: Option<WorkspaceId>) -> Result<Vec<Table>> {
        schema::list_tables(&self.conn, workspace_id)
    }

    /// # Errors
    /// Returns an error when table metadata cannot be read.
    pub fn get_table(&self, table_id: TableId) -> Result<Option<Table>> {
        schema::load_table(&self.conn, table_id)
    }

    /// Permanently delete a table, its storage, its fields and its relationships.
    ///
    /// Backup artifacts of the table stay referenced by their records until cleanup.
    ///
    /// # Errors
    /// Returns an error when any drop or delete fails.
    pub fn delete_table_permanently(&mut self, table_id: TableId) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("failed to start purge transaction")?;
        let deleted = schema::purge_table(&tx, table_id)?;
        tx.commit().context("failed to commit table purge")?;
        if deleted {
            tracing::info!(table_id = table_id.0, "permanently deleted table");
        }
        Ok(deleted)
    }

    /// # Errors
    /// Returns an error when field metadata cannot be read or decoded.
    pub fn list_fields(&self, table_id: TableId, include_trashed: bool) -> Result<Vec<Field>> {
        schema::list_fields(&self.conn, table_id, include_trashed)
    }

    /// # Errors
    /// Returns an error when field metadata cannot be read or decoded.
    pub fn get_field(&self, field_id: FieldId) -> Result<Option<Field>> {
        schema::load_field(&self.conn, field_id)
    }

    /// Insert a row and write its initial values. Rows are not reversible actions.
    ///
    /// # Errors
    /// Returns an error when the table is missing, a value does not fit its field, or the
    /// write fails.
    pub fn create_row(
        &mut self,
        table_id: TableId,
        values: &BTreeMap<FieldId, CellValue>,
    ) -> Result<Row> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        schema::existing_table(&tx, table_id)?;
        let row_id = schema::insert_row(&tx, table_id)?;

        let mut stored = BTreeMap::new();
        for (field_id, value) in values {
            let field = live_field_in_table(&tx, *field_id, table_id)?;
            let value = schema::coerce_cell(&tx, &field, value)?;
            schema::write_cell(&tx, &field, row_id, &value)?;
            stored.insert(*field_id, value);
        }

        tx.commit().context("failed to commit row creation")?;
        Ok(Row { id: row_id, values: stored })
    }

    /// # Errors
    /// Returns an error when the table is missing or rows cannot be read.
    pub fn list_rows(&self, table_id: TableId) -> Result<Vec<Row>> {
        schema::list_rows(&self.conn, table_id)
    }

    /// Whether a table or column with this name exists in the database file.
    ///
    /// # Errors
    /// Returns an error when `sqlite_master` cannot be inspected.
    pub fn physical_object_exists(&self, table: &str, column: Option<&str>) -> Result<bool> {
        match column {
            Some(column) => table_has_column(&self.conn, table, column),
            None => table_exists(&self.conn, table),
        }
    }
}

pub(crate) fn live_field_in_table(
    conn: &Connection,
    field_id: FieldId,
    table_id: TableId,
) -> Result<Field> {
    let field = schema::existing_field(conn, field_id)?;
    if field.table_id != table_id {
        return Err(EngineError::Validation(format!(
            "field {field_id} does not belong to table {table_id}"
        ))
        .into());
    }
    Ok(field)
}

pub(crate) fn row_must_exist(conn: &Connection, table_id: TableId, row_id: RowId) -> Result<()> {
    if schema::row_exists(conn, table_id, row_id)? {
        Ok(())
    } else {
        Err(EngineError::Validation(format!("row {row_id} does not exist in table {table_id}"))
            .into())
    }
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|name| name == column))
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

pub(crate) fn unix_millis(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .with_context(|| format!("timestamp out of range: {value}"))
}
