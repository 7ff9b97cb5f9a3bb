use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use action_kernel_api::{ActionKernelApi, HistoryStepRequest, PerformRequest};
use action_kernel_core::{
    ActionGroupId, ActionId, ActionRequest, ActionSelector, ActorId, CellValue, CreateFieldRequest,
    DeleteFieldRequest, EngineConfig, FieldConfig, FieldId, FieldUpdate, RowId, SessionId,
    TableId, UpdateFieldRequest, UpdateRowRequest, UpdateTableRequest, WorkspaceId,
};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ak")]
#[command(about = "Action Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./action_kernel.sqlite3")]
    db: PathBuf,

    /// JSON file with engine settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    backup_retention_minutes: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Table {
        #[command(subcommand)]
        command: Box<TableCommand>,
    },
    Field {
        #[command(subcommand)]
        command: Box<FieldCommand>,
    },
    Row {
        #[command(subcommand)]
        command: Box<RowCommand>,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Backups {
        #[command(subcommand)]
        command: BackupsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Who performs an action, and in which client tab.
#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long)]
    actor_id: i64,
    #[arg(long)]
    session_id: String,
    #[arg(long)]
    action_group: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TableCommand {
    Create {
        #[arg(long)]
        workspace_id: i64,
        #[arg(long)]
        name: String,
    },
    List {
        #[arg(long)]
        workspace_id: Option<i64>,
    },
    Purge {
        #[arg(long)]
        table_id: i64,
    },
    Rename {
        #[arg(long)]
        table_id: i64,
        #[arg(long)]
        name: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
}

#[derive(Debug, Subcommand)]
enum FieldCommand {
    List {
        #[arg(long)]
        table_id: i64,
        #[arg(long, default_value_t = false)]
        include_trashed: bool,
    },
    Create {
        #[arg(long)]
        table_id: i64,
        #[arg(long)]
        name: String,
        /// Field configuration as JSON, e.g. `{"type":"number","decimal_places":2}`.
        #[arg(long)]
        config: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Update {
        #[arg(long)]
        field_id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Delete {
        #[arg(long)]
        field_id: i64,
        #[command(flatten)]
        actor: ActorArgs,
    },
}

#[derive(Debug, Subcommand)]
enum RowCommand {
    Create {
        #[arg(long)]
        table_id: i64,
        /// Cell values as a JSON object keyed by field id.
        #[arg(long, default_value = "{}")]
        values: String,
    },
    List {
        #[arg(long)]
        table_id: i64,
    },
    Update {
        #[arg(long)]
        table_id: i64,
        #[arg(long)]
        row_id: i64,
        #[arg(long)]
        values: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Undo(HistoryStepArgs),
    Redo(HistoryStepArgs),
    List {
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Show {
        #[arg(long)]
        action_id: i64,
    },
}

#[derive(Debug, Args)]
struct HistoryStepArgs {
    #[arg(long)]
    session_id: String,
    /// `[<kind>@]<scope>`; repeat to select across several scopes.
    #[arg(long = "selector", required = true)]
    selectors: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum BackupsCommand {
    Cleanup {
        /// Sweep as if the current time were this RFC3339 UTC timestamp.
        #[arg(long)]
        now: Option<String>,
    },
    List,
    PruneOrphans,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.backup_retention_minutes)?;
    tracing::debug!(
        db = %cli.db.display(),
        backup_retention_minutes = config.backup_retention_minutes,
        "engine configured"
    );
    let api = ActionKernelApi::with_config(cli.db, config)?;

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Table { command } => run_table(*command, &api),
        Command::Field { command } => run_field(*command, &api),
        Command::Row { command } => run_row(*command, &api),
        Command::History { command } => run_history(command, &api),
        Command::Backups { command } => run_backups(command, &api),
    }
}

fn load_config(path: Option<&Path>, retention_override: Option<u32>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(minutes) = retention_override {
        config.backup_retention_minutes = minutes;
    }
    Ok(config)
}

fn run_db(command: DbCommand, api: &ActionKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_table(command: TableCommand, api: &ActionKernelApi) -> Result<()> {
    match command {
        TableCommand::Create { workspace_id, name } => {
            let table = api.create_table(WorkspaceId(workspace_id), &name)?;
            emit_json(serde_json::to_value(&table).context("failed to serialize table")?)
        }
        TableCommand::List { workspace_id } => {
            let tables = api.list_tables(workspace_id.map(WorkspaceId))?;
            emit_json(serde_json::json!({ "tables": tables }))
        }
        TableCommand::Purge { table_id } => {
            let purged = api.purge_table(TableId(table_id))?;
            emit_json(serde_json::json!({ "table_id": table_id, "purged": purged }))
        }
        TableCommand::Rename { table_id, name, actor } => perform(
            api,
            actor,
            ActionRequest::UpdateTable(UpdateTableRequest { table_id: TableId(table_id), name }),
        ),
    }
}

fn run_field(command: FieldCommand, api: &ActionKernelApi) -> Result<()> {
    match command {
        FieldCommand::List { table_id, include_trashed } => {
            let fields = api.list_fields(TableId(table_id), include_trashed)?;
            emit_json(serde_json::json!({ "fields": fields }))
        }
        FieldCommand::Create { table_id, name, config, actor } => perform(
            api,
            actor,
            ActionRequest::CreateField(CreateFieldRequest {
                table_id: TableId(table_id),
                name,
                config: parse_field_config(&config)?,
            }),
        ),
        FieldCommand::Update { field_id, name, config, actor } => {
            let config = config.as_deref().map(parse_field_config).transpose()?;
            perform(
                api,
                actor,
                ActionRequest::UpdateField(UpdateFieldRequest {
                    field_id: FieldId(field_id),
                    update: FieldUpdate { name, config },
                }),
            )
        }
        FieldCommand::Delete { field_id, actor } => perform(
            api,
            actor,
            ActionRequest::DeleteField(DeleteFieldRequest { field_id: FieldId(field_id) }),
        ),
    }
}

fn run_row(command: RowCommand, api: &ActionKernelApi) -> Result<()> {
    match command {
        RowCommand::Create { table_id, values } => {
            let row = api.create_row(TableId(table_id), &parse_values(&values)?)?;
            emit_json(serde_json::to_value(&row).context("failed to serialize row")?)
        }
        RowCommand::List { table_id } => {
            let rows = api.list_rows(TableId(table_id))?;
            emit_json(serde_json::json!({ "rows": rows }))
        }
        RowCommand::Update { table_id, row_id, values, actor } => perform(
            api,
            actor,
            ActionRequest::UpdateRow(UpdateRowRequest {
                table_id: TableId(table_id),
                row_id: RowId(row_id),
                values: parse_values(&values)?,
            }),
        ),
    }
}

fn run_history(command: HistoryCommand, api: &ActionKernelApi) -> Result<()> {
    match command {
        HistoryCommand::Undo(args) => {
            let result = api.undo(history_step_request(&args)?)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize undo result")?)
        }
        HistoryCommand::Redo(args) => {
            let result = api.redo(history_step_request(&args)?)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize redo result")?)
        }
        HistoryCommand::List { session_id, limit } => {
            let session_id = SessionId::parse(&session_id)?;
            let actions = api.list_actions(&session_id, limit)?;
            emit_json(serde_json::json!({ "session_id": session_id, "actions": actions }))
        }
        HistoryCommand::Show { action_id } => {
            let record = api.get_action(ActionId(action_id))?;
            emit_json(serde_json::to_value(&record).context("failed to serialize action record")?)
        }
    }
}

fn run_backups(command: BackupsCommand, api: &ActionKernelApi) -> Result<()> {
    match command {
        BackupsCommand::Cleanup { now } => {
            let now = now.as_deref().map(parse_rfc3339).transpose()?;
            let summary = api.cleanup_due_backups(now)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize cleanup summary")?)
        }
        BackupsCommand::List => {
            let inventory = api.list_backup_artifacts()?;
            emit_json(serde_json::to_value(&inventory).context("failed to serialize backups")?)
        }
        BackupsCommand::PruneOrphans => {
            let summary = api.prune_orphaned_backups()?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize prune summary")?)
        }
    }
}

fn perform(api: &ActionKernelApi, actor: ActorArgs, request: ActionRequest) -> Result<()> {
    let action_group = actor.action_group.as_deref().map(str::parse::<ActionGroupId>).transpose()?;
    let record = api.perform(PerformRequest {
        actor_id: ActorId(actor.actor_id),
        session_id: SessionId::parse(&actor.session_id)?,
        action_group,
        request,
    })?;
    emit_json(serde_json::to_value(&record).context("failed to serialize action record")?)
}

fn history_step_request(args: &HistoryStepArgs) -> Result<HistoryStepRequest> {
    let selectors = args
        .selectors
        .iter()
        .map(|raw| raw.parse::<ActionSelector>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HistoryStepRequest { session_id: SessionId::parse(&args.session_id)?, selectors })
}

fn parse_field_config(raw: &str) -> Result<FieldConfig> {
    serde_json::from_str(raw).with_context(|| format!("invalid field config JSON: {raw}"))
}

fn parse_values(raw: &str) -> Result<BTreeMap<FieldId, CellValue>> {
    serde_json::from_str(raw).with_context(|| format!("invalid cell values JSON: {raw}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
