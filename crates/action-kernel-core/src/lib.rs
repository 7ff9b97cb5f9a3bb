use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod field;

pub use field::{
    convert_cell, requires_backup, CellValue, Field, FieldConfig, FieldType, FieldUpdate, Row,
    SelectOption, Table, BOOLEAN_TRUE_VALUES, MAX_DECIMAL_PLACES,
};

pub const MAX_NAME_LENGTH: usize = 255;
pub const UNDO_COLLISION_SUFFIX: &str = " (From undo)";
pub const REDO_COLLISION_SUFFIX: &str = " (From redo)";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("target unrecoverable: {0}")]
    TargetUnrecoverable(String),
    #[error("name conflict: {0}")]
    NameConflict(String),
    #[error("unknown action kind: {0}")]
    UnknownKind(String),
    #[error("payload mismatch: {0}")]
    PayloadMismatch(String),
}

macro_rules! integer_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
            )]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl Display for $name {
                fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

integer_id!(
    /// Tenant that owns a set of tables.
    WorkspaceId,
    TableId,
    FieldId,
    RowId,
    ActorId,
    /// Monotonic id of a persisted action record; higher means created later.
    ActionId,
);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Build a session id from a client supplied token.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the token is blank.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("session id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActionGroupId(pub Ulid);

impl ActionGroupId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActionGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActionGroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionGroupId {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| EngineError::Validation(format!("invalid action group {value}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    UpdateField,
    CreateField,
    DeleteField,
    UpdateTable,
    UpdateRow,
}

impl ActionKind {
    pub const ALL: [Self; 5] =
        [Self::UpdateField, Self::CreateField, Self::DeleteField, Self::UpdateTable, Self::UpdateRow];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdateField => "update_field",
            Self::CreateField => "create_field",
            Self::DeleteField => "delete_field",
            Self::UpdateTable => "update_table",
            Self::UpdateRow => "update_row",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "update_field" => Some(Self::UpdateField),
            "create_field" => Some(Self::CreateField),
            "delete_field" => Some(Self::DeleteField),
            "update_table" => Some(Self::UpdateTable),
            "update_row" => Some(Self::UpdateRow),
            _ => None,
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter path attached to every action record. Matching is exact on the path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum ActionScope {
    Root,
    Workspace(WorkspaceId),
    Table(TableId),
}

impl ActionScope {
    #[must_use]
    pub fn path(self) -> String {
        match self {
            Self::Root => "root".to_string(),
            Self::Workspace(id) => format!("workspace:{id}"),
            Self::Table(id) => format!("table:{id}"),
        }
    }

    /// Parse a scope path such as `table:12`.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for unknown prefixes or non-numeric ids.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let value = value.trim();
        if value == "root" {
            return Ok(Self::Root);
        }

        let Some((prefix, raw_id)) = value.split_once(':') else {
            return Err(EngineError::Validation(format!("invalid scope path: {value}")));
        };
        let id = raw_id
            .parse::<i64>()
            .map_err(|_| EngineError::Validation(format!("invalid scope id in {value}")))?;

        match prefix {
            "workspace" => Ok(Self::Workspace(WorkspaceId(id))),
            "table" => Ok(Self::Table(TableId(id))),
            _ => Err(EngineError::Validation(format!("unknown scope type: {prefix}"))),
        }
    }
}

impl Display for ActionScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

impl From<ActionScope> for String {
    fn from(value: ActionScope) -> Self {
        value.path()
    }
}

impl TryFrom<String> for ActionScope {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// One `(kind, scope)` pair of an undo/redo request. A missing kind matches every kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActionSelector {
    pub kind: Option<ActionKind>,
    pub scope: ActionScope,
}

impl ActionSelector {
    #[must_use]
    pub fn any_kind(scope: ActionScope) -> Self {
        Self { kind: None, scope }
    }

    #[must_use]
    pub fn of_kind(kind: ActionKind, scope: ActionScope) -> Self {
        Self { kind: Some(kind), scope }
    }

    #[must_use]
    pub fn matches(&self, kind: ActionKind, scope: ActionScope) -> bool {
        self.scope == scope && self.kind.map_or(true, |expected| expected == kind)
    }
}

impl Display for ActionSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{kind}@{}", self.scope),
            None => write!(f, "{}", self.scope),
        }
    }
}

impl FromStr for ActionSelector {
    type Err = EngineError;

    /// Accepts `<scope>` or `<kind>@<scope>`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('@') {
            Some((raw_kind, raw_scope)) => {
                let kind = ActionKind::parse(raw_kind.trim())
                    .ok_or_else(|| EngineError::UnknownKind(raw_kind.trim().to_string()))?;
                Ok(Self::of_kind(kind, ActionScope::parse(raw_scope)?))
            }
            None => Ok(Self::any_kind(ActionScope::parse(value)?)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateFieldRequest {
    pub field_id: FieldId,
    pub update: FieldUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateFieldRequest {
    pub table_id: TableId,
    pub name: String,
    pub config: FieldConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteFieldRequest {
    pub field_id: FieldId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTableRequest {
    pub table_id: TableId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRowRequest {
    pub table_id: TableId,
    pub row_id: RowId,
    pub values: BTreeMap<FieldId, CellValue>,
}

/// What a caller asks the engine to perform. The owning handler turns it into stored params.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "request", rename_all = "snake_case")]
pub enum ActionRequest {
    UpdateField(UpdateFieldRequest),
    CreateField(CreateFieldRequest),
    DeleteField(DeleteFieldRequest),
    UpdateTable(UpdateTableRequest),
    UpdateRow(UpdateRowRequest),
}

impl ActionRequest {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::UpdateField(_) => ActionKind::UpdateField,
            Self::CreateField(_) => ActionKind::CreateField,
            Self::DeleteField(_) => ActionKind::DeleteField,
            Self::UpdateTable(_) => ActionKind::UpdateTable,
            Self::UpdateRow(_) => ActionKind::UpdateRow,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateFieldParams {
    pub table_id: TableId,
    pub field_id: FieldId,
    /// Full configuration before the update, select option ids included.
    pub previous: Field,
    /// Related field in the linked table that the update removed, if any.
    pub previous_related: Option<Field>,
    pub update: FieldUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldLifecycleParams {
    pub table_id: TableId,
    pub field_id: FieldId,
    pub related_field_id: Option<FieldId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTableParams {
    pub workspace_id: WorkspaceId,
    pub table_id: TableId,
    pub previous_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRowParams {
    pub table_id: TableId,
    pub row_id: RowId,
    pub previous_values: BTreeMap<FieldId, CellValue>,
    pub values: BTreeMap<FieldId, CellValue>,
}

/// Kind specific payload persisted with a record; decoded only by the owning handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum ActionParams {
    UpdateField(UpdateFieldParams),
    CreateField(FieldLifecycleParams),
    DeleteField(FieldLifecycleParams),
    UpdateTable(UpdateTableParams),
    UpdateRow(UpdateRowParams),
}

impl ActionParams {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::UpdateField(_) => ActionKind::UpdateField,
            Self::CreateField(_) => ActionKind::CreateField,
            Self::DeleteField(_) => ActionKind::DeleteField,
            Self::UpdateTable(_) => ActionKind::UpdateTable,
            Self::UpdateRow(_) => ActionKind::UpdateRow,
        }
    }
}

/// Locates the physical artifact that preserves pre-operation state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "artifact", rename_all = "snake_case")]
pub enum BackupData {
    /// Renamed pre-change column living inside the table's storage table.
    ShadowColumn { table_id: TableId, column: String },
    /// Copy of a relation table taken before the relationship was destroyed.
    ShadowRelation { relation_id: FieldId, table: String },
}

impl BackupData {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::ShadowColumn { table_id, column } => format!("tbl_{table_id}.{column}"),
            Self::ShadowRelation { table, .. } => table.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub id: ActionId,
    pub kind: ActionKind,
    pub actor_id: ActorId,
    pub session_id: SessionId,
    pub action_group: Option<ActionGroupId>,
    pub scope: ActionScope,
    pub params: ActionParams,
    pub backup_data: Option<BackupData>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub undone_at: Option<OffsetDateTime>,
}

impl ActionRecord {
    #[must_use]
    pub fn is_undone(&self) -> bool {
        self.undone_at.is_some()
    }

    #[must_use]
    pub fn matches_any(&self, selectors: &[ActionSelector]) -> bool {
        selectors.iter().any(|selector| selector.matches(self.kind, self.scope))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreDirection {
    Undo,
    Redo,
}

impl RestoreDirection {
    #[must_use]
    pub fn collision_suffix(self) -> &'static str {
        match self {
            Self::Undo => UNDO_COLLISION_SUFFIX,
            Self::Redo => REDO_COLLISION_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", content = "name", rename_all = "snake_case")]
pub enum ResolvedName {
    Unchanged(String),
    Renamed(String),
}

impl ResolvedName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unchanged(name) | Self::Renamed(name) => name,
        }
    }

    #[must_use]
    pub fn into_name(self) -> String {
        match self {
            Self::Unchanged(name) | Self::Renamed(name) => name,
        }
    }
}

/// Pick the name to restore when a sibling may already use `desired`.
///
/// The direction suffix is appended once. A second collision is not resolved further.
///
/// # Errors
/// Returns [`EngineError::NameConflict`] when the suffixed name is taken as well, or the
/// error produced by `is_taken`.
pub fn resolve_restore_name<E>(
    desired: &str,
    direction: RestoreDirection,
    mut is_taken: impl FnMut(&str) -> Result<bool, E>,
) -> Result<ResolvedName, E>
where
    E: From<EngineError>,
{
    if !is_taken(desired)? {
        return Ok(ResolvedName::Unchanged(desired.to_string()));
    }

    let suffixed = format!("{desired}{}", direction.collision_suffix());
    if is_taken(&suffixed)? {
        return Err(EngineError::NameConflict(format!(
            "both `{desired}` and `{suffixed}` are already in use"
        ))
        .into());
    }

    Ok(ResolvedName::Renamed(suffixed))
}

/// Trim and check a user supplied entity name.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the name is blank or too long.
pub fn normalize_name(entity: &str, name: &str) -> Result<String, EngineError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(format!("{entity} name MUST be non-empty")));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(EngineError::Validation(format!(
            "{entity} name MUST be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Age after which action records are expired and their backups released.
    pub backup_retention_minutes: u32,
    pub busy_timeout_ms: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { backup_retention_minutes: 120, busy_timeout_ms: 5_000 }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`EngineError::Validation`] when any setting is zero.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.backup_retention_minutes == 0 {
            return Err(EngineError::Validation(
                "backup_retention_minutes MUST be >= 1".to_string(),
            ));
        }
        if self.busy_timeout_ms == 0 {
            return Err(EngineError::Validation("busy_timeout_ms MUST be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn backup_retention(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.backup_retention_minutes))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn taken<'a>(names: &'a [&'a str]) -> impl FnMut(&str) -> Result<bool, EngineError> + 'a {
        move |candidate| Ok(names.iter().any(|name| *name == candidate))
    }

    #[test]
    fn scope_paths_round_trip_through_parse() -> Result<(), EngineError> {
        for scope in
            [ActionScope::Root, ActionScope::Workspace(WorkspaceId(3)), ActionScope::Table(TableId(42))]
        {
            assert_eq!(ActionScope::parse(&scope.path())?, scope);
        }
        Ok(())
    }

    #[test]
    fn scope_parse_rejects_unknown_prefix_and_bad_id() {
        assert!(matches!(ActionScope::parse("view:1"), Err(EngineError::Validation(_))));
        assert!(matches!(ActionScope::parse("table:abc"), Err(EngineError::Validation(_))));
        assert!(matches!(ActionScope::parse("table"), Err(EngineError::Validation(_))));
    }

    #[test]
    fn scope_serializes_as_path_string() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&ActionScope::Table(TableId(7)))?;
        assert_eq!(json, "\"table:7\"");
        let parsed: ActionScope = serde_json::from_str("\"workspace:2\"")?;
        assert_eq!(parsed, ActionScope::Workspace(WorkspaceId(2)));
        Ok(())
    }

    #[test]
    fn selector_parses_optional_kind_prefix() -> Result<(), EngineError> {
        let any = "table:5".parse::<ActionSelector>()?;
        assert_eq!(any, ActionSelector::any_kind(ActionScope::Table(TableId(5))));

        let typed = "update_field@table:5".parse::<ActionSelector>()?;
        assert_eq!(
            typed,
            ActionSelector::of_kind(ActionKind::UpdateField, ActionScope::Table(TableId(5)))
        );
        assert_eq!(typed.to_string(), "update_field@table:5");

        assert!(matches!(
            "rename_everything@table:5".parse::<ActionSelector>(),
            Err(EngineError::UnknownKind(_))
        ));
        Ok(())
    }

    #[test]
    fn selector_without_kind_matches_every_kind_in_scope() {
        let selector = ActionSelector::any_kind(ActionScope::Table(TableId(1)));
        for kind in ActionKind::ALL {
            assert!(selector.matches(kind, ActionScope::Table(TableId(1))));
        }
        assert!(!selector.matches(ActionKind::UpdateField, ActionScope::Table(TableId(2))));

        let typed = ActionSelector::of_kind(ActionKind::UpdateRow, ActionScope::Table(TableId(1)));
        assert!(!typed.matches(ActionKind::UpdateField, ActionScope::Table(TableId(1))));
    }

    #[test]
    fn action_kind_tags_are_stable() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse("update_view"), None);
    }

    #[test]
    fn collision_resolver_keeps_free_name() -> Result<(), EngineError> {
        let resolved = resolve_restore_name("Name", RestoreDirection::Undo, taken(&["Other"]))?;
        assert_eq!(resolved, ResolvedName::Unchanged("Name".to_string()));
        Ok(())
    }

    #[test]
    fn collision_resolver_appends_direction_suffix() -> Result<(), EngineError> {
        let undo = resolve_restore_name("Name", RestoreDirection::Undo, taken(&["Name"]))?;
        assert_eq!(undo, ResolvedName::Renamed("Name (From undo)".to_string()));

        let redo = resolve_restore_name("Name", RestoreDirection::Redo, taken(&["Name"]))?;
        assert_eq!(redo.as_str(), "Name (From redo)");
        Ok(())
    }

    #[test]
    fn collision_resolver_gives_up_after_one_suffix() {
        let result = resolve_restore_name(
            "Name",
            RestoreDirection::Undo,
            taken(&["Name", "Name (From undo)"]),
        );
        assert!(matches!(result, Err(EngineError::NameConflict(_))));
    }

    #[test]
    fn params_carry_kind_tag_in_json() -> Result<(), serde_json::Error> {
        let params = ActionParams::UpdateTable(UpdateTableParams {
            workspace_id: WorkspaceId(1),
            table_id: TableId(2),
            previous_name: "Customers".to_string(),
            name: "Clients".to_string(),
        });
        let value = serde_json::to_value(&params)?;
        assert_eq!(value["kind"], "update_table");
        assert_eq!(value["params"]["previous_name"], "Customers");
        let decoded: ActionParams = serde_json::from_value(value)?;
        assert_eq!(decoded.kind(), ActionKind::UpdateTable);
        Ok(())
    }

    #[test]
    fn backup_data_is_tagged_by_artifact() -> Result<(), serde_json::Error> {
        let backup =
            BackupData::ShadowColumn { table_id: TableId(4), column: "bak_9_01abc".to_string() };
        let value = serde_json::to_value(&backup)?;
        assert_eq!(value["artifact"], "shadow_column");
        assert_eq!(backup.describe(), "tbl_4.bak_9_01abc");
        Ok(())
    }

    #[test]
    fn normalize_name_trims_and_rejects_blank() -> Result<(), EngineError> {
        assert_eq!(normalize_name("field", "  Notes ")?, "Notes");
        assert!(matches!(normalize_name("field", "   "), Err(EngineError::Validation(_))));
        let long = "x".repeat(MAX_NAME_LENGTH + 1);
        assert!(matches!(normalize_name("field", &long), Err(EngineError::Validation(_))));
        Ok(())
    }

    #[test]
    fn engine_config_defaults_are_valid_and_zero_is_rejected() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backup_retention(), time::Duration::minutes(120));

        let broken = EngineConfig { backup_retention_minutes: 0, ..EngineConfig::default() };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn engine_config_fills_missing_keys_with_defaults() -> Result<(), serde_json::Error> {
        let config: EngineConfig = serde_json::from_str(r#"{"backup_retention_minutes": 5}"#)?;
        assert_eq!(config.backup_retention_minutes, 5);
        assert_eq!(config.busy_timeout_ms, EngineConfig::default().busy_timeout_ms);
        Ok(())
    }

    #[test]
    fn session_id_rejects_blank_tokens() {
        assert!(SessionId::parse("  ").is_err());
        assert!(matches!(SessionId::parse(" tab-1 "), Ok(SessionId(token)) if token == "tab-1"));
    }

    proptest! {
        #[test]
        fn property_resolved_name_is_never_taken(
            desired in "[A-Za-z][A-Za-z0-9 ]{0,20}",
            desired_taken in any::<bool>(),
            undo in any::<bool>(),
        ) {
            let direction = if undo { RestoreDirection::Undo } else { RestoreDirection::Redo };
            let occupied = if desired_taken { vec![desired.clone()] } else { Vec::new() };
            let resolved = resolve_restore_name(&desired, direction, |candidate| {
                Ok::<_, EngineError>(occupied.iter().any(|name| name == candidate))
            });
            let resolved = match resolved {
                Ok(resolved) => resolved,
                Err(err) => panic!("single collision must resolve: {err}"),
            };
            prop_assert!(!occupied.iter().any(|name| name == resolved.as_str()));
            prop_assert!(resolved.as_str().starts_with(desired.as_str()));
        }

        #[test]
        fn property_selector_display_parses_back(table in 1_i64..1_000_000, kind_index in 0_usize..6) {
            let scope = ActionScope::Table(TableId(table));
            let selector = match ActionKind::ALL.get(kind_index) {
                Some(kind) => ActionSelector::of_kind(*kind, scope),
                None => ActionSelector::any_kind(scope),
            };
            let parsed = selector.to_string().parse::<ActionSelector>();
            prop_assert_eq!(parsed, Ok(selector));
        }
    }
}
