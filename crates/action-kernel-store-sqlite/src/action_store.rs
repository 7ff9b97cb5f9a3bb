use std::str::FromStr;

use action_kernel_core::{
    ActionGroupId, ActionId, ActionKind, ActionParams, ActionRecord, ActionScope, ActionSelector,
    ActorId, BackupData, EngineError, SessionId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::scope::SelectorFilter;
use crate::{parse_rfc3339, rfc3339, unix_millis};

const RECORD_COLUMNS: &str = "id, kind, actor_id, session_id, action_group, scope, params_json, \
                              backup_json, created_at, undone_at";

pub(crate) struct NewActionRecord<'a> {
    pub(crate) actor_id: ActorId,
    pub(crate) session_id: &'a SessionId,
    pub(crate) action_group: Option<ActionGroupId>,
    pub(crate) scope: ActionScope,
    pub(crate) params: &'a ActionParams,
    pub(crate) backup_data: Option<&'a BackupData>,
    pub(crate) created_at: OffsetDateTime,
}

struct RawRecord {
    id: i64,
    kind: String,
    actor_id: i64,
    session_id: String,
    action_group: Option<String>,
    scope: String,
    params_json: String,
    backup_json: Option<String>,
    created_at: String,
    undone_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            actor_id: row.get(2)?,
            session_id: row.get(3)?,
            action_group: row.get(4)?,
            scope: row.get(5)?,
            params_json: row.get(6)?,
            backup_json: row.get(7)?,
            created_at: row.get(8)?,
            undone_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<ActionRecord> {
        let kind = ActionKind::parse(&self.kind)
            .ok_or_else(|| EngineError::UnknownKind(self.kind.clone()))?;
        let params: ActionParams = serde_json::from_str(&self.params_json)
            .with_context(|| format!("invalid params_json for action {}", self.id))?;
        if params.kind() != kind {
            return Err(EngineError::PayloadMismatch(format!(
                "action {} is stored as {kind} but carries {} params",
                self.id,
                params.kind()
            ))
            .into());
        }

        let backup_data = self
            .backup_json
            .as_deref()
            .map(serde_json::from_str::<BackupData>)
            .transpose()
            .with_context(|| format!("invalid backup_json for action {}", self.id))?;

        Ok(ActionRecord {
            id: ActionId(self.id),
            kind,
            actor_id: ActorId(self.actor_id),
            session_id: SessionId(self.session_id),
            action_group: self.action_group.as_deref().map(ActionGroupId::from_str).transpose()?,
            scope: ActionScope::parse(&self.scope)?,
            params,
            backup_data,
            created_at: parse_rfc3339(&self.created_at)?,
            undone_at: self.undone_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

fn query_records(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<ActionRecord>> {
    let raw = {
        let mut stmt = conn.prepare(sql).context("failed to prepare action record query")?;
        let rows = stmt.query_map(params_from_iter(values), RawRecord::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read action records")?
    };
    raw.into_iter().map(RawRecord::decode).collect()
}

fn session_and_filter(session_id: &SessionId, filter: SelectorFilter) -> Vec<Value> {
    let mut values = Vec::with_capacity(filter.values.len() + 1);
    values.push(Value::Text(session_id.0.clone()));
    values.extend(filter.values);
    values
}

pub(crate) fn insert_record(conn: &Connection, new: &NewActionRecord<'_>) -> Result<ActionRecord> {
    let params_json =
        serde_json::to_string(new.params).context("failed to serialize action params")?;
    let backup_json = new
        .backup_data
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize backup data")?;
    let kind = new.params.kind();

    conn.execute(
        "INSERT INTO action_records(
            kind, actor_id, session_id, action_group, scope, params_json, backup_json,
            created_at, created_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            kind.as_str(),
            new.actor_id.0,
            new.session_id.0,
            new.action_group.map(|group| group.to_string()),
            new.scope.path(),
            params_json,
            backup_json,
            rfc3339(new.created_at)?,
            unix_millis(new.created_at)?,
        ],
    )
    .context("failed to insert action record")?;

    Ok(ActionRecord {
        id: ActionId(conn.last_insert_rowid()),
        kind,
        actor_id: new.actor_id,
        session_id: new.session_id.clone(),
        action_group: new.action_group,
        scope: new.scope,
        params: new.params.clone(),
        backup_data: new.backup_data.cloned(),
        created_at: new.created_at,
        undone_at: None,
    })
}

pub(crate) fn load_record(conn: &Connection, id: ActionId) -> Result<Option<ActionRecord>> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM action_records WHERE id = ?1"),
            params![id.0],
            RawRecord::from_row,
        )
        .optional()
        .with_context(|| format!("failed to load action {id}"))?;
    raw.map(RawRecord::decode).transpose()
}

/// Records of one session, newest first.
pub(crate) fn list_session_records(
    conn: &Connection,
    session_id: &SessionId,
    limit: usize,
) -> Result<Vec<ActionRecord>> {
    let limit = i64::try_from(limit).context("history limit is too large")?;
    query_records(
        conn,
        &format!(
            "SELECT {RECORD_COLUMNS} FROM action_records
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2"
        ),
        vec![Value::Text(session_id.0.clone()), Value::Integer(limit)],
    )
}

/// Newest applied record of the session matching any selector.
pub(crate) fn undo_candidate(
    conn: &Connection,
    session_id: &SessionId,
    selectors: &[ActionSelector],
) -> Result<Option<ActionRecord>> {
    let Some(filter) = SelectorFilter::build(selectors, 2) else {
        return Ok(None);
    };
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM action_records
         WHERE session_id = ?1 AND undone_at IS NULL AND {}
         ORDER BY id DESC LIMIT 1",
        filter.clause
    );
    Ok(query_records(conn, &sql, session_and_filter(session_id, filter))?.into_iter().next())
}

/// Most recently undone record of the session matching any selector that is newer than every
/// still-applied matching record. Anything older was superseded by a later perform.
pub(crate) fn redo_candidate(
    conn: &Connection,
    session_id: &SessionId,
    selectors: &[ActionSelector],
) -> Result<Option<ActionRecord>> {
    let Some(filter) = SelectorFilter::build(selectors, 2) else {
        return Ok(None);
    };
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM action_records
         WHERE session_id = ?1 AND undone_at IS NOT NULL AND {clause}
           AND id > COALESCE((
             SELECT MAX(id) FROM action_records
             WHERE session_id = ?1 AND undone_at IS NULL AND {clause}
           ), 0)
         ORDER BY undone_seq DESC LIMIT 1",
        clause = filter.clause
    );
    Ok(query_records(conn, &sql, session_and_filter(session_id, filter))?.into_iter().next())
}

/// Applied records of a group, newest first.
pub(crate) fn applied_group_records(
    conn: &Connection,
    session_id: &SessionId,
    group: ActionGroupId,
) -> Result<Vec<ActionRecord>> {
    query_records(
        conn,
        &format!(
            "SELECT {RECORD_COLUMNS} FROM action_records
             WHERE session_id = ?1 AND action_group = ?2 AND undone_at IS NULL
             ORDER BY id DESC"
        ),
        vec![Value::Text(session_id.0.clone()), Value::Text(group.to_string())],
    )
}

/// Undone records of a group, oldest first.
pub(crate) fn undone_group_records(
    conn: &Connection,
    session_id: &SessionId,
    group: ActionGroupId,
) -> Result<Vec<ActionRecord>> {
    query_records(
        conn,
        &format!(
            "SELECT {RECORD_COLUMNS} FROM action_records
             WHERE session_id = ?1 AND action_group = ?2 AND undone_at IS NOT NULL
             ORDER BY id ASC"
        ),
        vec![Value::Text(session_id.0.clone()), Value::Text(group.to_string())],
    )
}

pub(crate) fn mark_undone(conn: &Connection, id: ActionId, at: OffsetDateTime) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE action_records
             SET undone_at = ?1,
                 undone_seq = (SELECT COALESCE(MAX(undone_seq), 0) + 1 FROM action_records)
             WHERE id = ?2 AND undone_at IS NULL",
            params![rfc3339(at)?, id.0],
        )
        .with_context(|| format!("failed to mark action {id} undone"))?;
    if changed != 1 {
        return Err(anyhow!("action {id} is not in the applied state"));
    }
    Ok(())
}

pub(crate) fn mark_redone(conn: &Connection, id: ActionId) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE action_records SET undone_at = NULL, undone_seq = NULL
             WHERE id = ?1 AND undone_at IS NOT NULL",
            params![id.0],
        )
        .with_context(|| format!("failed to mark action {id} redone"))?;
    if changed != 1 {
        return Err(anyhow!("action {id} is not in the undone state"));
    }
    Ok(())
}

/// Records created strictly before `cutoff`, oldest first.
pub(crate) fn expired_records(conn: &Connection, cutoff: OffsetDateTime) -> Result<Vec<ActionRecord>> {
    query_records(
        conn,
        &format!(
            "SELECT {RECORD_COLUMNS} FROM action_records
             WHERE created_at_ms < ?1 ORDER BY id ASC"
        ),
        vec![Value::Integer(unix_millis(cutoff)?)],
    )
}

pub(crate) fn delete_record(conn: &Connection, id: ActionId) -> Result<()> {
    conn.execute("DELETE FROM action_records WHERE id = ?1", params![id.0])
        .with_context(|| format!("failed to delete action {id}"))?;
    Ok(())
}

pub(crate) fn referenced_backups(conn: &Connection) -> Result<Vec<BackupData>> {
    let raw = {
        let mut stmt = conn
            .prepare("SELECT id, backup_json FROM action_records WHERE backup_json IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read backup references")?
    };

    raw.into_iter()
        .map(|(id, json)| {
            serde_json::from_str(&json).with_context(|| format!("invalid backup_json for action {id}"))
        })
        .collect()
}
