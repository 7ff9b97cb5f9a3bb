use action_kernel_core::{
    ActionGroupId, ActionId, ActionRecord, ActionRequest, ActionSelector, ActorId, EngineError,
    SessionId,
};
use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior};
use time::OffsetDateTime;

use crate::action_store::{self, NewActionRecord};
use crate::backup::{self, CleanupSummary, PruneSummary};
use crate::handlers::ActionRegistry;
use crate::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Undo,
    Redo,
}

impl SqliteStore {
    /// Execute a reversible action and record it in the session's history.
    ///
    /// The whole operation runs in one `BEGIN IMMEDIATE` transaction, so the write lock is held
    /// before the handler reads any state.
    ///
    /// # Errors
    /// Returns the handler's error (validation, unknown kind, storage) with nothing persisted.
    pub fn perform(
        &mut self,
        registry: &ActionRegistry,
        actor_id: ActorId,
        session_id: &SessionId,
        action_group: Option<ActionGroupId>,
        request: ActionRequest,
    ) -> Result<ActionRecord> {
        let kind = request.kind();
        let handler = registry.handler(kind)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start perform transaction")?;
        let performed = handler.perform(&tx, actor_id, request)?;
        if performed.params.kind() != kind {
            return Err(EngineError::PayloadMismatch(format!(
                "{kind} handler produced {} params",
                performed.params.kind()
            ))
            .into());
        }

        let record = action_store::insert_record(
            &tx,
            &NewActionRecord {
                actor_id,
                session_id,
                action_group,
                scope: performed.scope,
                params: &performed.params,
                backup_data: performed.backup_data.as_ref(),
                created_at: OffsetDateTime::now_utc(),
            },
        )?;
        tx.commit().context("failed to commit perform transaction")?;

        tracing::info!(
            action_id = record.id.0,
            kind = %record.kind,
            session = %record.session_id,
            scope = %record.scope,
            destructive = record.backup_data.is_some(),
            "performed action"
        );
        Ok(record)
    }

    /// Undo the newest applied action of `session_id` matching any selector, together with the
    /// rest of its action group. Returns the undone records, newest first; empty when nothing
    /// matches.
    ///
    /// # Errors
    /// Returns the handler's error with history and data unchanged.
    pub fn undo(
        &mut self,
        registry: &ActionRegistry,
        session_id: &SessionId,
        selectors: &[ActionSelector],
    ) -> Result<Vec<ActionRecord>> {
        self.step(registry, session_id, selectors, Step::Undo)
    }

    /// Redo the most recently undone action of `session_id` matching any selector that was not
    /// superseded by a newer matching action, together with the rest of its action group.
    /// Returns the redone records, oldest first.
    ///
    /// # Errors
    /// Returns the handler's error with history and data unchanged.
    pub fn redo(
        &mut self,
        registry: &ActionRegistry,
        session_id: &SessionId,
        selectors: &[ActionSelector],
    ) -> Result<Vec<ActionRecord>> {
        self.step(registry, session_id, selectors, Step::Redo)
    }

    fn step(
        &mut self,
        registry: &ActionRegistry,
        session_id: &SessionId,
        selectors: &[ActionSelector],
        step: Step,
    ) -> Result<Vec<ActionRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start history transaction")?;

        let candidate = match step {
            Step::Undo => action_store::undo_candidate(&tx, session_id, selectors)?,
            Step::Redo => action_store::redo_candidate(&tx, session_id, selectors)?,
        };
        let Some(candidate) = candidate else {
            tracing::debug!(session = %session_id, ?step, "no matching action");
            return Ok(Vec::new());
        };

        let records = match (candidate.action_group, step) {
            (Some(group), Step::Undo) => action_store::applied_group_records(&tx, session_id, group)?,
            (Some(group), Step::Redo) => action_store::undone_group_records(&tx, session_id, group)?,
            (None, _) => vec![candidate],
        };

        let now = OffsetDateTime::now_utc();
        let mut processed = Vec::with_capacity(records.len());
        for mut record in records {
            apply_step(&tx, registry, &record, step)?;
            match step {
                Step::Undo => {
                    action_store::mark_undone(&tx, record.id, now)?;
                    record.undone_at = Some(now);
                }
                Step::Redo => {
                    action_store::mark_redone(&tx, record.id)?;
                    record.undone_at = None;
                }
            }
            processed.push(record);
        }
        tx.commit().context("failed to commit history transaction")?;

        for record in &processed {
            tracing::info!(
                action_id = record.id.0,
                kind = %record.kind,
                session = %record.session_id,
                scope = %record.scope,
                ?step,
                "reversed action history"
            );
        }
        Ok(processed)
    }

    /// History of one session, newest first.
    ///
    /// # Errors
    /// Returns an error when records cannot be read or decoded.
    pub fn list_actions(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ActionRecord>> {
        action_store::list_session_records(&self.conn, session_id, limit)
    }

    /// # Errors
    /// Returns an error when the record cannot be read or decoded.
    pub fn get_action(&self, action_id: ActionId) -> Result<Option<ActionRecord>> {
        action_store::load_record(&self.conn, action_id)
    }

    /// Release the backup of one record through its handler. The record itself stays.
    ///
    /// # Errors
    /// Returns an error only when the record cannot be loaded; cleanup itself never fails.
    pub fn cleanup_action(&mut self, registry: &ActionRegistry, action_id: ActionId) -> Result<bool> {
        let Some(record) = action_store::load_record(&self.conn, action_id)? else {
            return Ok(false);
        };
        release_record_backup(&self.conn, registry, &record);
        Ok(record.backup_data.is_some())
    }

    /// Expire records older than the configured retention, releasing their backups first.
    ///
    /// Meant to be called periodically by an external scheduler.
    ///
    /// # Errors
    /// Returns an error when records cannot be read or deleted.
    pub fn cleanup_due_backups(
        &mut self,
        registry: &ActionRegistry,
        now: OffsetDateTime,
    ) -> Result<CleanupSummary> {
        let cutoff = now - self.config.backup_retention();
        let expired = action_store::expired_records(&self.conn, cutoff)?;

        let mut summary = CleanupSummary::default();
        for record in expired {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start cleanup transaction")?;
            if record.backup_data.is_some() {
                release_record_backup(&tx, registry, &record);
                summary.backups_released += 1;
            }
            action_store::delete_record(&tx, record.id)?;
            tx.commit().context("failed to commit cleanup transaction")?;

            summary.records_expired += 1;
            summary.expired_action_ids.push(record.id);
        }

        tracing::info!(
            records_expired = summary.records_expired,
            backups_released = summary.backups_released,
            "expired action records"
        );
        Ok(summary)
    }

    /// Every backup artifact in the database, referenced or not.
    ///
    /// # Errors
    /// Returns an error when the database catalog cannot be read.
    pub fn list_backup_artifacts(&self) -> Result<Vec<action_kernel_core::BackupData>> {
        backup::list_artifacts(&self.conn)
    }

    /// Force-delete backup artifacts that no action record references anymore.
    ///
    /// # Errors
    /// Returns an error when the catalog or the records cannot be read.
    pub fn prune_orphaned_backups(&mut self) -> Result<PruneSummary> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start prune transaction")?;
        let referenced = action_store::referenced_backups(&tx)?;

        let mut summary = PruneSummary { referenced: referenced.len(), released: Vec::new() };
        for artifact in backup::list_artifacts(&tx)? {
            if !referenced.contains(&artifact) {
                backup::release(&tx, &artifact);
                summary.released.push(artifact);
            }
        }
        tx.commit().context("failed to commit prune transaction")?;

        if !summary.released.is_empty() {
            tracing::warn!(released = summary.released.len(), "pruned orphaned backup artifacts");
        }
        Ok(summary)
    }
}

fn apply_step(
    conn: &Connection,
    registry: &ActionRegistry,
    record: &ActionRecord,
    step: Step,
) -> Result<()> {
    let handler = registry.handler(record.kind)?;
    let result = match step {
        Step::Undo => handler.undo(conn, record.actor_id, record),
        Step::Redo => handler.redo(conn, record.actor_id, record),
    };
    result.with_context(|| format!("failed to {} action {}", step.verb(), record.id))
}

fn release_record_backup(conn: &Connection, registry: &ActionRegistry, record: &ActionRecord) {
    match registry.handler(record.kind) {
        Ok(handler) => handler.cleanup(conn, record),
        Err(err) => {
            tracing::warn!(action_id = record.id.0, error = %err, "no handler to release backup");
            if let Some(backup_data) = &record.backup_data {
                backup::release(conn, backup_data);
            }
        }
    }
}

impl Step {
    fn verb(self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}
