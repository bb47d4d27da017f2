pub mod merge;

use capsync_core::sync_contracts::{ContractError, QueueEntry, SyncOperation};
use capsync_storage::{Enqueued, StorageError, SyncStore, SyncTx};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

pub use merge::{FieldMerge, MergeError, MergeSide, PayloadMerger};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("entry {entry_id} is not a conflict (operation {operation})")]
    NotAConflict {
        entry_id: i64,
        operation: SyncOperation,
    },
    #[error("conflict {entry_id} has diverging payloads")]
    NotConverged { entry_id: i64 },
}

pub enum ResolutionStrategy<'m> {
    AcceptServer,
    ForceLocal,
    Merge(&'m dyn PayloadMerger),
}

impl ResolutionStrategy<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::AcceptServer => "accept_server",
            ResolutionStrategy::ForceLocal => "force_local",
            ResolutionStrategy::Merge(_) => "merge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The server copy replaced the local row, or removed it when the server
    /// had deleted the record.
    AcceptedServer { purged_local: bool },
    /// The local content is queued again under `entry_id`.
    Requeued { entry_id: i64 },
    Merged { entry_id: i64, payload: Value },
    /// The local row was deleted; its delete is queued under `entry_id`.
    DeleteQueued { entry_id: i64 },
    /// The local row no longer exists; the conflict was dropped.
    Discarded { reason: String },
    Converged,
    /// The conflict no longer exists.
    AlreadyResolved,
}

impl ResolutionOutcome {
    fn label(&self) -> &'static str {
        match self {
            ResolutionOutcome::AcceptedServer { .. } => "accepted_server",
            ResolutionOutcome::Requeued { .. } => "requeued",
            ResolutionOutcome::Merged { .. } => "merged",
            ResolutionOutcome::DeleteQueued { .. } => "delete_queued",
            ResolutionOutcome::Discarded { .. } => "discarded",
            ResolutionOutcome::Converged => "converged",
            ResolutionOutcome::AlreadyResolved => "already_resolved",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Retry budget for entries a resolution queues; `None` keeps the store default.
    pub requeue_max_retries: Option<u32>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub conflicts_examined: usize,
    pub converged_closed: usize,
}

pub struct ConflictResolver {
    config: ResolverConfig,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Applies `strategy` to a conflict entry in one transaction. The entry is
    /// re-read first, so a stale copy resolves to `AlreadyResolved`.
    pub fn resolve(
        &self,
        store: &SyncStore,
        entry: &QueueEntry,
        strategy: ResolutionStrategy<'_>,
    ) -> Result<ResolutionOutcome, ResolveError> {
        if !entry.is_conflict() {
            return Err(ResolveError::NotAConflict {
                entry_id: entry.id,
                operation: entry.operation,
            });
        }

        let strategy_name = strategy.as_str();
        let outcome = store.with_transaction(|tx| self.resolve_in(tx, entry.id, strategy))?;

        info!(
            event = "conflict_resolved",
            entry_id = entry.id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            strategy = strategy_name,
            outcome = outcome.label(),
        );
        Ok(outcome)
    }

    fn resolve_in(
        &self,
        tx: &SyncTx<'_>,
        entry_id: i64,
        strategy: ResolutionStrategy<'_>,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let Some(current) = tx.entry(entry_id)? else {
            return Ok(ResolutionOutcome::AlreadyResolved);
        };
        if !current.is_conflict() {
            return Ok(ResolutionOutcome::AlreadyResolved);
        }
        let record = current.conflict_record()?;
        let entity_type = current.entity_type.as_str();
        let entity_id = current.entity_id.as_str();

        let local = match tx.load_record(entity_type, entity_id)? {
            Some(local) if !local.is_tombstoned() => local,
            Some(_) => {
                tx.remove_entry(current.id)?;
                return self.keep_local_delete(tx, entity_type, entity_id, record.server_deleted());
            }
            None => {
                tx.remove_entry(current.id)?;
                return Ok(ResolutionOutcome::Discarded {
                    reason: "local record is gone".to_string(),
                });
            }
        };

        // Once the server has dropped the record, pushing it back means recreating it.
        let push_operation = if record.server_deleted() {
            SyncOperation::Create
        } else {
            SyncOperation::Update
        };

        match strategy {
            ResolutionStrategy::AcceptServer => {
                tx.remove_entry(current.id)?;
                if record.server_deleted() {
                    tx.purge_record(entity_type, entity_id)?;
                    return Ok(ResolutionOutcome::AcceptedServer { purged_local: true });
                }
                tx.overwrite_record(entity_type, entity_id, &record.server_payload)?;
                if tx.remove_active_entry(entity_type, entity_id)? {
                    debug!(event = "local_edits_dropped", entity_type, entity_id);
                }
                Ok(ResolutionOutcome::AcceptedServer {
                    purged_local: false,
                })
            }
            ResolutionStrategy::ForceLocal => {
                tx.remove_entry(current.id)?;
                let entry_id = self.requeue(tx, entity_type, entity_id, push_operation, &local.content)?;
                Ok(ResolutionOutcome::Requeued { entry_id })
            }
            ResolutionStrategy::Merge(merger) => {
                let payload = merger.merge(&local.content, &record.server_payload)?;
                tx.overwrite_record(entity_type, entity_id, &payload)?;
                tx.remove_entry(current.id)?;
                let entry_id = self.requeue(tx, entity_type, entity_id, push_operation, &payload)?;
                Ok(ResolutionOutcome::Merged { entry_id, payload })
            }
        }
    }

    /// A tombstoned row keeps its delete queued so the deletion reaches the
    /// server, whatever strategy was asked for.
    fn keep_local_delete(
        &self,
        tx: &SyncTx<'_>,
        entity_type: &str,
        entity_id: &str,
        server_deleted: bool,
    ) -> Result<ResolutionOutcome, ResolveError> {
        if let Some(active) = tx.active_entry(entity_type, entity_id)? {
            return Ok(ResolutionOutcome::DeleteQueued { entry_id: active.id });
        }
        if server_deleted {
            tx.purge_record(entity_type, entity_id)?;
            return Ok(ResolutionOutcome::Discarded {
                reason: "deleted on both sides".to_string(),
            });
        }
        let entry_id = self.requeue(tx, entity_type, entity_id, SyncOperation::Delete, &Value::Null)?;
        Ok(ResolutionOutcome::DeleteQueued { entry_id })
    }

    fn requeue(
        &self,
        tx: &SyncTx<'_>,
        entity_type: &str,
        entity_id: &str,
        operation: SyncOperation,
        payload: &Value,
    ) -> Result<i64, ResolveError> {
        if operation == SyncOperation::Create {
            // An update queued meanwhile would target a record the server no longer has.
            tx.remove_active_entry(entity_type, entity_id)?;
        }
        let enqueued = tx.enqueue(entity_type, entity_id, operation, payload)?;
        let entry_id = match enqueued {
            Enqueued::Inserted(id) | Enqueued::Coalesced(id) => id,
            Enqueued::Collapsed(_) => {
                return Err(StorageError::InvalidOperation(format!(
                    "requeue of {entity_type} {entity_id} collapsed"
                ))
                .into());
            }
        };
        if let Some(max_retries) = self.config.requeue_max_retries {
            tx.set_max_retries(entry_id, max_retries)?;
        }
        Ok(entry_id)
    }

    /// Closes a conflict whose local and server payloads are identical.
    pub fn resolve_converged(
        &self,
        store: &SyncStore,
        entry: &QueueEntry,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let record = entry.conflict_record()?;
        if !record.is_converged()? {
            return Err(ResolveError::NotConverged { entry_id: entry.id });
        }
        let removed = store.with_transaction(|tx| tx.remove_entry(entry.id))?;
        if !removed {
            return Ok(ResolutionOutcome::AlreadyResolved);
        }
        info!(
            event = "conflict_resolved",
            entry_id = entry.id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            strategy = "converged",
            outcome = "converged",
        );
        Ok(ResolutionOutcome::Converged)
    }

    /// Closes every converged conflict, optionally for one entity type.
    pub fn close_converged(
        &self,
        store: &SyncStore,
        entity_type: Option<&str>,
    ) -> Result<SweepReport, ResolveError> {
        let mut report = SweepReport::default();
        for entry in store.conflicts(entity_type)? {
            report.conflicts_examined += 1;
            if !entry.conflict_record()?.is_converged()? {
                continue;
            }
            if self.resolve_converged(store, &entry)? == ResolutionOutcome::Converged {
                report.converged_closed += 1;
            }
        }
        Ok(report)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}
