use super::copy_stream::CopyStream;
use super::naming::table_name_for;
use super::registry::{InFlightRegistry, OperationContext};
use crate::config::TableConfig;
use crate::core::{DbError, Key, LogPosition, OperationId, ReplicaRole, Result, Value};
use crate::operation::{Operation, OperationData, OperationEnvelope};
use crate::replication::{
    ApplyContext, ApplyOutcome, InitializationParameters, OperationDataStream,
    ReplicatorTransaction, StateProvider,
};
use crate::storage::{PersistentTablePool, PoolStats, restore_from};
use crate::transaction::{DatabaseTransaction, PausedTransaction};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, Span, event, info_span};
use uuid::Uuid;

/// Identity bound by `initialize`
struct Partition {
    partition_id: String,
    replica_id: i64,
    name: String,
    table_name: String,
    initialization_context: Option<Vec<u8>>,
    provider_id: Uuid,
    span: Span,
}

/// Replicated key-value table.
///
/// Writes on the primary are applied speculatively to local storage, paused,
/// and parked in the in-flight registry until the replication framework
/// calls [`apply`](StateProvider::apply) for them. Replicas that did not
/// originate an operation apply it directly from its encoded form.
pub struct ReliableTable {
    config: TableConfig,
    partition: OnceLock<Partition>,
    role: RwLock<ReplicaRole>,
    tables: RwLock<Option<PersistentTablePool>>,
    in_flight: InFlightRegistry,
    /// Highest record number applied by the current inbound copy
    copy_progress: Mutex<Option<i64>>,
}

impl ReliableTable {
    pub fn new(config: TableConfig) -> Result<Self> {
        config.validate().map_err(DbError::ExecutionError)?;
        Ok(Self {
            config,
            partition: OnceLock::new(),
            role: RwLock::new(ReplicaRole::Unknown),
            tables: RwLock::new(None),
            in_flight: InFlightRegistry::new(),
            copy_progress: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Logical name, once initialized
    pub fn name(&self) -> Option<&str> {
        self.partition.get().map(|p| p.name.as_str())
    }

    /// Physical table name derived from the logical name
    pub fn table_name(&self) -> Option<&str> {
        self.partition.get().map(|p| p.table_name.as_str())
    }

    pub fn replica_id(&self) -> Option<i64> {
        self.partition.get().map(|p| p.replica_id)
    }

    pub fn provider_id(&self) -> Option<Uuid> {
        self.partition.get().map(|p| p.provider_id)
    }

    pub fn initialization_context(&self) -> Option<&[u8]> {
        self.partition
            .get()
            .and_then(|p| p.initialization_context.as_deref())
    }

    pub fn role(&self) -> ReplicaRole {
        match self.role.read() {
            Ok(role) => *role,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.tables.read().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Directory holding this partition's store
    pub fn store_directory(&self) -> Result<PathBuf> {
        let partition = self.partition()?;
        Ok(self.config.partition_directory(&partition.partition_id))
    }

    /// Operations applied speculatively and not yet finalized
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pool_stats(&self) -> Result<PoolStats> {
        Ok(self.pool()?.stats())
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Set `key` to `value`, returning the previous value.
    pub async fn set(
        &self,
        txn: &Arc<dyn ReplicatorTransaction>,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        self.execute(txn, Operation::set(key, value)).await
    }

    /// Remove `key`, returning the previous value.
    pub async fn delete(
        &self,
        txn: &Arc<dyn ReplicatorTransaction>,
        key: impl Into<Key>,
    ) -> Result<Option<Value>> {
        self.execute(txn, Operation::delete(key)).await
    }

    pub async fn execute(
        &self,
        txn: &Arc<dyn ReplicatorTransaction>,
        operation: Operation,
    ) -> Result<Option<Value>> {
        self.execute_with_id(txn, OperationId::new(), operation)
            .await
    }

    /// Pre-apply `operation` locally and record it in `txn`.
    ///
    /// The speculative transaction stays paused in the in-flight registry
    /// under `id` until the framework applies the operation. Registering an
    /// id that is already in flight fails with a protocol violation and
    /// leaves the existing entry untouched.
    pub async fn execute_with_id(
        &self,
        txn: &Arc<dyn ReplicatorTransaction>,
        id: OperationId,
        operation: Operation,
    ) -> Result<Option<Value>> {
        let partition = self.partition()?;
        let pool = self.pool()?;

        let mut transaction = pool.create_transaction().await?;
        let prepared = match prepare(&mut transaction, id, operation) {
            Ok(prepared) => prepared,
            Err(err) => {
                discard(transaction);
                return Err(err);
            }
        };
        let Prepared {
            previous,
            undo,
            redo,
        } = prepared;

        let context = OperationContext::new(Arc::clone(txn), transaction.pause()?);
        if let Err(rejected) = self.register(&pool, id, context) {
            let Some(rejected) = rejected else {
                event!(
                    parent: &partition.span,
                    Level::WARN,
                    operation = %id,
                    "table closed during pre-apply"
                );
                return Err(DbError::NotOpen);
            };
            discard(rejected.into_transaction().resume());
            event!(
                parent: &partition.span,
                Level::ERROR,
                operation = %id,
                "operation id already in flight"
            );
            return Err(DbError::ProtocolViolation(format!(
                "Operation with id {id} already in-progress"
            )));
        }

        if let Err(err) = txn.add_operation(undo, redo, &partition.name).await {
            if let Some(context) = self.in_flight.take(&id) {
                discard(context.into_transaction().resume());
            }
            event!(
                parent: &partition.span,
                Level::WARN,
                operation = %id,
                txn = txn.id(),
                error = %err,
                "replicator rejected operation"
            );
            return Err(err);
        }

        event!(
            parent: &partition.span,
            Level::TRACE,
            operation = %id,
            txn = txn.id(),
            "operation pre-applied"
        );
        Ok(previous)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Committed value of `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let pool = self.pool()?;
        let table = pool.take().await?;
        let value = table.get(key);
        pool.return_table(table);
        value
    }

    pub async fn len(&self) -> Result<usize> {
        let pool = self.pool()?;
        let table = pool.take().await?;
        let len = table.len();
        pool.return_table(table);
        len
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Every committed row in key order.
    pub async fn entries(&self) -> Result<Vec<(Key, Value)>> {
        let pool = self.pool()?;
        let table = pool.take().await?;
        let rows = table.get_range().collect::<Result<Vec<_>>>();
        pool.return_table(table);
        rows
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn partition(&self) -> Result<&Partition> {
        self.partition.get().ok_or(DbError::NotInitialized)
    }

    fn span(&self) -> Span {
        self.partition
            .get()
            .map(|p| p.span.clone())
            .unwrap_or_else(Span::none)
    }

    fn pool(&self) -> Result<PersistentTablePool> {
        self.tables.read()?.clone().ok_or(DbError::NotOpen)
    }

    /// Park `context` under `id` while `pool` is still the open pool.
    ///
    /// The slot stays read-locked across registration, so `close_pool` either
    /// drains the entry or the registration sees the slot change. A context
    /// refused because the table closed is discarded here and reported as
    /// `Err(None)`; a duplicate id hands the context back.
    fn register(
        &self,
        pool: &PersistentTablePool,
        id: OperationId,
        context: OperationContext,
    ) -> std::result::Result<(), Option<OperationContext>> {
        let tables = match self.tables.read() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tables.as_ref() {
            Some(current) if current.same_pool(pool) => {
                self.in_flight.register(id, context).map_err(Some)
            }
            _ => {
                drop(tables);
                discard(context.into_transaction().resume());
                Err(None)
            }
        }
    }

    fn take_pool(&self) -> Option<PersistentTablePool> {
        match self.tables.write() {
            Ok(mut tables) => tables.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn open_pool(&self) -> Result<PersistentTablePool> {
        let partition = self.partition()?;
        if partition.table_name.is_empty() {
            return Err(DbError::ExecutionError(format!(
                "Name '{}' has no characters usable in a table name",
                partition.name
            )));
        }
        PersistentTablePool::open(
            self.config.partition_directory(&partition.partition_id),
            &partition.table_name,
            &partition.name,
            &self.config,
        )
    }

    /// Roll back and dispose every paused transaction.
    fn discard_in_flight(&self, reason: &str) {
        let span = self.span();
        for (id, context) in self.in_flight.drain() {
            event!(
                parent: &span,
                Level::WARN,
                operation = %id,
                txn = context.replicator_transaction_id(),
                reason,
                "discarding in-flight operation"
            );
            discard(context.into_transaction().resume());
        }
    }

    fn discard_stale(&self, id: OperationId, paused: PausedTransaction, context: ApplyContext) {
        event!(
            parent: &self.span(),
            Level::WARN,
            operation = %id,
            context = %context,
            "discarding stale in-flight work"
        );
        discard(paused.resume());
    }

    fn close_pool(&self, reason: &str) -> Result<()> {
        let Some(pool) = self.take_pool() else {
            return Ok(());
        };
        self.discard_in_flight(reason);
        let flushed = pool.store().flush();
        pool.close();
        flushed
    }

    fn ensure_not_cancelled(cancel: &CancellationToken, step: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled(step.to_string()));
        }
        Ok(())
    }
}

struct Prepared {
    previous: Option<Value>,
    undo: OperationData,
    redo: OperationData,
}

/// Apply `operation` through `transaction` and encode both directions.
fn prepare(
    transaction: &mut DatabaseTransaction,
    id: OperationId,
    operation: Operation,
) -> Result<Prepared> {
    let previous = operation.apply(&mut transaction.table()?)?;
    let undo = operation.undo(previous.clone());
    Ok(Prepared {
        previous,
        undo: OperationEnvelope::new(id, undo).to_data()?,
        redo: OperationEnvelope::new(id, operation).to_data()?,
    })
}

fn apply_and_commit(transaction: &mut DatabaseTransaction, operation: &Operation) -> Result<()> {
    operation.apply(&mut transaction.table()?)?;
    transaction.commit()
}

/// Roll back if still active, then dispose.
fn discard(mut transaction: DatabaseTransaction) {
    if transaction.state().is_active()
        && let Err(err) = transaction.rollback()
    {
        tracing::warn!(txn = %transaction.id(), error = %err, "rollback failed");
    }
    transaction.dispose();
}

#[async_trait]
impl StateProvider for ReliableTable {
    fn initialize(&self, params: InitializationParameters) -> Result<()> {
        let partition_id = params.partition_id.simple().to_string();
        let span = info_span!(
            "reliable_table",
            partition = %partition_id,
            name = %params.name
        );
        let partition = Partition {
            table_name: table_name_for(&params.name),
            partition_id,
            replica_id: params.replica_id,
            name: params.name,
            initialization_context: params.initialization_context,
            provider_id: params.provider_id,
            span,
        };
        self.partition.set(partition).map_err(|_| {
            DbError::ExecutionError("State provider is already initialized".to_string())
        })?;
        event!(parent: &self.span(), Level::INFO, "initialized");
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        let span = self.span();
        if self.is_open() {
            return Err(DbError::AlreadyOpen);
        }
        let pool = self.open_pool()?;
        {
            let mut tables = self.tables.write()?;
            if tables.is_some() {
                pool.close();
                return Err(DbError::AlreadyOpen);
            }
            *tables = Some(pool.clone());
        }
        event!(
            parent: &span,
            Level::INFO,
            table = %pool.table_name(),
            directory = %pool.store().directory().display(),
            "opened"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            event!(parent: &self.span(), Level::DEBUG, "close on closed table");
            return Ok(());
        }
        self.close_pool("close")?;
        event!(parent: &self.span(), Level::INFO, "closed");
        Ok(())
    }

    fn abort(&self) {
        if let Err(err) = self.close_pool("abort") {
            event!(parent: &self.span(), Level::WARN, error = %err, "abort failed to flush");
        }
        event!(parent: &self.span(), Level::INFO, "aborted");
    }

    async fn change_role(&self, new_role: ReplicaRole, cancel: &CancellationToken) -> Result<()> {
        Self::ensure_not_cancelled(cancel, "change role")?;
        let previous = {
            let mut role = self.role.write()?;
            std::mem::replace(&mut *role, new_role)
        };
        event!(
            parent: &self.span(),
            Level::INFO,
            from = %previous,
            to = %new_role,
            in_flight = self.in_flight.len(),
            "role changed"
        );
        Ok(())
    }

    async fn on_data_loss(&self) -> Result<bool> {
        event!(parent: &self.span(), Level::WARN, "data loss reported");
        Ok(false)
    }

    async fn prepare_checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        Self::ensure_not_cancelled(cancel, "prepare checkpoint")?;
        event!(parent: &self.span(), Level::DEBUG, "prepare checkpoint");
        Ok(())
    }

    async fn perform_checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        Self::ensure_not_cancelled(cancel, "perform checkpoint")?;
        let pool = self.pool()?;
        pool.store().flush()?;
        event!(parent: &self.span(), Level::DEBUG, "checkpoint performed");
        Ok(())
    }

    async fn complete_checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        Self::ensure_not_cancelled(cancel, "complete checkpoint")?;
        event!(parent: &self.span(), Level::DEBUG, "complete checkpoint");
        Ok(())
    }

    async fn recover_checkpoint(&self) -> Result<()> {
        event!(parent: &self.span(), Level::DEBUG, "recover checkpoint");
        Ok(())
    }

    async fn on_recovery_completed(&self) -> Result<()> {
        event!(parent: &self.span(), Level::INFO, "recovery completed");
        Ok(())
    }

    async fn backup_checkpoint(
        &self,
        backup_directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pool = self.pool()?;
        let manifest = pool.store().backup_to(backup_directory, cancel)?;
        event!(
            parent: &self.span(),
            Level::INFO,
            directory = %backup_directory.display(),
            files = manifest.files.len(),
            bytes = manifest.total_bytes(),
            "backup written"
        );
        Ok(())
    }

    async fn restore_checkpoint(
        &self,
        backup_directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::ensure_not_cancelled(cancel, "restore checkpoint")?;
        let directory = self.store_directory()?;
        let was_open = self.is_open();
        self.close_pool("restore")?;

        let restored = restore_from(
            backup_directory,
            &directory,
            &self.config.store_file_stem,
            cancel,
        );

        // A failed restore still reopens a table that was open
        if was_open {
            match self.open_pool() {
                Ok(pool) => *self.tables.write()? = Some(pool),
                Err(err) if restored.is_ok() => return Err(err),
                Err(err) => event!(
                    parent: &self.span(),
                    Level::ERROR,
                    error = %err,
                    "reopen after failed restore failed"
                ),
            }
        }
        let manifest = restored?;
        event!(
            parent: &self.span(),
            Level::INFO,
            directory = %backup_directory.display(),
            rows = manifest.row_count,
            "backup restored"
        );
        Ok(())
    }

    async fn get_current_state(&self) -> Result<Box<dyn OperationDataStream>> {
        let stream = CopyStream::new(self.pool()?).await?;
        event!(parent: &self.span(), Level::INFO, "copy stream opened");
        Ok(Box::new(stream))
    }

    async fn begin_setting_current_state(&self) -> Result<()> {
        let pool = self.pool()?;
        pool.store().clear_table(pool.table_name())?;
        *self.copy_progress.lock()? = None;
        event!(parent: &self.span(), Level::INFO, "inbound copy started");
        Ok(())
    }

    async fn set_current_state(&self, record_number: i64, data: OperationData) -> Result<()> {
        let last = *self.copy_progress.lock()?;
        if let Some(last) = last
            && record_number <= last
        {
            event!(
                parent: &self.span(),
                Level::DEBUG,
                record_number,
                last,
                "skipping redelivered copy record"
            );
            return Ok(());
        }

        let envelopes = data
            .segments()
            .iter()
            .map(|segment| OperationEnvelope::decode(segment))
            .collect::<Result<Vec<_>>>()?;

        let mut transaction = self.pool()?.create_transaction().await?;
        let result = envelopes.iter().try_for_each(|envelope| {
            envelope
                .operation
                .apply(&mut transaction.table()?)
                .map(|_| ())
        });
        let result = result.and_then(|_| transaction.commit());
        discard(transaction);
        result?;

        *self.copy_progress.lock()? = Some(record_number);
        Ok(())
    }

    async fn end_setting_current_state(&self) -> Result<()> {
        let pool = self.pool()?;
        pool.store().flush()?;
        let records = self.copy_progress.lock()?.take();
        event!(
            parent: &self.span(),
            Level::INFO,
            last_record = ?records,
            rows = pool.store().row_count(pool.table_name())?,
            "inbound copy finished"
        );
        Ok(())
    }

    async fn prepare_for_remove(
        &self,
        txn: &dyn ReplicatorTransaction,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::ensure_not_cancelled(cancel, "prepare for remove")?;
        event!(
            parent: &self.span(),
            Level::INFO,
            txn = txn.id(),
            timeout = ?timeout,
            "prepare for remove"
        );
        Ok(())
    }

    async fn remove_state(&self, provider_id: Uuid) -> Result<()> {
        let directory = self.store_directory()?;
        self.close_pool("remove")?;
        if directory.exists() {
            std::fs::remove_dir_all(&directory).map_err(|e| {
                DbError::io(format!("Failed to remove {}", directory.display()), e)
            })?;
        }
        event!(
            parent: &self.span(),
            Level::INFO,
            provider = %provider_id,
            directory = %directory.display(),
            "state removed"
        );
        Ok(())
    }

    async fn apply(
        &self,
        position: LogPosition,
        _txn: &dyn ReplicatorTransaction,
        data: &OperationData,
        context: ApplyContext,
    ) -> Result<ApplyOutcome> {
        let span = self.span();
        let envelope = OperationEnvelope::from_data(data)?;
        let id = envelope.id;

        // The entry leaves the registry here so every exit path below owns it
        let speculative = match self.in_flight.take(&id) {
            Some(pending) if context.is_primary() => Some(pending.into_transaction()),
            Some(stale) => {
                self.discard_stale(id, stale.into_transaction(), context);
                None
            }
            None => None,
        };

        let (mut transaction, resumed) = match speculative {
            Some(paused) => (paused.resume(), true),
            None => (self.pool()?.create_transaction().await?, false),
        };

        if resumed && context.is_undo() {
            let rolled_back = transaction.rollback();
            transaction.dispose();
            rolled_back?;
            event!(parent: &span, Level::DEBUG, operation = %id, position, "operation undone");
            return Ok(ApplyOutcome::Discarded { id });
        }

        let result = if resumed {
            transaction.commit()
        } else {
            apply_and_commit(&mut transaction, &envelope.operation)
        };
        if let Err(err) = &result {
            event!(
                parent: &span,
                Level::ERROR,
                operation = %id,
                position,
                context = %context,
                error = %err,
                "apply failed"
            );
        }
        discard(transaction);
        result?;

        event!(
            parent: &span,
            Level::TRACE,
            operation = %id,
            position,
            context = %context,
            resumed,
            "operation applied"
        );
        Ok(ApplyOutcome::Committed { id, resumed })
    }

    fn unlock(&self, outcome: &ApplyOutcome) {
        event!(parent: &self.span(), Level::TRACE, operation = %outcome.id(), "unlock");
    }

    fn get_children(&self, _name: &str) -> Vec<Arc<dyn StateProvider>> {
        Vec::new()
    }
}
