//! In-process replicator used to drive state providers in tests and tools.
//!
//! Operations recorded into a [`SimulatedTransaction`] are delivered to the
//! primary provider in order on commit and in reverse order as undo on abort.
//! Committed records are kept as a log that can be replayed to other replicas.

use super::{ApplyContext, ApplyOutcome, OperationDataStream, ReplicatorTransaction, StateProvider};
use crate::core::{DbError, LogPosition, ReplicaRole, Result};
use crate::operation::OperationData;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A committed redo record
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub position: LogPosition,
    pub transaction_id: i64,
    pub data: OperationData,
}

pub struct SimulatedTransaction {
    id: i64,
    /// (undo, redo) pairs in recording order
    operations: Mutex<Vec<(OperationData, OperationData)>>,
    fail_next_add: AtomicBool,
}

impl SimulatedTransaction {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            operations: Mutex::new(Vec::new()),
            fail_next_add: AtomicBool::new(false),
        }
    }

    /// Make the next `add_operation` call fail.
    pub fn fail_next_add_operation(&self) {
        self.fail_next_add.store(true, Ordering::SeqCst);
    }

    pub fn operation_count(&self) -> usize {
        self.operations.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    fn take_operations(&self) -> Result<Vec<(OperationData, OperationData)>> {
        let mut operations = self.operations.lock()?;
        Ok(std::mem::take(&mut *operations))
    }
}

#[async_trait]
impl ReplicatorTransaction for SimulatedTransaction {
    fn id(&self) -> i64 {
        self.id
    }

    async fn add_operation(
        &self,
        undo: OperationData,
        redo: OperationData,
        state_provider: &str,
    ) -> Result<()> {
        if self.fail_next_add.swap(false, Ordering::SeqCst) {
            return Err(DbError::ExecutionError(format!(
                "replicator rejected operation for '{state_provider}' in transaction {}",
                self.id
            )));
        }
        self.operations.lock()?.push((undo, redo));
        Ok(())
    }
}

pub struct SimulatedReplicator {
    primary: Arc<dyn StateProvider>,
    next_position: AtomicI64,
    next_transaction: AtomicI64,
    log: Mutex<Vec<LogRecord>>,
}

impl SimulatedReplicator {
    pub fn new(primary: Arc<dyn StateProvider>) -> Self {
        Self {
            primary,
            next_position: AtomicI64::new(1),
            next_transaction: AtomicI64::new(1),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn primary(&self) -> &Arc<dyn StateProvider> {
        &self.primary
    }

    pub fn begin_transaction(&self) -> Arc<SimulatedTransaction> {
        let id = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        Arc::new(SimulatedTransaction::new(id))
    }

    /// Replicate and apply every recorded redo on the primary, in order.
    pub async fn commit(&self, txn: &SimulatedTransaction) -> Result<Vec<ApplyOutcome>> {
        let mut outcomes = Vec::new();
        for (_, redo) in txn.take_operations()? {
            let position = self.next_position.fetch_add(1, Ordering::SeqCst);
            self.log.lock()?.push(LogRecord {
                position,
                transaction_id: txn.id,
                data: redo.clone(),
            });
            outcomes.push(
                self.primary
                    .apply(position, txn, &redo, ApplyContext::PRIMARY_REDO)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    /// Deliver every recorded undo to the primary, newest first.
    pub async fn abort(&self, txn: &SimulatedTransaction) -> Result<Vec<ApplyOutcome>> {
        let position = self.last_position();
        let mut outcomes = Vec::new();
        for (undo, _) in txn.take_operations()?.into_iter().rev() {
            outcomes.push(
                self.primary
                    .apply(position, txn, &undo, ApplyContext::PRIMARY_UNDO)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    /// Deliver arbitrary data to the primary at the next log position.
    pub async fn deliver(&self, data: &OperationData, context: ApplyContext) -> Result<ApplyOutcome> {
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        let txn = SimulatedTransaction::new(self.next_transaction.fetch_add(1, Ordering::SeqCst));
        self.primary.apply(position, &txn, data, context).await
    }

    pub fn last_position(&self) -> LogPosition {
        self.next_position.load(Ordering::SeqCst) - 1
    }

    pub fn log(&self) -> Vec<LogRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Replay the committed log onto another replica.
    pub async fn replay_to(&self, replica: &dyn StateProvider, context: ApplyContext) -> Result<usize> {
        let records = self.log();
        for record in &records {
            let txn = SimulatedTransaction::new(record.transaction_id);
            replica.apply(record.position, &txn, &record.data, context).await?;
        }
        Ok(records.len())
    }

    /// Build `replica` from the primary's current state.
    pub async fn copy_to(&self, replica: &dyn StateProvider, cancel: &CancellationToken) -> Result<i64> {
        let mut stream: Box<dyn OperationDataStream> = self.primary.get_current_state().await?;
        replica.begin_setting_current_state().await?;
        let mut record_number = 0;
        while let Some(data) = stream.get_next(cancel).await? {
            replica.set_current_state(record_number, data).await?;
            record_number += 1;
        }
        replica.end_setting_current_state().await?;
        Ok(record_number)
    }

    pub async fn change_role(&self, role: ReplicaRole) -> Result<()> {
        self.primary
            .change_role(role, &CancellationToken::new())
            .await
    }
}
