// ============================================================================
// Replication Framework Contract
// ============================================================================
//
// The consensus/replication framework is an external collaborator. It owns
// log positions, roles and replicator transactions, and drives a state
// provider through the lifecycle below. `simulated` holds an in-process
// stand-in used by the tests.
//
// ============================================================================

pub mod context;
pub mod simulated;

pub use context::{ApplyContext, ApplyKind, ApplyOutcome, ApplyRole, InitializationParameters};

use crate::core::{LogPosition, ReplicaRole, Result};
use crate::operation::OperationData;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Replicator-side transaction a write is recorded into.
#[async_trait]
pub trait ReplicatorTransaction: Send + Sync {
    fn id(&self) -> i64;

    /// Record one operation: `undo` reverses `redo`.
    async fn add_operation(
        &self,
        undo: OperationData,
        redo: OperationData,
        state_provider: &str,
    ) -> Result<()>;
}

/// Pull-based stream of full-state records for a joining replica.
#[async_trait]
pub trait OperationDataStream: Send {
    /// Next record, or `None` once the stream is exhausted.
    async fn get_next(&mut self, cancel: &CancellationToken) -> Result<Option<OperationData>>;
}

/// Lifecycle contract a state provider exposes to the replication framework.
#[async_trait]
pub trait StateProvider: Send + Sync {
    fn initialize(&self, params: InitializationParameters) -> Result<()>;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Tear down without reporting failures.
    fn abort(&self);

    async fn change_role(&self, new_role: ReplicaRole, cancel: &CancellationToken) -> Result<()>;

    /// Returns whether the provider changed its state.
    async fn on_data_loss(&self) -> Result<bool>;

    async fn prepare_checkpoint(&self, cancel: &CancellationToken) -> Result<()>;

    async fn perform_checkpoint(&self, cancel: &CancellationToken) -> Result<()>;

    async fn complete_checkpoint(&self, cancel: &CancellationToken) -> Result<()>;

    async fn recover_checkpoint(&self) -> Result<()>;

    async fn on_recovery_completed(&self) -> Result<()>;

    async fn backup_checkpoint(&self, backup_directory: &Path, cancel: &CancellationToken)
    -> Result<()>;

    async fn restore_checkpoint(
        &self,
        backup_directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn get_current_state(&self) -> Result<Box<dyn OperationDataStream>>;

    async fn begin_setting_current_state(&self) -> Result<()>;

    async fn set_current_state(&self, record_number: i64, data: OperationData) -> Result<()>;

    async fn end_setting_current_state(&self) -> Result<()>;

    async fn prepare_for_remove(
        &self,
        txn: &dyn ReplicatorTransaction,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn remove_state(&self, provider_id: Uuid) -> Result<()>;

    async fn apply(
        &self,
        position: LogPosition,
        txn: &dyn ReplicatorTransaction,
        data: &OperationData,
        context: ApplyContext,
    ) -> Result<ApplyOutcome>;

    fn unlock(&self, outcome: &ApplyOutcome);

    fn get_children(&self, name: &str) -> Vec<Arc<dyn StateProvider>>;
}
