// ============================================================================
// Replicated Table Library
// ============================================================================

//! Replicated key-value table state machine.
//!
//! ```no_run
//! use replicated_table::replication::simulated::SimulatedReplicator;
//! use replicated_table::{InitializationParameters, ReliableTable, StateProvider, TableConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> replicated_table::Result<()> {
//! let table = Arc::new(ReliableTable::new(TableConfig::new("/var/lib/tables"))?);
//! table.initialize(InitializationParameters::new(uuid::Uuid::new_v4(), "fabric:/journal"))?;
//! table.open().await?;
//!
//! let replicator = SimulatedReplicator::new(table.clone());
//! let txn = replicator.begin_transaction();
//! let handle: Arc<dyn replicated_table::ReplicatorTransaction> = txn.clone();
//! table.set(&handle, b"key".to_vec(), b"value".to_vec()).await?;
//! replicator.commit(&txn).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod operation;
pub mod replication;
pub mod state_machine;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use config::{PoolConfig, TableConfig};
pub use crate::core::{DbError, Key, LogPosition, OperationId, ReplicaRole, Result, Value};
pub use operation::{KeyValueTable, Operation, OperationData, OperationEnvelope, OperationKind};
pub use replication::{
    ApplyContext, ApplyKind, ApplyOutcome, ApplyRole, InitializationParameters,
    OperationDataStream, ReplicatorTransaction, StateProvider,
};
pub use state_machine::{CopyStream, ReliableTable};
pub use storage::{DurabilityMode, PersistentStore, PersistentTablePool, PoolStats};
pub use transaction::{DatabaseTransaction, PausedTransaction, TransactionState};
