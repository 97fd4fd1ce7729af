// ============================================================================
// Transaction Management Module
// ============================================================================
//
// A DatabaseTransaction couples a storage transaction (a private write set
// committed atomically through the store's WAL) with a pooled table handle.
//
// Lifecycle:
// - Active:  reads see committed rows plus the transaction's own writes
// - Paused:  ownership parked elsewhere (the in-flight registry) between
//            two callbacks; no storage-level effect
// - Committed / RolledBack: terminal
// - Disposed: handle back in the pool; enforced once by `dispose(self)`
//
// ============================================================================

pub mod database;
pub mod state;

pub use database::{DatabaseTransaction, PausedTransaction, TransactionTable};
pub use state::{TransactionId, TransactionState};
